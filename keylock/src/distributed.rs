use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{Lock, LockError, LockProvider};

/// Shared key/value store offering the two atomic primitives a token mutex needs.
#[async_trait::async_trait]
pub trait LockStore: fmt::Debug + Send + Sync {
    /// Store `token` under `key` unless the key is already set. Returns whether
    /// the value was stored. The entry expires after `ttl`.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete `key` only if it still holds `token`. Returns whether it was deleted.
    async fn delete_if_equals(&self, key: &str, token: &str) -> Result<bool, LockError>;
}

#[async_trait::async_trait]
impl<S: LockStore + ?Sized> LockStore for Arc<S> {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        (**self).set_if_absent(key, token, ttl).await
    }

    async fn delete_if_equals(&self, key: &str, token: &str) -> Result<bool, LockError> {
        (**self).delete_if_equals(key, token).await
    }
}

/// An in-memory [`LockStore`] with expiring entries.
#[derive(Debug, Default, Clone)]
pub struct MemoryLockStore {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryLockStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                entries.insert(key.to_owned(), (token.to_owned(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|(held, _)| held == token) {
            entries.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Token mutex over a [`LockStore`].
///
/// Acquirers write a fresh random token with set-if-absent and poll until it
/// sticks. Release deletes the key only if it still holds the caller's token, so
/// a holder whose lock expired cannot free somebody else's.
#[derive(Debug, Clone)]
pub struct DistributedLocks {
    store: Arc<dyn LockStore>,
    poll: Duration,
}

impl DistributedLocks {
    /// Poll `store` every `poll` while waiting.
    pub fn new<S: LockStore + 'static>(store: S, poll: Duration) -> Self {
        Self {
            store: Arc::new(store),
            poll,
        }
    }
}

#[async_trait::async_trait]
impl LockProvider for DistributedLocks {
    fn name(&self) -> &'static str {
        "distributed"
    }

    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lock, LockError> {
        let token = uuid::Uuid::new_v4().to_string();
        let started = tokio::time::Instant::now();
        let deadline = started + ttl;

        loop {
            if self.store.set_if_absent(key, &token, ttl).await? {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::debug!(%key, "gave up waiting for lock");
                return Err(LockError::Timeout {
                    key: key.to_owned(),
                    waited: now - started,
                });
            }
            tokio::time::sleep(self.poll.min(deadline - now)).await;
        }

        let store = Arc::clone(&self.store);
        let owned_key = key.to_owned();
        Ok(Lock::new(key, move || {
            Box::pin(async move {
                match store.delete_if_equals(&owned_key, &token).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(key = %owned_key, "lock expired before release"),
                    Err(error) => {
                        tracing::warn!(key = %owned_key, %error, "failed to release lock")
                    }
                }
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::Locks;

    fn provider(store: &MemoryLockStore) -> DistributedLocks {
        DistributedLocks::new(store.clone(), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn times_out_while_held() {
        let store = MemoryLockStore::new();
        let locks = provider(&store);

        let held = locks.acquire("k", Duration::from_secs(5)).await.unwrap();
        let err = locks
            .acquire("k", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { ref key, .. } if key == "k"));

        held.release().await;
        let lock = locks.acquire("k", Duration::from_millis(30)).await.unwrap();
        lock.release().await;
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let store = MemoryLockStore::new();
        assert!(store.set_if_absent("k", "mine", Duration::from_secs(5)).await.unwrap());
        assert!(!store.delete_if_equals("k", "theirs").await.unwrap());
        assert!(!store.set_if_absent("k", "theirs", Duration::from_secs(5)).await.unwrap());
        assert!(store.delete_if_equals("k", "mine").await.unwrap());
        assert!(store.set_if_absent("k", "theirs", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let store = MemoryLockStore::new();
        let locks = provider(&store);

        let stale = locks.acquire("k", Duration::from_millis(20)).await.unwrap();
        let fresh = locks.acquire("k", Duration::from_secs(1)).await.unwrap();

        // The stale holder's release must not free the new holder's lock.
        stale.release().await;
        assert!(!store.set_if_absent("k", "other", Duration::from_secs(1)).await.unwrap());
        fresh.release().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn serializes_tasks() {
        let store = MemoryLockStore::new();
        let locks = Locks::new(provider(&store));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8).map(|_| {
            let locks = locks.clone();
            let running = running.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                locks
                    .run_with_lock("k", Duration::from_secs(5), async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(3)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            })
        });
        futures::future::join_all(tasks).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
