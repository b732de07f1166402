use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::{Lock, LockError, LockProvider};

type Queue = Arc<tokio::sync::Mutex<()>>;

/// In-process locks: one FIFO queue per key.
///
/// Each acquirer waits for every earlier acquirer of the same key to settle,
/// in arrival order. A key's queue is dropped once nobody holds or awaits it,
/// so the table only grows with the number of contended keys.
#[derive(Debug, Default, Clone)]
pub struct LocalLocks {
    queues: Arc<Mutex<HashMap<String, Queue>>>,
}

impl LocalLocks {
    /// An empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    /// Whether no key is held or awaited.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A claim on a key's queue, held from enqueueing until release.
///
/// Dropping the last claim on a key removes its queue, whether the claimant
/// held the lock or gave up while waiting.
struct Ticket {
    queues: Arc<Mutex<HashMap<String, Queue>>>,
    key: String,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut queues = self.queues.lock();
        if queues
            .get(&self.key)
            .is_some_and(|queue| Arc::strong_count(queue) == 1)
        {
            queues.remove(&self.key);
        }
    }
}

#[async_trait::async_trait]
impl LockProvider for LocalLocks {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn acquire(&self, key: &str, _ttl: Duration) -> Result<Lock, LockError> {
        let (ticket, queue) = {
            let mut queues = self.queues.lock();
            let queue = Arc::clone(queues.entry(key.to_owned()).or_default());
            let ticket = Ticket {
                queues: Arc::clone(&self.queues),
                key: key.to_owned(),
            };
            (ticket, queue)
        };

        // tokio's mutex hands the lock to waiters in FIFO order.
        let guard = queue.lock_owned().await;

        Ok(Lock::new(key, move || {
            drop(guard);
            drop(ticket);
            Box::pin(std::future::ready(()))
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{Locks, DEFAULT_TTL};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_task_per_key_at_a_time() {
        let provider = LocalLocks::new();
        let locks = Locks::new(provider.clone());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..16).map(|_| {
            let locks = locks.clone();
            let running = running.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                locks
                    .run_with_lock("index.json", DEFAULT_TTL, async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            })
        });
        futures::future::join_all(tasks).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(provider.is_empty(), "drained queues are removed");
    }

    #[tokio::test]
    async fn waiters_run_in_arrival_order() {
        let locks = Locks::local();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.provider().acquire("k", DEFAULT_TTL).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .run_with_lock("k", DEFAULT_TTL, async { order.lock().push(i) })
                    .await
                    .unwrap();
            }));
            // Let each waiter enqueue before the next is spawned.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        first.release().await;
        futures::future::join_all(handles).await;
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let provider = LocalLocks::new();
        let a = provider.acquire("a", DEFAULT_TTL).await.unwrap();
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            provider.acquire("b", DEFAULT_TTL),
        )
        .await
        .expect("other keys are free")
        .unwrap();
        assert_eq!(provider.len(), 2);
        a.release().await;
        b.release().await;
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn abandoned_waiters_leave_no_queue_behind() {
        let provider = LocalLocks::new();
        let held = provider.acquire("k", DEFAULT_TTL).await.unwrap();

        let mut waiter = provider.acquire("k", DEFAULT_TTL);
        assert!(futures::poll!(&mut waiter).is_pending());

        held.release().await;
        assert_eq!(provider.len(), 1, "the waiter still claims the key");

        drop(waiter);
        assert!(provider.is_empty());

        let timed_out = tokio::time::timeout(Duration::from_millis(20), async {
            let _held = provider.acquire("k", DEFAULT_TTL).await.unwrap();
            provider.acquire("k", DEFAULT_TTL).await
        })
        .await;
        assert!(timed_out.is_err());
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn dropping_a_lock_releases_it() {
        let provider = LocalLocks::new();
        {
            let _lock = provider.acquire("k", DEFAULT_TTL).await.unwrap();
        }
        let lock = tokio::time::timeout(
            Duration::from_millis(100),
            provider.acquire("k", DEFAULT_TTL),
        )
        .await
        .expect("dropped lock is free")
        .unwrap();
        lock.release().await;
    }
}
