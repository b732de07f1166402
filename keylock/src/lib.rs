//! Per-key mutual exclusion.
//!
//! A [`Locks`] handle guarantees that at most one task holding a given key runs at
//! a time. Proxy caches use it to coalesce concurrent cache misses into a single
//! upstream request, and index writers use it to serialize read-modify-write cycles.
//!
//! Two providers implement [`LockProvider`]:
//!
//! - [`LocalLocks`]: a FIFO queue per key inside this process.
//! - [`DistributedLocks`]: a token mutex over a shared [`LockStore`], polled until
//!   acquired or the TTL runs out.
//!
//! ```
//! # async fn example() -> Result<(), keylock::LockError> {
//! use std::time::Duration;
//!
//! let locks = keylock::Locks::local();
//! let value = locks
//!     .run_with_lock("proxy:hub:library/alpine", Duration::from_secs(30), async { 42 })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::{fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

use serde::Deserialize;

mod distributed;
mod local;

pub use distributed::{DistributedLocks, LockStore, MemoryLockStore};
pub use local::LocalLocks;

/// A boxed, sendable future.
pub type BoxFut<'f, O> = Pin<Box<dyn Future<Output = O> + Send + 'f>>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Default time-to-live for a lock, and the longest a caller waits to acquire one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Errors raised while acquiring or releasing a lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock stayed held by someone else for the whole TTL.
    #[error("timed out acquiring lock {key} after {waited:?}")]
    Timeout {
        /// The contended key.
        key: String,
        /// How long the caller polled.
        waited: Duration,
    },

    /// The backing lock store failed.
    #[error("lock store: {0}")]
    Store(#[source] BoxError),
}

/// A held lock.
///
/// Call [`Lock::release`] when done. Dropping a lock without releasing it still
/// frees it; for distributed locks the release then runs on a spawned task.
pub struct Lock {
    key: String,
    release: Option<Box<dyn FnOnce() -> BoxFut<'static, ()> + Send>>,
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.key)
            .field("held", &self.release.is_some())
            .finish()
    }
}

impl Lock {
    /// Construct a lock which runs `release` exactly once.
    pub fn new<F>(key: impl Into<String>, release: F) -> Self
    where
        F: FnOnce() -> BoxFut<'static, ()> + Send + 'static,
    {
        Self {
            key: key.into(),
            release: Some(Box::new(release)),
        }
    }

    /// The key this lock guards.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock and wait for the release to complete.
    pub async fn release(mut self) {
        if let Some(release) = self.release.take() {
            release().await;
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            let release = release();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(release);
                }
                Err(_) => {
                    tracing::warn!(
                        key = %self.key,
                        "lock dropped outside a runtime; left to expire",
                    );
                }
            }
        }
    }
}

/// A source of per-key locks.
#[async_trait::async_trait]
pub trait LockProvider: fmt::Debug + Send + Sync {
    /// A short name for logs.
    fn name(&self) -> &'static str;

    /// Wait until `key` is free and take it. `ttl` bounds both how long the lock
    /// may be held before it expires and how long the caller waits, for providers
    /// which support expiry.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lock, LockError>;
}

/// Which lock provider to build, as written in the server configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum LockConfig {
    /// In-process FIFO queues.
    #[default]
    Local,

    /// Token mutex over a lock store, polled every `poll_interval_ms`.
    Distributed {
        /// Poll interval while waiting for a held lock.
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },
}

fn default_poll_interval_ms() -> u64 {
    100
}

/// A cloneable handle to the configured lock provider.
#[derive(Debug, Clone)]
pub struct Locks {
    provider: Arc<dyn LockProvider>,
}

impl Locks {
    /// Wrap a provider.
    pub fn new<P: LockProvider + 'static>(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }

    /// In-process locks.
    pub fn local() -> Self {
        Self::new(LocalLocks::new())
    }

    /// Build the provider named by the configuration.
    ///
    /// The distributed provider is backed by a [`MemoryLockStore`] here; use
    /// [`Locks::new`] with [`DistributedLocks::new`] to share a real store.
    pub fn from_config(config: &LockConfig) -> Self {
        match config {
            LockConfig::Local => Self::local(),
            LockConfig::Distributed { poll_interval_ms } => Self::new(DistributedLocks::new(
                MemoryLockStore::new(),
                Duration::from_millis(*poll_interval_ms),
            )),
        }
    }

    /// The underlying provider.
    pub fn provider(&self) -> &dyn LockProvider {
        self.provider.as_ref()
    }

    /// Run `task` while holding `key`.
    ///
    /// The lock is released once the task settles, whatever its output. Only lock
    /// acquisition can fail here; task errors are part of `T`.
    #[tracing::instrument(
        level = "trace",
        skip(self, task),
        fields(provider = self.provider.name())
    )]
    pub async fn run_with_lock<F, T>(
        &self,
        key: &str,
        ttl: Duration,
        task: F,
    ) -> Result<T, LockError>
    where
        F: Future<Output = T>,
    {
        let lock = self.provider.acquire(key, ttl).await?;
        tracing::trace!("acquired");
        let output = task.await;
        lock.release().await;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_selects_provider() {
        let locks = Locks::from_config(&LockConfig::Local);
        assert_eq!(locks.provider().name(), "local");

        let locks = Locks::from_config(&LockConfig::Distributed {
            poll_interval_ms: 10,
        });
        assert_eq!(locks.provider().name(), "distributed");
    }

    #[tokio::test]
    async fn run_with_lock_returns_task_output() {
        let locks = Locks::local();
        let out: Result<u8, &str> = locks
            .run_with_lock("k", DEFAULT_TTL, async { Err("upstream said no") })
            .await
            .unwrap();
        assert_eq!(out, Err("upstream said no"));

        // The failed task released the key.
        let out = locks.run_with_lock("k", DEFAULT_TTL, async { 1 }).await.unwrap();
        assert_eq!(out, 1);
    }
}
