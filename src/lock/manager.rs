//! Per-page distributed locks with wait and lease timeouts

use super::broker::LockBroker;
use crate::common::{Error, LockConfig, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Proof of one successful acquisition. Ownership is tied to the token,
/// so two workers in the same process never release each other's lock.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    token: String,
    acquired_at: Instant,
    lease: Duration,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the lease has run out locally (the broker may already have
    /// handed the key to someone else).
    pub fn lease_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.lease
    }
}

pub struct DistributedLockManager {
    broker: Arc<dyn LockBroker>,
    holder_id: String,
    poll_interval: Duration,
}

impl DistributedLockManager {
    pub fn new(broker: Arc<dyn LockBroker>, holder_id: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            broker,
            holder_id: holder_id.into(),
            poll_interval,
        }
    }

    pub fn from_config(broker: Arc<dyn LockBroker>, holder_id: impl Into<String>, config: &LockConfig) -> Self {
        Self::new(broker, holder_id, config.poll_interval())
    }

    fn new_token(&self) -> String {
        format!("{}:{}", self.holder_id, Uuid::new_v4())
    }

    /// Wait up to `wait` for `key`. `Ok(None)` means the wait elapsed.
    pub async fn try_acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockHandle>> {
        let token = self.new_token();
        let deadline = Instant::now() + wait;
        loop {
            if self.broker.try_lock(key, &token, lease).await? {
                tracing::debug!(key, token = %token, "lock acquired");
                return Ok(Some(LockHandle {
                    key: key.to_string(),
                    token,
                    acquired_at: Instant::now(),
                    lease,
                }));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Like `try_acquire`, but a timeout is an `Error::LockAcquisition`.
    pub async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> Result<LockHandle> {
        self.try_acquire(key, wait, lease)
            .await?
            .ok_or_else(|| Error::LockAcquisition {
                key: key.to_string(),
                waited_ms: wait.as_millis() as u64,
            })
    }

    /// Release a lock. A handle whose lock is no longer held (lease expired,
    /// taken over) is a warning, not an error.
    pub async fn release(&self, handle: LockHandle) -> Result<bool> {
        let released = self.broker.unlock(&handle.key, &handle.token).await?;
        if !released {
            tracing::warn!(
                key = %handle.key,
                held_ms = handle.acquired_at.elapsed().as_millis() as u64,
                "released a lock this worker no longer holds"
            );
        }
        Ok(released)
    }

    /// Run `f` while holding `key`.
    ///
    /// The lock is released whether or not `f` fails. A failure of `f` wins
    /// over a failure to release; a release failure after `f` succeeded is
    /// returned as the error (the lease frees the key eventually).
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.acquire(key, wait, lease).await?;
        let result = f().await;
        if handle.lease_expired() {
            tracing::warn!(
                key,
                lease_ms = lease.as_millis() as u64,
                "lease ran out while the lock was held, another worker may have taken the key"
            );
        }
        let released = self.release(handle).await;
        match (result, released) {
            (Err(e), Err(release_err)) => {
                tracing::warn!(key, error = %release_err, "lock release failed after error");
                Err(e)
            }
            (Err(e), Ok(_)) => Err(e),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Ok(value), Ok(_)) => Ok(value),
        }
    }

    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        Ok(self.broker.owner(key).await?.is_some())
    }
}
