//! Lock broker abstraction and the in-process implementation

use crate::common::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// External mutual-exclusion service.
///
/// Implementations must be safe to share between workers and processes:
/// a lock is owned by the token that took it, and expires after its lease.
/// Connectivity problems surface as `Error::LockBrokerUnavailable`.
#[async_trait]
pub trait LockBroker: Send + Sync {
    /// Take `key` for `token` if it is free or its lease has expired.
    async fn try_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool>;

    /// Release `key` if `token` still owns it. Returns whether it did.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool>;

    /// Current owner of `key`, if any
    async fn owner(&self, key: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// Broker living inside the current process. Gives real mutual exclusion
/// between workers sharing one instance; separate processes need
/// `FileLockBroker` or another shared service.
#[derive(Default)]
pub struct InMemoryLockBroker {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLockBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBroker for InMemoryLockBroker {
    async fn try_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        if token.is_empty() {
            return Err(Error::InvalidConfig("lock token must not be empty".into()));
        }
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some(held) if held.expires_at > now && held.token != token => Ok(false),
            _ => {
                leases.insert(
                    key.to_string(),
                    Lease {
                        token: token.to_string(),
                        expires_at: now + lease,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some(held) if held.token == token && held.expires_at > now => {
                leases.remove(key);
                Ok(true)
            }
            Some(held) if held.expires_at <= now => {
                leases.remove(key);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    async fn owner(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .leases
            .lock()
            .await
            .get(key)
            .filter(|l| l.expires_at > now)
            .map(|l| l.token.clone()))
    }
}
