//! Lock broker backed by a directory that every orchestrator process can see
//!
//! Each key gets a subdirectory named by the BLAKE3 hash of the key. Inside
//! it, lease records are numbered generations; the highest generation is the
//! current state of the key. Taking or releasing a key means publishing
//! generation `n + 1` after reading generation `n`, and publishing is an
//! atomic create (`hard_link` of a fully written temp file), so of several
//! processes racing from the same generation exactly one wins.
//!
//! Expiry uses wall-clock milliseconds, so hosts sharing the directory need
//! roughly synchronized clocks. A released key keeps a single marker record.

use super::broker::LockBroker;
use crate::common::{blake3_hash, timestamp_now_millis, Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Re-reads tolerated when a generation disappears under a concurrent prune
const READ_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LeaseRecord {
    key: String,
    /// Empty once released
    token: String,
    expires_at_ms: u64,
}

impl LeaseRecord {
    fn is_active(&self, now_ms: u64) -> bool {
        !self.token.is_empty() && self.expires_at_ms > now_ms
    }
}

pub struct FileLockBroker {
    root: PathBuf,
}

impl FileLockBroker {
    /// Use `root` as the shared lease directory, creating it if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| unavailable(&root, e))?;
        tracing::info!("File lock broker at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &str) -> PathBuf {
        self.root.join(blake3_hash(key.as_bytes()))
    }

    /// Run blocking filesystem work off the async workers
    async fn blocking<T, F>(f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| Error::LockBrokerUnavailable(format!("lock task failed: {}", e)))?
    }
}

fn unavailable(path: &Path, e: std::io::Error) -> Error {
    Error::LockBrokerUnavailable(format!("{}: {}", path.display(), e))
}

fn generation_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{:020}", generation))
}

/// Highest generation in `dir` with its record, `None` for a fresh key
fn latest(dir: &Path) -> Result<Option<(u64, LeaseRecord)>> {
    for _ in 0..READ_ATTEMPTS {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(dir, e)),
        };
        let mut newest = None;
        for entry in entries {
            let entry = entry.map_err(|e| unavailable(dir, e))?;
            let name = entry.file_name();
            // temp files start with '.'
            if let Some(generation) = name.to_str().and_then(|n| n.parse::<u64>().ok()) {
                newest = newest.max(Some(generation));
            }
        }
        let Some(generation) = newest else {
            return Ok(None);
        };
        let path = generation_path(dir, generation);
        match fs::read(&path) {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Corrupted(format!("{}: {}", path.display(), e)))?;
                return Ok(Some((generation, record)));
            }
            // pruned by a newer generation, look again
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(unavailable(&path, e)),
        }
    }
    Err(Error::LockBrokerUnavailable(format!(
        "{}: lease records kept changing while reading",
        dir.display()
    )))
}

/// Atomically create `generation`. `false` if another process got there first.
fn publish(dir: &Path, generation: u64, record: &LeaseRecord) -> Result<bool> {
    let temp = dir.join(format!(".{}", Uuid::new_v4()));
    let bytes = serde_json::to_vec(record)?;
    let written = fs::File::create(&temp).and_then(|mut file| {
        file.write_all(&bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(unavailable(&temp, e));
    }
    let linked = fs::hard_link(&temp, generation_path(dir, generation));
    let _ = fs::remove_file(&temp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(unavailable(dir, e)),
    }
}

/// Remove generations older than `current`. Best effort.
fn prune(dir: &Path, current: u64) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if let Some(generation) = name.to_str().and_then(|n| n.parse::<u64>().ok()) {
            if generation < current {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

fn try_lock_at(dir: &Path, key: &str, token: &str, lease: Duration) -> Result<bool> {
    fs::create_dir_all(dir).map_err(|e| unavailable(dir, e))?;
    let now = timestamp_now_millis();
    let current = latest(dir)?;
    if let Some((_, held)) = &current {
        if held.is_active(now) && held.token != token {
            return Ok(false);
        }
    }

    let next = current.map(|(generation, _)| generation + 1).unwrap_or(1);
    let record = LeaseRecord {
        key: key.to_string(),
        token: token.to_string(),
        expires_at_ms: now.saturating_add(lease.as_millis() as u64),
    };
    if !publish(dir, next, &record)? {
        return Ok(false);
    }
    // a generation pruned under us can be recreated below the real head
    match latest(dir)? {
        Some((head, _)) if head == next => {}
        _ => {
            let _ = fs::remove_file(generation_path(dir, next));
            return Ok(false);
        }
    }
    prune(dir, next);
    Ok(true)
}

fn unlock_at(dir: &Path, key: &str, token: &str) -> Result<bool> {
    let Some((generation, held)) = latest(dir)? else {
        return Ok(false);
    };
    if held.token != token || !held.is_active(timestamp_now_millis()) {
        return Ok(false);
    }
    let released = LeaseRecord {
        key: key.to_string(),
        token: String::new(),
        expires_at_ms: 0,
    };
    if !publish(dir, generation + 1, &released)? {
        return Ok(false);
    }
    prune(dir, generation + 1);
    Ok(true)
}

#[async_trait]
impl LockBroker for FileLockBroker {
    async fn try_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        if token.is_empty() {
            return Err(Error::InvalidConfig("lock token must not be empty".into()));
        }
        let dir = self.key_dir(key);
        let (key, token) = (key.to_string(), token.to_string());
        Self::blocking(move || try_lock_at(&dir, &key, &token, lease)).await
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let dir = self.key_dir(key);
        let (key, token) = (key.to_string(), token.to_string());
        Self::blocking(move || unlock_at(&dir, &key, &token)).await
    }

    async fn owner(&self, key: &str) -> Result<Option<String>> {
        let dir = self.key_dir(key);
        Self::blocking(move || {
            let now = timestamp_now_millis();
            Ok(latest(&dir)?
                .map(|(_, record)| record)
                .filter(|record| record.is_active(now))
                .map(|record| record.token))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_brokers_on_one_directory_exclude_each_other() {
        let dir = tempdir().unwrap();
        // two handles stand in for two processes
        let a = FileLockBroker::open(dir.path()).unwrap();
        let b = FileLockBroker::open(dir.path()).unwrap();

        assert!(a.try_lock("page:1", "a-1", LEASE).await.unwrap());
        assert!(!b.try_lock("page:1", "b-1", LEASE).await.unwrap());
        assert!(b.try_lock("page:2", "b-1", LEASE).await.unwrap());
        assert_eq!(b.owner("page:1").await.unwrap().as_deref(), Some("a-1"));

        assert!(!b.unlock("page:1", "b-1").await.unwrap());
        assert!(a.unlock("page:1", "a-1").await.unwrap());
        assert!(a.owner("page:1").await.unwrap().is_none());
        assert!(b.try_lock("page:1", "b-2", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let dir = tempdir().unwrap();
        let a = FileLockBroker::open(dir.path()).unwrap();
        let b = FileLockBroker::open(dir.path()).unwrap();

        assert!(a
            .try_lock("page", "crashed", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(b.owner("page").await.unwrap().is_none());
        assert!(b.try_lock("page", "b", LEASE).await.unwrap());
        // the old holder can no longer release it
        assert!(!a.unlock("page", "crashed").await.unwrap());
        assert_eq!(a.owner("page").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_released_key_keeps_one_record() {
        let dir = tempdir().unwrap();
        let broker = FileLockBroker::open(dir.path()).unwrap();
        for round in 0..5 {
            let token = format!("t{}", round);
            assert!(broker.try_lock("page", &token, LEASE).await.unwrap());
            assert!(broker.unlock("page", &token).await.unwrap());
        }
        let records: Vec<_> = fs::read_dir(broker.key_dir("page"))
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_handles_grant_once() {
        let dir = tempdir().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let broker = Arc::new(FileLockBroker::open(dir.path()).unwrap());
                tokio::spawn(async move {
                    broker
                        .try_lock("contended", &format!("worker-{}", n), LEASE)
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn test_unusable_directory_is_broker_unavailable() {
        let dir = tempdir().unwrap();
        let broker = FileLockBroker::open(dir.path().join("locks")).unwrap();
        // replace the lease directory with a plain file
        fs::remove_dir_all(broker.root()).unwrap();
        fs::write(broker.root(), b"not a directory").unwrap();

        let err = broker.try_lock("page", "a", LEASE).await.unwrap_err();
        assert!(matches!(err, Error::LockBrokerUnavailable(_)), "{}", err);

        let err = FileLockBroker::open(broker.root()).err().unwrap();
        assert!(matches!(err, Error::LockBrokerUnavailable(_)));
    }
}
