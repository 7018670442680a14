//! Key-value storage for externally visible run state
//!
//! The progress snapshot is written here so operators (and the admin API of
//! another process) can read it. Entries carry an expiry; expired entries
//! read as absent.

use crate::common::utils::timestamp_now_millis;
use crate::common::Result;
use rocksdb::{Options, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Trait for key-value storage backends
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory store (default)
pub struct MemStore {
    map: Mutex<HashMap<String, (u64, Vec<u8>)>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (u64, Vec<u8>)>>> {
        self.map
            .lock()
            .map_err(|_| crate::Error::Internal("kv store mutex poisoned".into()))
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut map = self.entries()?;
        match map.get(key) {
            Some((expires_at, _)) if *expires_at <= timestamp_now_millis() => {
                map.remove(key);
                Ok(None)
            }
            Some((_, value)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let expires_at = timestamp_now_millis().saturating_add(ttl.as_millis() as u64);
        self.entries()?.insert(key.to_string(), (expires_at, value));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }
}

/// RocksDB store. Values are prefixed with an 8-byte big-endian expiry (ms).
pub struct RocksKvStore {
    db: DB,
    read_only: bool,
}

impl RocksKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db, read_only: false })
    }

    /// Observer handle that can coexist with a writer in another process
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let db = DB::open_for_read_only(&Options::default(), path, false)?;
        Ok(Self { db, read_only: true })
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(crate::Error::ReadOnlyTransaction);
        }
        Ok(())
    }
}

impl KvStore for RocksKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(raw) = self.db.get(key.as_bytes())? else {
            return Ok(None);
        };
        if raw.len() < 8 {
            return Err(crate::Error::Corrupted(format!("kv entry {} too short", key)));
        }
        let mut expiry = [0u8; 8];
        expiry.copy_from_slice(&raw[..8]);
        if u64::from_be_bytes(expiry) <= timestamp_now_millis() {
            if !self.read_only {
                self.db.delete(key.as_bytes())?;
            }
            return Ok(None);
        }
        Ok(Some(raw[8..].to_vec()))
    }

    fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.check_writable()?;
        let expires_at = timestamp_now_millis().saturating_add(ttl.as_millis() as u64);
        let mut raw = Vec::with_capacity(8 + value.len());
        raw.extend_from_slice(&expires_at.to_be_bytes());
        raw.extend_from_slice(&value);
        self.db.put(key.as_bytes(), raw)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.db.delete(key.as_bytes())?;
        Ok(())
    }
}
