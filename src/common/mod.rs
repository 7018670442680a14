//! Common utilities and types shared across pageshard

pub mod config;
pub mod error;
pub mod hash;
pub mod storage;
pub mod utils;

pub use config::{
    AdminConfig, Config, LockBackend, LockConfig, MigrationConfig, ProgressConfig, StorageConfig,
};
pub use error::{Error, FailureKind, Result};
pub use hash::{blake3_hash, shard_key, Blake3Hasher, HASH_CONTRACT};
pub use storage::{KvStore, MemStore, RocksKvStore};
pub use utils::{linear_backoff, parse_duration, timestamp_now_millis};
