//! Configuration for pageshard components

use crate::common::{parse_duration, Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "pageshard.toml";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique per orchestrator process)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub migration: MigrationConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            log_level: default_log_level(),
            migration: MigrationConfig::default(),
            lock: LockConfig::default(),
            progress: ProgressConfig::default(),
            storage: StorageConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

/// Milliseconds given either as a number or as a duration string ("30s")
fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Number(u64),
        Text(String),
    }

    match Millis::deserialize(deserializer)? {
        Millis::Number(ms) => Ok(ms),
        Millis::Text(text) => match text.trim().parse::<u64>() {
            Ok(ms) => Ok(ms),
            Err(_) => parse_duration(&text)
                .map(|d| d.as_millis() as u64)
                .map_err(serde::de::Error::custom),
        },
    }
}

fn default_node_id() -> String {
    "pageshard-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Batch loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rows fetched per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_delay_between_batches", deserialize_with = "millis")]
    pub delay_between_batches_ms: u64,

    /// Attempts per page before it is marked FAILED
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_retry_base_delay", deserialize_with = "millis")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_increment", deserialize_with = "millis")]
    pub retry_increment_ms: u64,

    /// Pause after a batch where most pages were locked elsewhere
    #[serde(default = "default_contention_cooldown", deserialize_with = "millis")]
    pub contention_cooldown_ms: u64,

    /// Start a run as soon as the admin server is up
    #[serde(default)]
    pub auto_start: bool,
}

fn default_batch_size() -> usize {
    100
}
fn default_delay_between_batches() -> u64 {
    100
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_base_delay() -> u64 {
    1000
}
fn default_retry_increment() -> u64 {
    1000
}
fn default_contention_cooldown() -> u64 {
    5000
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            delay_between_batches_ms: default_delay_between_batches(),
            retry_count: default_retry_count(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_increment_ms: default_retry_increment(),
            contention_cooldown_ms: default_contention_cooldown(),
            auto_start: false,
        }
    }
}

impl MigrationConfig {
    pub fn delay_between_batches(&self) -> Duration {
        Duration::from_millis(self.delay_between_batches_ms)
    }

    pub fn contention_cooldown(&self) -> Duration {
        Duration::from_millis(self.contention_cooldown_ms)
    }
}

/// Where page locks live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// Current process only
    Memory,
    /// Lease directory shared by every orchestrator process
    #[default]
    File,
}

/// Distributed lock backend and timings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default)]
    pub backend: LockBackend,

    /// Lease directory for the file backend (default `<data_dir>/locks`)
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Lock auto-expires after this long even if never released
    #[serde(default = "default_lease_time", deserialize_with = "millis")]
    pub lease_time_ms: u64,

    /// How long a worker waits for a busy lock
    #[serde(default = "default_wait_time", deserialize_with = "millis")]
    pub wait_time_ms: u64,

    #[serde(default = "default_poll_interval", deserialize_with = "millis")]
    pub poll_interval_ms: u64,
}

fn default_lease_time() -> u64 {
    30_000
}
fn default_wait_time() -> u64 {
    5_000
}
fn default_poll_interval() -> u64 {
    50
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::default(),
            dir: None,
            lease_time_ms: default_lease_time(),
            wait_time_ms: default_wait_time(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl LockConfig {
    pub fn lease_time(&self) -> Duration {
        Duration::from_millis(self.lease_time_ms)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Progress snapshot persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Increments between snapshot writes
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,

    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_secs: u64,
}

fn default_report_interval() -> u64 {
    10
}
fn default_snapshot_ttl() -> u64 {
    24 * 3600
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            report_interval: default_report_interval(),
            snapshot_ttl_secs: default_snapshot_ttl(),
        }
    }
}

impl ProgressConfig {
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }
}

/// On-disk layout of the page stores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Number of shards besides legacy
    #[serde(default = "default_shard_count")]
    pub shard_count: u16,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./pageshard-data")
}
fn default_shard_count() -> u16 {
    2
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            shard_count: default_shard_count(),
        }
    }
}

impl StorageConfig {
    pub fn legacy_path(&self) -> PathBuf {
        self.data_dir.join("legacy")
    }

    pub fn shard_path(&self, index: u16) -> PathBuf {
        self.data_dir.join(format!("shard{}", index))
    }

    pub fn progress_path(&self) -> PathBuf {
        self.data_dir.join("progress")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("locks")
    }
}

/// Admin HTTP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7070))
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Config {
    /// Load configuration from `pageshard.toml` (or `$PAGESHARD_CONFIG`) and
    /// `PAGESHARD__*` environment variables. Missing file means defaults.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("PAGESHARD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("PAGESHARD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the batch loop cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.migration.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.migration.retry_count == 0 {
            return Err(Error::InvalidConfig("retry_count must be > 0".into()));
        }
        if self.progress.report_interval == 0 {
            return Err(Error::InvalidConfig("report_interval must be > 0".into()));
        }
        if self.storage.shard_count == 0 {
            return Err(Error::InvalidConfig("shard_count must be > 0".into()));
        }
        if self.lock.wait_time_ms > self.lock.lease_time_ms {
            return Err(Error::InvalidConfig(format!(
                "lock wait_time_ms ({}) exceeds lease_time_ms ({})",
                self.lock.wait_time_ms, self.lock.lease_time_ms
            )));
        }
        Ok(())
    }
}
