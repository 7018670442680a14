//! Run progress tracking
//!
//! One `ProgressTracker` per run, handed out by `ProgressRegistry` and passed
//! to the run explicitly. Counters are atomics; every `report_interval`
//! increments (and on the last one) a snapshot is written to a `KvStore`
//! with a bounded expiry so other processes can observe the run.

use crate::common::{KvStore, ProgressConfig, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Key the latest snapshot is stored under
pub const SNAPSHOT_KEY: &str = "pageshard:migration:status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::NotStarted => write!(f, "NOT_STARTED"),
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Completed => write!(f, "COMPLETED"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Externally visible state of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSnapshot {
    pub total_pages: u64,
    pub processed_pages: u64,
    pub success_pages: u64,
    pub failed_pages: u64,
    pub progress_percentage: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub estimated_end_time: Option<DateTime<Utc>>,
    /// Milliseconds
    pub elapsed_time: u64,
    /// Milliseconds
    pub estimated_total_time: Option<u64>,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

impl MigrationSnapshot {
    /// Latest persisted snapshot, if one has not expired
    pub fn load(store: &dyn KvStore) -> Result<Option<Self>> {
        match store.get(SNAPSHOT_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug)]
struct Timing {
    started: Option<(Instant, DateTime<Utc>)>,
    ended: Option<DateTime<Utc>>,
    status: RunStatus,
    error: Option<String>,
}

pub struct ProgressTracker {
    store: Arc<dyn KvStore>,
    report_interval: u64,
    ttl: Duration,
    total: AtomicU64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timing: Mutex<Timing>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn KvStore>, config: &ProgressConfig) -> Self {
        Self {
            store,
            report_interval: config.report_interval.max(1),
            ttl: config.snapshot_ttl(),
            total: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timing: Mutex::new(Timing {
                started: None,
                ended: None,
                status: RunStatus::NotStarted,
                error: None,
            }),
        }
    }

    fn timing(&self) -> MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reset counters and mark the run as started
    pub fn start(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        self.succeeded.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        {
            let mut timing = self.timing();
            timing.started = Some((Instant::now(), Utc::now()));
            timing.ended = None;
            timing.status = RunStatus::Running;
            timing.error = None;
        }
        self.persist();
    }

    /// Count one processed page. Returns the processed count.
    pub fn increment(&self, succeeded: bool) -> u64 {
        if succeeded {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.total.load(Ordering::SeqCst);
        if processed % self.report_interval == 0 || processed == total {
            self.persist();
            tracing::info!(
                processed,
                total,
                "migration progress {:.1}%",
                percentage(processed, total)
            );
        }
        processed
    }

    /// Close the run. An error marks it FAILED with the error as message.
    pub fn complete<T>(&self, result: &Result<T>) {
        {
            let mut timing = self.timing();
            timing.ended = Some(Utc::now());
            match result {
                Ok(_) => {
                    timing.status = RunStatus::Completed;
                    timing.error = None;
                }
                Err(e) => {
                    timing.status = RunStatus::Failed;
                    timing.error = Some(e.to_string());
                }
            }
        }
        self.persist();
    }

    pub fn is_running(&self) -> bool {
        self.timing().status == RunStatus::Running
    }

    pub fn current_status(&self) -> MigrationSnapshot {
        let total = self.total.load(Ordering::SeqCst);
        let processed = self.processed.load(Ordering::SeqCst);
        let timing = self.timing();

        let elapsed = timing
            .started
            .map(|(instant, _)| instant.elapsed())
            .unwrap_or_default();
        let estimated_total = (processed > 0 && total > 0).then(|| {
            let ms = elapsed.as_millis() as u128 * total as u128 / processed as u128;
            ms as u64
        });
        let estimated_end_time = match (timing.started, estimated_total) {
            (Some((_, wall)), Some(ms)) => {
                Some(wall + chrono::Duration::milliseconds(ms as i64))
            }
            _ => None,
        };
        let progress_percentage = if timing.status == RunStatus::Completed && total == 0 {
            100.0
        } else {
            percentage(processed, total)
        };

        MigrationSnapshot {
            total_pages: total,
            processed_pages: processed,
            success_pages: self.succeeded.load(Ordering::SeqCst),
            failed_pages: self.failed.load(Ordering::SeqCst),
            progress_percentage,
            start_time: timing.started.map(|(_, wall)| wall),
            end_time: timing.ended,
            estimated_end_time,
            elapsed_time: elapsed.as_millis() as u64,
            estimated_total_time: estimated_total,
            status: timing.status,
            error_message: timing.error.clone(),
        }
    }

    /// In-process state once a run has started here, otherwise whatever a
    /// previous (or other) process last persisted.
    pub fn latest_status(&self) -> MigrationSnapshot {
        let local = self.current_status();
        if local.status != RunStatus::NotStarted {
            return local;
        }
        match MigrationSnapshot::load(self.store.as_ref()) {
            Ok(Some(persisted)) => persisted,
            Ok(None) => local,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted migration snapshot");
                local
            }
        }
    }

    /// Best effort: a failed write is logged, the run goes on.
    fn persist(&self) {
        let snapshot = self.current_status();
        let result = serde_json::to_vec(&snapshot)
            .map_err(crate::Error::from)
            .and_then(|bytes| self.store.put_with_ttl(SNAPSHOT_KEY, bytes, self.ttl));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist migration snapshot");
        }
    }
}

/// Creates a fresh tracker for every run and keeps the latest one around
/// for status reads.
#[derive(Clone)]
pub struct ProgressRegistry {
    store: Arc<dyn KvStore>,
    config: ProgressConfig,
    latest: Arc<Mutex<Arc<ProgressTracker>>>,
}

impl ProgressRegistry {
    pub fn new(store: Arc<dyn KvStore>, config: ProgressConfig) -> Self {
        let idle = Arc::new(ProgressTracker::new(store.clone(), &config));
        Self {
            store,
            config,
            latest: Arc::new(Mutex::new(idle)),
        }
    }

    /// Tracker for a run about to start. It replaces the previous one as
    /// the source of `latest_status`.
    pub fn begin_run(&self) -> Arc<ProgressTracker> {
        let tracker = Arc::new(ProgressTracker::new(self.store.clone(), &self.config));
        *self.slot() = tracker.clone();
        tracker
    }

    /// Tracker of the most recent run (an idle one before any run)
    pub fn latest(&self) -> Arc<ProgressTracker> {
        self.slot().clone()
    }

    pub fn latest_status(&self) -> MigrationSnapshot {
        self.latest().latest_status()
    }

    fn slot(&self) -> MutexGuard<'_, Arc<ProgressTracker>> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Percentage with two decimals, capped at 100
fn percentage(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = (processed as f64 / total as f64 * 100.0).min(100.0);
    (pct * 100.0).round() / 100.0
}
