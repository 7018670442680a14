//! Batch driver for a migration run
//!
//! Pulls candidate pages from legacy in bounded batches (READY first, FAILED
//! once no READY rows are left, oldest `updated_at` first), migrates each one
//! under its distributed lock and decides per failure kind whether to retry,
//! skip, park the page as FAILED, or abort the whole run.

use crate::common::{linear_backoff, Error, FailureKind, LockConfig, MigrationConfig, Result};
use crate::lock::{page_lock_key, DistributedLockManager};
use crate::migration::coordinator::{MigrationOutcome, MigrationTransactionCoordinator};
use crate::migration::progress::ProgressTracker;
use crate::store::{MigrationStatus, PageId};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Totals for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    /// Pages reset from MIGRATING to READY at start-up
    pub recovered: usize,
    pub batches: usize,
    /// Pages that reached an outcome in this run (moved, stayed or failed)
    pub processed: usize,
    pub migrated: usize,
    pub stayed_in_legacy: usize,
    /// Claimed by someone else between fetch and claim
    pub skipped: usize,
    /// Lock held elsewhere when we tried
    pub lock_busy: usize,
    pub failed: usize,
    pub last_error: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.migrated + self.stayed_in_legacy
    }
}

/// What happened to one page in this pass
#[derive(Debug)]
enum PageResult {
    Done(MigrationOutcome),
    Skipped,
    Busy,
    Failed(Error),
}

pub struct MigrationOrchestrator {
    coordinator: Arc<MigrationTransactionCoordinator>,
    locks: Arc<DistributedLockManager>,
    config: MigrationConfig,
    lock_config: LockConfig,
}

impl MigrationOrchestrator {
    pub fn new(
        coordinator: Arc<MigrationTransactionCoordinator>,
        locks: Arc<DistributedLockManager>,
        config: MigrationConfig,
        lock_config: LockConfig,
    ) -> Self {
        Self {
            coordinator,
            locks,
            config,
            lock_config,
        }
    }

    pub fn coordinator(&self) -> &Arc<MigrationTransactionCoordinator> {
        &self.coordinator
    }

    /// Run until no READY or FAILED page is left to try.
    ///
    /// Only an unreachable lock broker (or a store failure while selecting
    /// work) ends the run with an error; per-page failures are counted in
    /// the report. The tracker receives the final status either way.
    pub async fn run(&self, progress: &ProgressTracker) -> Result<RunReport> {
        let result = self.run_batches(progress).await;
        match &result {
            Ok(report) => tracing::info!(
                migrated = report.migrated,
                stayed_in_legacy = report.stayed_in_legacy,
                failed = report.failed,
                skipped = report.skipped,
                batches = report.batches,
                "migration run completed"
            ),
            Err(e) => tracing::error!(error = %e, "migration run aborted"),
        }
        progress.complete(&result);
        result
    }

    async fn run_batches(&self, progress: &ProgressTracker) -> Result<RunReport> {
        let legacy = self.coordinator.stores().legacy();

        let recovered = legacy.reset_status(MigrationStatus::Migrating, MigrationStatus::Ready)?;
        if recovered > 0 {
            tracing::warn!(recovered, "reset pages left MIGRATING by an interrupted run");
        }

        let counts = legacy.count_by_status()?;
        let total = counts.ready + counts.failed;
        tracing::info!(
            total,
            ready = counts.ready,
            failed = counts.failed,
            batch_size = self.config.batch_size,
            "starting migration run"
        );
        progress.start(total);

        let mut report = RunReport {
            recovered,
            ..Default::default()
        };
        // pages parked as FAILED during this run are not retried by it
        let mut given_up: HashSet<PageId> = HashSet::new();

        loop {
            let batch = self.next_batch(&given_up)?;
            if batch.is_empty() {
                break;
            }
            report.batches += 1;
            tracing::debug!(batch = report.batches, size = batch.len(), "processing batch");

            let mut busy = 0usize;
            for &id in &batch {
                match self.migrate_page(id).await? {
                    PageResult::Done(MigrationOutcome::Moved { .. }) => {
                        report.migrated += 1;
                        report.processed += 1;
                        progress.increment(true);
                    }
                    PageResult::Done(MigrationOutcome::KeptInLegacy) => {
                        report.stayed_in_legacy += 1;
                        report.processed += 1;
                        progress.increment(true);
                    }
                    PageResult::Skipped => report.skipped += 1,
                    PageResult::Busy => {
                        busy += 1;
                        report.lock_busy += 1;
                    }
                    PageResult::Failed(e) => {
                        report.failed += 1;
                        report.processed += 1;
                        report.last_error = Some(format!("{}: {}", id, e));
                        given_up.insert(id);
                        progress.increment(false);
                    }
                }
            }

            if busy * 2 > batch.len() {
                tracing::warn!(
                    busy,
                    batch = batch.len(),
                    cooldown_ms = self.config.contention_cooldown_ms,
                    "most pages locked elsewhere, cooling down"
                );
                tokio::time::sleep(self.config.contention_cooldown()).await;
            } else if self.config.delay_between_batches_ms > 0 {
                tokio::time::sleep(self.config.delay_between_batches()).await;
            }
        }

        Ok(report)
    }

    /// READY pages first; FAILED pages only once READY is drained.
    fn next_batch(&self, given_up: &HashSet<PageId>) -> Result<Vec<PageId>> {
        let legacy = self.coordinator.stores().legacy();
        let limit = self.config.batch_size + given_up.len();
        for status in [MigrationStatus::Ready, MigrationStatus::Failed] {
            let batch: Vec<PageId> = legacy
                .fetch_candidates(status, limit)?
                .into_iter()
                .filter(|id| !given_up.contains(id))
                .take(self.config.batch_size)
                .collect();
            if !batch.is_empty() {
                return Ok(batch);
            }
        }
        Ok(Vec::new())
    }

    /// Migrate one page with its retry budget. `Err` only for run-fatal faults.
    async fn migrate_page(&self, id: PageId) -> Result<PageResult> {
        let key = page_lock_key(&id);
        let attempts = self.config.retry_count.max(1);
        let base = Duration::from_millis(self.config.retry_base_delay_ms);
        let increment = Duration::from_millis(self.config.retry_increment_ms);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = self
                .locks
                .with_lock(
                    &key,
                    self.lock_config.wait_time(),
                    self.lock_config.lease_time(),
                    || async { self.coordinator.perform_migration(id) },
                )
                .await;

            let err = match result {
                Ok(outcome) => return Ok(PageResult::Done(outcome)),
                Err(e) => e,
            };

            match err.kind() {
                FailureKind::Skip => {
                    tracing::debug!(page_id = %id, reason = %err, "page already claimed, skipping");
                    return Ok(PageResult::Skipped);
                }
                FailureKind::Busy => {
                    tracing::debug!(page_id = %id, "page locked elsewhere, leaving it for later");
                    return Ok(PageResult::Busy);
                }
                FailureKind::AbortRun => return Err(err),
                FailureKind::Fatal => {
                    last_error = Some(err);
                    break;
                }
                FailureKind::Retry => {
                    tracing::warn!(page_id = %id, attempt, attempts, error = %err, "migration attempt failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(linear_backoff(base, increment, attempt)).await;
                    }
                }
            }
        }

        let err = last_error.unwrap_or_else(|| Error::Internal("retry loop ended without error".into()));
        match self.coordinator.mark_failed(id) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(page_id = %id, "page was not READY/MIGRATING when marking FAILED"),
            Err(e) => tracing::warn!(page_id = %id, error = %e, "could not mark page FAILED"),
        }
        tracing::error!(page_id = %id, error = %err, "giving up on page for this run");
        Ok(PageResult::Failed(err))
    }
}
