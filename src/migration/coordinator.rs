//! Per-page migration saga
//!
//! Moves one page aggregate from legacy to its routed shard:
//!
//! 1. mark READY|FAILED → MIGRATING in legacy
//! 2. route; a page routed to legacy is marked MIGRATED and stays put
//! 3. load page, blocks and permissions from legacy (status must still be MIGRATING)
//! 4. replicate into the target inside a target-only transaction, replacing
//!    any residue of an earlier aborted attempt
//! 5. validate the target copy in a read-only target transaction
//! 6. delete from legacy inside a legacy-only transaction and check it is gone
//! 7. done: the missing legacy row is the terminal signal
//!
//! No transaction spans two stores. A failure in steps 3–6 triggers
//! compensation: drop whatever reached the target, then MIGRATING → READY.
//! Validation before deletion is what makes the ordering safe; re-running
//! the whole saga is idempotent.

use crate::common::{Error, Result};
use crate::migration::router::ShardRouter;
use crate::store::{
    AggregateCounts, MigrationStatus, PageAggregate, PageId, Partition, ShardSet,
};
use serde::Serialize;

/// Statuses a page may be claimed from
const CLAIMABLE: [MigrationStatus; 2] = [MigrationStatus::Ready, MigrationStatus::Failed];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// Aggregate now lives only in `target`
    Moved {
        target: Partition,
        blocks: usize,
        permissions: usize,
    },
    /// Routed to legacy; marked MIGRATED in place
    KeptInLegacy,
}

pub struct MigrationTransactionCoordinator {
    stores: ShardSet,
    router: ShardRouter,
}

impl MigrationTransactionCoordinator {
    pub fn new(stores: ShardSet, router: ShardRouter) -> Result<Self> {
        if stores.shard_count() != router.shard_count() {
            return Err(Error::InvalidConfig(format!(
                "router expects {} shards, store set has {}",
                router.shard_count(),
                stores.shard_count()
            )));
        }
        Ok(Self { stores, router })
    }

    pub fn stores(&self) -> &ShardSet {
        &self.stores
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    /// Run the full saga for one page. On error the page has already been
    /// compensated (target residue removed, status back to READY) unless the
    /// error is a status conflict, in which case nothing was changed.
    pub fn perform_migration(&self, id: PageId) -> Result<MigrationOutcome> {
        let target = self.router.target(&id)?;

        self.mark_migrating(id)?;

        if target.is_legacy() {
            let affected = self.stores.legacy().transition_status(
                id,
                &[MigrationStatus::Migrating],
                MigrationStatus::Migrated,
            )?;
            if affected == 0 {
                return Err(Error::StatusTransitionConflict {
                    page_id: id.to_string(),
                    detail: "status changed before it could be marked MIGRATED".into(),
                });
            }
            tracing::debug!(page_id = %id, "routed to legacy, marked MIGRATED in place");
            return Ok(MigrationOutcome::KeptInLegacy);
        }

        match self.move_aggregate(id, target) {
            Ok(counts) => {
                tracing::debug!(
                    page_id = %id,
                    target = %target,
                    blocks = counts.blocks,
                    permissions = counts.permissions,
                    "page migrated"
                );
                Ok(MigrationOutcome::Moved {
                    target,
                    blocks: counts.blocks,
                    permissions: counts.permissions,
                })
            }
            Err(e) => {
                tracing::warn!(page_id = %id, target = %target, error = %e, "migration step failed, compensating");
                self.compensate(id, target);
                Err(e)
            }
        }
    }

    /// Steps 3–6
    fn move_aggregate(&self, id: PageId, target: Partition) -> Result<AggregateCounts> {
        let aggregate = self.load_source(id)?;
        self.replicate(target, &aggregate)?;
        self.validate(target, &aggregate)?;
        self.delete_source(&aggregate)?;
        Ok(aggregate.counts())
    }

    /// Step 1: READY|FAILED → MIGRATING, or fail with a conflict
    fn mark_migrating(&self, id: PageId) -> Result<()> {
        let affected = self.stores.legacy().transition_status(
            id,
            &CLAIMABLE,
            MigrationStatus::Migrating,
        )?;
        if affected == 0 {
            let current = self.stores.legacy().status(id)?;
            return Err(Error::StatusTransitionConflict {
                page_id: id.to_string(),
                detail: match current {
                    Some(status) => format!("status is {}", status),
                    None => "page not in legacy".to_string(),
                },
            });
        }
        Ok(())
    }

    /// Step 3
    fn load_source(&self, id: PageId) -> Result<PageAggregate> {
        let txn = self.stores.legacy().begin(true)?;
        let Some(aggregate) = txn.load_aggregate(id)? else {
            return Err(Error::StatusTransitionConflict {
                page_id: id.to_string(),
                detail: "page vanished from legacy".into(),
            });
        };
        if aggregate.page.migration_status != Some(MigrationStatus::Migrating) {
            return Err(Error::StatusTransitionConflict {
                page_id: id.to_string(),
                detail: format!(
                    "expected MIGRATING, found {:?}",
                    aggregate.page.migration_status
                ),
            });
        }
        Ok(aggregate)
    }

    /// Step 4: target-scoped transaction
    fn replicate(&self, target: Partition, aggregate: &PageAggregate) -> Result<()> {
        let store = self.stores.store(target)?;
        let mut txn = store.begin(false)?;
        let id = aggregate.id();
        if txn.get_page(id)?.is_some() {
            let (stale, _) = txn.delete_aggregate(id)?;
            tracing::info!(
                page_id = %id,
                target = %target,
                blocks = stale.blocks,
                permissions = stale.permissions,
                "removed residue of an earlier attempt"
            );
        }
        let mut copy = aggregate.clone();
        copy.page.migration_status = None;
        txn.insert_aggregate(&copy)?;
        txn.commit()
    }

    /// Step 5: read-only target transaction
    fn validate(&self, target: Partition, source: &PageAggregate) -> Result<()> {
        let store = self.stores.store(target)?;
        let txn = store.begin(true)?;
        let id = source.id();
        let mismatch = |detail: String| Error::DataIntegrityMismatch {
            page_id: id.to_string(),
            detail,
        };

        let Some(copy) = txn.load_aggregate(id)? else {
            return Err(mismatch(format!("page missing from {}", target)));
        };
        if copy.page.title != source.page.title || copy.page.content != source.page.content {
            return Err(mismatch("title/content differ".into()));
        }
        let (expected, actual) = (source.counts(), copy.counts());
        if expected.blocks != actual.blocks {
            return Err(mismatch(format!(
                "block count {} != {}",
                actual.blocks, expected.blocks
            )));
        }
        if expected.permissions != actual.permissions {
            return Err(mismatch(format!(
                "permission count {} != {}",
                actual.permissions, expected.permissions
            )));
        }
        if copy.children_digest() != source.children_digest() {
            return Err(mismatch("block/permission fields differ".into()));
        }
        Ok(())
    }

    /// Step 6: legacy-scoped transaction, then check the row is gone
    fn delete_source(&self, aggregate: &PageAggregate) -> Result<()> {
        let id = aggregate.id();
        let cleanup_failed = |reason: String| Error::SourceCleanupFailed {
            page_id: id.to_string(),
            reason,
        };

        let legacy = self.stores.legacy();
        let mut txn = legacy.begin(false).map_err(|e| cleanup_failed(e.to_string()))?;
        txn.delete_aggregate(id)
            .map_err(|e| cleanup_failed(e.to_string()))?;
        txn.commit().map_err(|e| cleanup_failed(e.to_string()))?;

        let still_there = legacy
            .begin(true)
            .and_then(|txn| txn.get_page(id))
            .map_err(|e| cleanup_failed(e.to_string()))?;
        if still_there.is_some() {
            return Err(cleanup_failed("page still present after delete".into()));
        }
        Ok(())
    }

    /// Best-effort compensation; failures are logged, never raised.
    ///
    /// The target copy is only dropped while the legacy row still exists, so
    /// a page whose source is already gone is never lost.
    pub fn compensate(&self, id: PageId, target: Partition) {
        let legacy = self.stores.legacy();
        let source_present = match legacy.begin(true).and_then(|txn| txn.get_page(id)) {
            Ok(page) => page.is_some(),
            Err(e) => {
                tracing::error!(page_id = %id, error = %e, "compensation: cannot read legacy, leaving target untouched");
                return;
            }
        };
        if !source_present {
            tracing::error!(
                page_id = %id,
                target = %target,
                "compensation: legacy row already deleted, keeping target copy"
            );
            return;
        }

        if !target.is_legacy() {
            match self.drop_target_copy(id, target) {
                Ok(true) => tracing::info!(page_id = %id, target = %target, "compensation: removed partial copy"),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(page_id = %id, target = %target, error = %e, "compensation: target cleanup failed")
                }
            }
        }

        match legacy.transition_status(id, &[MigrationStatus::Migrating], MigrationStatus::Ready) {
            Ok(1) => tracing::debug!(page_id = %id, "compensation: status reset to READY"),
            Ok(_) => tracing::debug!(page_id = %id, "compensation: status no longer MIGRATING"),
            Err(e) => tracing::warn!(page_id = %id, error = %e, "compensation: status reset failed"),
        }
    }

    fn drop_target_copy(&self, id: PageId, target: Partition) -> Result<bool> {
        let mut txn = self.stores.store(target)?.begin(false)?;
        let (counts, page) = txn.delete_aggregate(id)?;
        txn.commit()?;
        Ok(page || counts.blocks > 0 || counts.permissions > 0)
    }

    /// Park a page as FAILED after its retry budget is spent.
    pub fn mark_failed(&self, id: PageId) -> Result<bool> {
        let affected = self.stores.legacy().transition_status(
            id,
            &[MigrationStatus::Ready, MigrationStatus::Migrating],
            MigrationStatus::Failed,
        )?;
        Ok(affected == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::aggregate;
    use crate::store::{LegacyStore, MemoryPageStore, PageStore};
    use std::sync::Arc;
    use uuid::Uuid;

    struct Harness {
        legacy: Arc<MemoryPageStore>,
        shards: Vec<Arc<MemoryPageStore>>,
        coordinator: MigrationTransactionCoordinator,
    }

    fn harness() -> Harness {
        let legacy = Arc::new(MemoryPageStore::new(Partition::Legacy));
        let shards: Vec<Arc<MemoryPageStore>> = (1..=2)
            .map(|n| Arc::new(MemoryPageStore::new(Partition::Shard(n))))
            .collect();
        let dyn_shards = shards
            .iter()
            .map(|s| s.clone() as Arc<dyn PageStore>)
            .collect();
        let set = ShardSet::new(legacy.clone(), dyn_shards).unwrap();
        let coordinator =
            MigrationTransactionCoordinator::new(set, ShardRouter::new(2).unwrap()).unwrap();
        Harness {
            legacy,
            shards,
            coordinator,
        }
    }

    /// A fresh id the router sends to `want`
    fn id_routed_to(router: &ShardRouter, want: Partition) -> Uuid {
        loop {
            let id = Uuid::new_v4();
            if router.target(&id).unwrap() == want {
                return id;
            }
        }
    }

    fn seed(store: &MemoryPageStore, agg: &PageAggregate) {
        let mut txn = store.begin(false).unwrap();
        txn.insert_aggregate(agg).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_moves_aggregate_to_shard() {
        let h = harness();
        let id = id_routed_to(h.coordinator.router(), Partition::Shard(1));
        let agg = aggregate(id, 3, 2);
        seed(&h.legacy, &agg);

        let outcome = h.coordinator.perform_migration(id).unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Moved {
                target: Partition::Shard(1),
                blocks: 3,
                permissions: 2
            }
        );

        assert_eq!(h.legacy.count_pages().unwrap(), 0);
        let txn = h.shards[0].begin(true).unwrap();
        let copy = txn.load_aggregate(id).unwrap().unwrap();
        assert_eq!(copy.page.migration_status, None);
        assert_eq!(copy.blocks, agg.blocks);
        assert_eq!(copy.permissions.len(), 2);
        assert_eq!(h.shards[1].count_pages().unwrap(), 0);
    }

    #[test]
    fn test_legacy_routed_page_stays() {
        let h = harness();
        let id = id_routed_to(h.coordinator.router(), Partition::Legacy);
        seed(&h.legacy, &aggregate(id, 1, 1));

        let outcome = h.coordinator.perform_migration(id).unwrap();
        assert_eq!(outcome, MigrationOutcome::KeptInLegacy);
        assert_eq!(h.legacy.status(id).unwrap(), Some(MigrationStatus::Migrated));
        assert!(h.shards.iter().all(|s| s.count_pages().unwrap() == 0));
    }

    #[test]
    fn test_second_attempt_is_a_conflict() {
        let h = harness();
        let id = id_routed_to(h.coordinator.router(), Partition::Legacy);
        seed(&h.legacy, &aggregate(id, 0, 0));
        h.coordinator.perform_migration(id).unwrap();

        let err = h.coordinator.perform_migration(id).unwrap_err();
        assert!(matches!(err, Error::StatusTransitionConflict { .. }));
    }

    #[test]
    fn test_stale_target_residue_is_replaced() {
        let h = harness();
        let id = id_routed_to(h.coordinator.router(), Partition::Shard(2));
        let agg = aggregate(id, 2, 1);
        seed(&h.legacy, &agg);

        // partial copy from a crashed run: page plus a block that no longer exists
        let mut residue = aggregate(id, 5, 0);
        residue.page.migration_status = None;
        residue.page.title = "old title".into();
        seed(&h.shards[1], &residue);

        h.coordinator.perform_migration(id).unwrap();
        let txn = h.shards[1].begin(true).unwrap();
        let copy = txn.load_aggregate(id).unwrap().unwrap();
        assert_eq!(copy.page.title, agg.page.title);
        assert_eq!(copy.blocks.len(), 2);
    }

    #[test]
    fn test_failed_page_can_be_reclaimed() {
        let h = harness();
        let id = id_routed_to(h.coordinator.router(), Partition::Shard(1));
        let mut agg = aggregate(id, 1, 0);
        agg.page.migration_status = Some(MigrationStatus::Failed);
        seed(&h.legacy, &agg);

        assert!(h.coordinator.perform_migration(id).is_ok());
        assert_eq!(h.shards[0].count_pages().unwrap(), 1);
    }

    #[test]
    fn test_compensate_resets_status_and_drops_copy() {
        let h = harness();
        let id = id_routed_to(h.coordinator.router(), Partition::Shard(1));
        let agg = aggregate(id, 2, 2);
        seed(&h.legacy, &agg);
        h.legacy
            .transition_status(id, &CLAIMABLE, MigrationStatus::Migrating)
            .unwrap();
        h.coordinator.replicate(Partition::Shard(1), &agg).unwrap();

        h.coordinator.compensate(id, Partition::Shard(1));
        assert_eq!(h.legacy.status(id).unwrap(), Some(MigrationStatus::Ready));
        assert_eq!(h.shards[0].count_pages().unwrap(), 0);
        let txn = h.shards[0].begin(true).unwrap();
        assert!(txn.blocks(id).unwrap().is_empty());
    }

    #[test]
    fn test_compensate_keeps_copy_when_source_gone() {
        let h = harness();
        let id = id_routed_to(h.coordinator.router(), Partition::Shard(1));
        let agg = aggregate(id, 1, 1);
        seed(&h.shards[0], &agg);

        h.coordinator.compensate(id, Partition::Shard(1));
        assert_eq!(h.shards[0].count_pages().unwrap(), 1);
    }

    #[test]
    fn test_nil_id_is_rejected_without_side_effects() {
        let h = harness();
        let err = h.coordinator.perform_migration(Uuid::nil()).unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier(_)));
    }
}
