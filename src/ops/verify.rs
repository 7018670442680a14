//! Verify page placement against the router

use crate::common::Result;
use crate::migration::ShardRouter;
use crate::store::{MigrationStatus, PageId, Partition, ShardSet};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Misplaced {
    pub page_id: PageId,
    pub found_in: Partition,
    pub expected: Partition,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub hash_contract: String,
    pub legacy_pages: usize,
    pub shard_pages: usize,
    /// Still READY or FAILED in legacy
    pub pending: usize,
    pub misplaced: Vec<Misplaced>,
    /// Present in legacy and in a shard at the same time
    pub duplicates: Vec<PageId>,
    /// MIGRATING with no run in progress
    pub stuck_migrating: Vec<PageId>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.misplaced.is_empty() && self.duplicates.is_empty() && self.stuck_migrating.is_empty()
    }
}

/// Walk every partition and check each page sits where `router` puts it.
///
/// A MIGRATED legacy row must route to legacy; a shard row must route to
/// that shard. Pending legacy rows are only counted.
pub fn verify_placement(stores: &ShardSet, router: &ShardRouter) -> Result<VerifyReport> {
    tracing::info!(contract = router.contract(), "starting placement verification");
    let mut report = VerifyReport {
        hash_contract: router.contract().to_string(),
        ..Default::default()
    };

    let legacy = stores.legacy();
    let legacy_ids = legacy.page_ids()?;
    report.legacy_pages = legacy_ids.len();
    for &id in &legacy_ids {
        match legacy.status(id)? {
            Some(MigrationStatus::Migrating) => report.stuck_migrating.push(id),
            Some(MigrationStatus::Migrated) => {
                let expected = router.target(&id)?;
                if !expected.is_legacy() {
                    report.misplaced.push(Misplaced {
                        page_id: id,
                        found_in: Partition::Legacy,
                        expected,
                    });
                }
            }
            Some(MigrationStatus::Ready) | Some(MigrationStatus::Failed) => report.pending += 1,
            None => {}
        }
    }
    let in_legacy: HashSet<PageId> = legacy_ids.into_iter().collect();

    for partition in stores.partitions().into_iter().skip(1) {
        let ids = stores.store(partition)?.page_ids()?;
        report.shard_pages += ids.len();
        for id in ids {
            if in_legacy.contains(&id) {
                report.duplicates.push(id);
            }
            let expected = router.target(&id)?;
            if expected != partition {
                report.misplaced.push(Misplaced {
                    page_id: id,
                    found_in: partition,
                    expected,
                });
            }
        }
    }

    if report.is_clean() {
        tracing::info!(
            legacy = report.legacy_pages,
            shards = report.shard_pages,
            pending = report.pending,
            "placement verified"
        );
    } else {
        tracing::warn!(
            misplaced = report.misplaced.len(),
            duplicates = report.duplicates.len(),
            stuck = report.stuck_migrating.len(),
            "placement verification found problems"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationTransactionCoordinator;
    use crate::store::fixtures::aggregate;
    use crate::store::{LegacyStore, MemoryPageStore, PageStore};
    use std::sync::Arc;
    use uuid::Uuid;

    fn stores() -> (Arc<MemoryPageStore>, Vec<Arc<MemoryPageStore>>, ShardSet) {
        let legacy = Arc::new(MemoryPageStore::new(Partition::Legacy));
        let shards: Vec<Arc<MemoryPageStore>> = (1..=2)
            .map(|n| Arc::new(MemoryPageStore::new(Partition::Shard(n))))
            .collect();
        let set = ShardSet::new(
            legacy.clone(),
            shards.iter().map(|s| s.clone() as Arc<dyn PageStore>).collect(),
        )
        .unwrap();
        (legacy, shards, set)
    }

    fn insert(store: &MemoryPageStore, id: Uuid) {
        let mut txn = store.begin(false).unwrap();
        txn.insert_aggregate(&aggregate(id, 1, 0)).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_clean_after_migration() {
        let (legacy, _, set) = stores();
        for _ in 0..12 {
            insert(&legacy, Uuid::new_v4());
        }
        let router = ShardRouter::new(2).unwrap();
        let coordinator = MigrationTransactionCoordinator::new(set, router).unwrap();
        for id in legacy.page_ids().unwrap() {
            coordinator.perform_migration(id).unwrap();
        }

        let report = verify_placement(coordinator.stores(), &router).unwrap();
        assert!(report.is_clean(), "{:?}", report);
        assert_eq!(report.pending, 0);
        assert_eq!(report.legacy_pages + report.shard_pages, 12);
    }

    #[test]
    fn test_reports_problems() {
        let (legacy, shards, set) = stores();
        let router = ShardRouter::new(2).unwrap();

        // a page in the wrong shard
        let wrong = loop {
            let id = Uuid::new_v4();
            if router.target(&id).unwrap() == Partition::Shard(1) {
                break id;
            }
        };
        insert(&shards[1], wrong);

        // a page left MIGRATING, also copied to a shard
        let stuck = Uuid::new_v4();
        insert(&legacy, stuck);
        legacy
            .transition_status(stuck, &[MigrationStatus::Ready], MigrationStatus::Migrating)
            .unwrap();
        insert(&shards[0], stuck);

        let report = verify_placement(&set, &router).unwrap();
        assert!(!report.is_clean());
        assert!(report.misplaced.iter().any(|m| m.page_id == wrong
            && m.found_in == Partition::Shard(2)
            && m.expected == Partition::Shard(1)));
        assert_eq!(report.stuck_migrating, vec![stuck]);
        assert_eq!(report.duplicates, vec![stuck]);
    }
}
