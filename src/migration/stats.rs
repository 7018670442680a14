//! Read-only migration statistics, independent of any live run

use crate::common::Result;
use crate::store::{Partition, ShardSet, StatusCounts};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionCount {
    pub partition: Partition,
    pub pages: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatistics {
    /// Legacy rows by migration status
    pub legacy: StatusCounts,
    /// Page rows held by each shard
    pub shards: Vec<PartitionCount>,
    /// Pages whose migration is finished (moved, or kept in legacy as MIGRATED)
    pub migrated_total: u64,
    /// Pages still waiting (READY, MIGRATING or FAILED)
    pub pending_total: u64,
}

pub struct StatisticsService {
    stores: ShardSet,
}

impl StatisticsService {
    pub fn new(stores: ShardSet) -> Self {
        Self { stores }
    }

    pub fn statistics(&self) -> Result<MigrationStatistics> {
        let legacy = self.stores.legacy().count_by_status()?;
        let mut shards = Vec::with_capacity(self.stores.shard_count() as usize);
        for partition in self.stores.partitions().into_iter().skip(1) {
            shards.push(PartitionCount {
                partition,
                pages: self.stores.store(partition)?.count_pages()?,
            });
        }
        let moved: u64 = shards.iter().map(|s| s.pages).sum();
        Ok(MigrationStatistics {
            legacy,
            migrated_total: moved + legacy.migrated,
            pending_total: legacy.ready + legacy.migrating + legacy.failed,
            shards,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::aggregate;
    use crate::store::{LegacyStore, MemoryPageStore, MigrationStatus, PageStore};
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn test_counts_across_partitions() {
        let legacy = Arc::new(MemoryPageStore::new(Partition::Legacy));
        let shard = Arc::new(MemoryPageStore::new(Partition::Shard(1)));

        let mut txn = legacy.begin(false).unwrap();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            txn.insert_aggregate(&aggregate(*id, 1, 1)).unwrap();
        }
        txn.commit().unwrap();
        legacy
            .transition_status(ids[0], &[MigrationStatus::Ready], MigrationStatus::Failed)
            .unwrap();
        legacy
            .transition_status(ids[1], &[MigrationStatus::Ready], MigrationStatus::Migrating)
            .unwrap();
        legacy
            .transition_status(ids[1], &[MigrationStatus::Migrating], MigrationStatus::Migrated)
            .unwrap();

        let mut txn = shard.begin(false).unwrap();
        let mut moved = aggregate(Uuid::new_v4(), 2, 0);
        moved.page.migration_status = None;
        txn.insert_aggregate(&moved).unwrap();
        txn.commit().unwrap();

        let set = ShardSet::new(legacy, vec![shard as Arc<dyn PageStore>]).unwrap();
        let stats = StatisticsService::new(set).statistics().unwrap();
        assert_eq!(stats.legacy.failed, 1);
        assert_eq!(stats.legacy.ready, 1);
        assert_eq!(stats.shards[0].pages, 1);
        assert_eq!(stats.migrated_total, 2);
        assert_eq!(stats.pending_total, 2);
    }
}
