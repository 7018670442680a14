//! In-memory page store
//!
//! Write transactions stage a copy of the tables and swap it in on commit,
//! so a dropped transaction leaves no trace. The table mutex is held for the
//! whole transaction, which serializes transactions on one store.

use super::{
    Block, LegacyStore, MigrationStatus, Page, PageId, PageStore, PageTxn, Partition, Permission,
    StatusCounts,
};
use crate::common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct Tables {
    pages: BTreeMap<PageId, Page>,
    /// (page, position, block id) keeps iteration in position order
    blocks: BTreeMap<(PageId, i32, Uuid), Block>,
    permissions: BTreeMap<(PageId, Uuid), Permission>,
}

impl Tables {
    fn blocks_of(&self, id: PageId) -> Vec<(PageId, i32, Uuid)> {
        self.blocks
            .range((id, i32::MIN, Uuid::nil())..=(id, i32::MAX, Uuid::from_u128(u128::MAX)))
            .map(|(k, _)| *k)
            .collect()
    }

    fn permissions_of(&self, id: PageId) -> Vec<(PageId, Uuid)> {
        self.permissions
            .range((id, Uuid::nil())..=(id, Uuid::from_u128(u128::MAX)))
            .map(|(k, _)| *k)
            .collect()
    }
}

pub struct MemoryPageStore {
    partition: Partition,
    tables: Mutex<Tables>,
}

impl MemoryPageStore {
    pub fn new(partition: Partition) -> Self {
        Self {
            partition,
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Internal(format!("{} tables mutex poisoned", self.partition)))
    }
}

struct MemoryTxn<'a> {
    committed: MutexGuard<'a, Tables>,
    /// `None` for read-only transactions
    staged: Option<Tables>,
}

impl MemoryTxn<'_> {
    fn view(&self) -> &Tables {
        self.staged.as_ref().unwrap_or(&*self.committed)
    }

    fn staged(&mut self) -> Result<&mut Tables> {
        self.staged.as_mut().ok_or(Error::ReadOnlyTransaction)
    }
}

impl PageTxn for MemoryTxn<'_> {
    fn get_page(&self, id: PageId) -> Result<Option<Page>> {
        Ok(self.view().pages.get(&id).cloned())
    }

    fn blocks(&self, id: PageId) -> Result<Vec<Block>> {
        let view = self.view();
        Ok(view
            .blocks_of(id)
            .iter()
            .filter_map(|k| view.blocks.get(k).cloned())
            .collect())
    }

    fn permissions(&self, id: PageId) -> Result<Vec<Permission>> {
        let view = self.view();
        Ok(view
            .permissions_of(id)
            .iter()
            .filter_map(|k| view.permissions.get(k).cloned())
            .collect())
    }

    fn insert_page(&mut self, page: &Page) -> Result<()> {
        self.staged()?.pages.insert(page.id, page.clone());
        Ok(())
    }

    fn insert_block(&mut self, block: &Block) -> Result<()> {
        self.staged()?
            .blocks
            .insert((block.page_id, block.position, block.id), block.clone());
        Ok(())
    }

    fn insert_permission(&mut self, permission: &Permission) -> Result<()> {
        self.staged()?
            .permissions
            .insert((permission.page_id, permission.user_id), permission.clone());
        Ok(())
    }

    fn delete_permissions(&mut self, id: PageId) -> Result<usize> {
        let tables = self.staged()?;
        let keys = tables.permissions_of(id);
        for key in &keys {
            tables.permissions.remove(key);
        }
        Ok(keys.len())
    }

    fn delete_blocks(&mut self, id: PageId) -> Result<usize> {
        let tables = self.staged()?;
        let keys = tables.blocks_of(id);
        for key in &keys {
            tables.blocks.remove(key);
        }
        Ok(keys.len())
    }

    fn delete_page(&mut self, id: PageId) -> Result<bool> {
        Ok(self.staged()?.pages.remove(&id).is_some())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTxn {
            mut committed,
            staged,
        } = *self;
        if let Some(staged) = staged {
            *committed = staged;
        }
        Ok(())
    }
}

impl PageStore for MemoryPageStore {
    fn partition(&self) -> Partition {
        self.partition
    }

    fn begin(&self, read_only: bool) -> Result<Box<dyn PageTxn + '_>> {
        let committed = self.lock()?;
        let staged = if read_only {
            None
        } else {
            Some(committed.clone())
        };
        Ok(Box::new(MemoryTxn { committed, staged }))
    }

    fn page_ids(&self) -> Result<Vec<PageId>> {
        Ok(self.lock()?.pages.keys().copied().collect())
    }

    fn count_pages(&self) -> Result<u64> {
        Ok(self.lock()?.pages.len() as u64)
    }
}

impl LegacyStore for MemoryPageStore {
    fn status(&self, id: PageId) -> Result<Option<MigrationStatus>> {
        Ok(self.lock()?.pages.get(&id).and_then(|p| p.migration_status))
    }

    fn transition_status(
        &self,
        id: PageId,
        from: &[MigrationStatus],
        to: MigrationStatus,
    ) -> Result<usize> {
        let mut tables = self.lock()?;
        match tables.pages.get_mut(&id) {
            Some(page) => match page.migration_status {
                Some(current) if from.contains(&current) => {
                    current.ensure_transition(to, id)?;
                    page.migration_status = Some(to);
                    Ok(1)
                }
                _ => Ok(0),
            },
            None => Ok(0),
        }
    }

    fn fetch_candidates(&self, status: MigrationStatus, limit: usize) -> Result<Vec<PageId>> {
        let tables = self.lock()?;
        let mut matching: Vec<&Page> = tables
            .pages
            .values()
            .filter(|p| p.migration_status == Some(status))
            .collect();
        matching.sort_by_key(|p| (p.updated_at, p.id));
        Ok(matching.into_iter().take(limit).map(|p| p.id).collect())
    }

    fn reset_status(&self, from: MigrationStatus, to: MigrationStatus) -> Result<usize> {
        from.ensure_transition(to, "*")?;
        let mut tables = self.lock()?;
        let mut affected = 0;
        for page in tables.pages.values_mut() {
            if page.migration_status == Some(from) {
                page.migration_status = Some(to);
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn count_by_status(&self) -> Result<StatusCounts> {
        let tables = self.lock()?;
        let mut counts = StatusCounts::default();
        for status in tables.pages.values().filter_map(|p| p.migration_status) {
            counts.add(status, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::aggregate;
    use chrono::Duration;

    fn seeded(count: usize) -> (MemoryPageStore, Vec<PageId>) {
        let store = MemoryPageStore::new(Partition::Legacy);
        let mut ids = Vec::new();
        let mut txn = store.begin(false).unwrap();
        for i in 0..count {
            let mut agg = aggregate(Uuid::new_v4(), 2, 1);
            agg.page.updated_at += Duration::seconds(count as i64 - i as i64);
            ids.push(agg.id());
            txn.insert_aggregate(&agg).unwrap();
        }
        txn.commit().unwrap();
        (store, ids)
    }

    #[test]
    fn test_dropped_txn_discards_writes() {
        let store = MemoryPageStore::new(Partition::Shard(1));
        let agg = aggregate(Uuid::new_v4(), 3, 2);
        {
            let mut txn = store.begin(false).unwrap();
            txn.insert_aggregate(&agg).unwrap();
        }
        assert_eq!(store.count_pages().unwrap(), 0);

        let mut txn = store.begin(false).unwrap();
        txn.insert_aggregate(&agg).unwrap();
        txn.commit().unwrap();

        let txn = store.begin(true).unwrap();
        let loaded = txn.load_aggregate(agg.id()).unwrap().unwrap();
        assert_eq!(loaded, agg);
    }

    #[test]
    fn test_read_only_txn_rejects_writes() {
        let store = MemoryPageStore::new(Partition::Legacy);
        let mut txn = store.begin(true).unwrap();
        let err = txn.delete_page(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, Error::ReadOnlyTransaction));
    }

    #[test]
    fn test_delete_aggregate_is_idempotent() {
        let (store, ids) = seeded(1);
        let mut txn = store.begin(false).unwrap();
        let (counts, existed) = txn.delete_aggregate(ids[0]).unwrap();
        assert_eq!((counts.blocks, counts.permissions, existed), (2, 1, true));
        let (counts, existed) = txn.delete_aggregate(ids[0]).unwrap();
        assert_eq!((counts.blocks, counts.permissions, existed), (0, 0, false));
        txn.commit().unwrap();
        assert_eq!(store.count_pages().unwrap(), 0);
    }

    #[test]
    fn test_transition_and_fetch_order() {
        let (store, ids) = seeded(3);
        // later-inserted pages were given older timestamps
        let fetched = store.fetch_candidates(MigrationStatus::Ready, 10).unwrap();
        assert_eq!(fetched, vec![ids[2], ids[1], ids[0]]);

        let from = [MigrationStatus::Ready, MigrationStatus::Failed];
        assert_eq!(
            store
                .transition_status(ids[0], &from, MigrationStatus::Migrating)
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .transition_status(ids[0], &from, MigrationStatus::Migrating)
                .unwrap(),
            0
        );
        assert_eq!(store.fetch_candidates(MigrationStatus::Ready, 1).unwrap(), vec![ids[2]]);

        assert_eq!(
            store
                .reset_status(MigrationStatus::Migrating, MigrationStatus::Ready)
                .unwrap(),
            1
        );
        let counts = store.count_by_status().unwrap();
        assert_eq!(counts.ready, 3);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_migrated_page_cannot_go_back() {
        let (store, ids) = seeded(1);
        let id = ids[0];
        store
            .transition_status(id, &[MigrationStatus::Ready], MigrationStatus::Migrating)
            .unwrap();
        store
            .transition_status(id, &[MigrationStatus::Migrating], MigrationStatus::Migrated)
            .unwrap();

        let err = store
            .transition_status(id, &[MigrationStatus::Migrated], MigrationStatus::Ready)
            .unwrap_err();
        assert!(matches!(err, Error::IllegalStatusTransition { .. }), "{}", err);
        assert_eq!(store.status(id).unwrap(), Some(MigrationStatus::Migrated));

        // a row outside `from` is still a plain miss
        assert_eq!(
            store
                .transition_status(id, &[MigrationStatus::Ready], MigrationStatus::Migrating)
                .unwrap(),
            0
        );
        assert!(store
            .reset_status(MigrationStatus::Migrated, MigrationStatus::Ready)
            .is_err());
        assert_eq!(store.count_by_status().unwrap().migrated, 1);
    }
}
