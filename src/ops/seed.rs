//! Demo data for a legacy store

use crate::common::{Error, Result};
use crate::store::{
    Block, MigrationStatus, Page, PageAggregate, PageId, PageStore, Permission, PermissionLevel,
};
use chrono::{Duration, Utc};
use uuid::Uuid;

const PAGES_PER_TXN: usize = 500;

/// Insert `pages` READY pages into `store`, committing in chunks.
/// Pages get increasing `updated_at` so a run visits them in creation order.
pub fn seed_legacy(
    store: &dyn PageStore,
    pages: usize,
    blocks_per_page: usize,
    permissions_per_page: usize,
) -> Result<Vec<PageId>> {
    if !store.partition().is_legacy() {
        return Err(Error::InvalidConfig(format!(
            "seeding targets legacy, got {}",
            store.partition()
        )));
    }
    let workspace_id = Uuid::new_v4();
    let base = Utc::now() - Duration::seconds(pages as i64);
    let mut ids = Vec::with_capacity(pages);

    for chunk_start in (0..pages).step_by(PAGES_PER_TXN) {
        let mut txn = store.begin(false)?;
        for n in chunk_start..(chunk_start + PAGES_PER_TXN).min(pages) {
            let aggregate = demo_aggregate(
                workspace_id,
                n,
                base + Duration::seconds(n as i64),
                blocks_per_page,
                permissions_per_page,
            );
            txn.insert_aggregate(&aggregate)?;
            ids.push(aggregate.id());
        }
        txn.commit()?;
    }

    tracing::info!(pages, workspace = %workspace_id, "seeded legacy store");
    Ok(ids)
}

fn demo_aggregate(
    workspace_id: Uuid,
    n: usize,
    at: chrono::DateTime<Utc>,
    blocks: usize,
    permissions: usize,
) -> PageAggregate {
    let id = Uuid::new_v4();
    let blocks = (0..blocks)
        .map(|pos| Block {
            id: Uuid::new_v4(),
            page_id: id,
            position: pos as i32,
            block_type: if pos == 0 { "heading" } else { "paragraph" }.to_string(),
            archived: false,
            content: format!("page {} block {}", n, pos).into_bytes(),
        })
        .collect();
    let permissions = (0..permissions)
        .map(|i| Permission {
            page_id: id,
            user_id: Uuid::new_v4(),
            level: match i {
                0 => PermissionLevel::Admin,
                1 => PermissionLevel::Write,
                _ => PermissionLevel::Read,
            },
        })
        .collect();
    PageAggregate {
        page: Page {
            id,
            workspace_id,
            title: format!("Page {}", n),
            content: format!("Demo content for page {}", n),
            created_at: at,
            updated_at: at,
            migration_status: Some(MigrationStatus::Ready),
        },
        blocks,
        permissions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LegacyStore, MemoryPageStore, Partition};

    #[test]
    fn test_seed_in_update_order() {
        let store = MemoryPageStore::new(Partition::Legacy);
        let ids = seed_legacy(&store, 7, 2, 3).unwrap();
        assert_eq!(ids.len(), 7);
        assert_eq!(store.fetch_candidates(MigrationStatus::Ready, 10).unwrap(), ids);

        let txn = store.begin(true).unwrap();
        let agg = txn.load_aggregate(ids[3]).unwrap().unwrap();
        assert_eq!(agg.counts().blocks, 2);
        assert_eq!(agg.counts().permissions, 3);
    }

    #[test]
    fn test_refuses_shard() {
        let store = MemoryPageStore::new(Partition::Shard(1));
        assert!(seed_legacy(&store, 1, 0, 0).is_err());
    }
}
