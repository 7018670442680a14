//! Page stores: the legacy partition and the hash-routed shards
//!
//! Every partition is an independent transactional store. A transaction
//! never spans two partitions; callers open one per store and commit it
//! before touching the next.
//!
//! - `memory`: in-process store (tests, demos)
//! - `rocks`: RocksDB-backed store with a status index

pub mod memory;
pub mod rocks;

pub use memory::MemoryPageStore;
pub use rocks::RocksPageStore;

use crate::common::{Blake3Hasher, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub type PageId = Uuid;

/// A physical partition that can hold the authoritative copy of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Legacy,
    /// 1-based shard number
    Shard(u16),
}

impl Partition {
    /// Position in the routing table: 0 = legacy, i = shard i
    pub fn index(&self) -> u64 {
        match self {
            Partition::Legacy => 0,
            Partition::Shard(n) => *n as u64,
        }
    }

    pub fn from_index(index: u64) -> Self {
        if index == 0 {
            Partition::Legacy
        } else {
            Partition::Shard(index as u16)
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Partition::Legacy)
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Partition::Legacy => write!(f, "legacy"),
            Partition::Shard(n) => write!(f, "shard{}", n),
        }
    }
}

impl std::str::FromStr for Partition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "legacy" {
            return Ok(Partition::Legacy);
        }
        s.strip_prefix("shard")
            .and_then(|n| n.parse::<u16>().ok())
            .filter(|n| *n > 0)
            .map(Partition::Shard)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown partition: {}", s)))
    }
}

/// Migration state of a page in the legacy store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Ready,
    Migrating,
    Migrated,
    Failed,
}

impl MigrationStatus {
    pub const ALL: [MigrationStatus; 4] = [
        MigrationStatus::Ready,
        MigrationStatus::Migrating,
        MigrationStatus::Migrated,
        MigrationStatus::Failed,
    ];

    /// Is `next` a legal edge of the status machine?
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (Ready, Migrating)
                | (Failed, Migrating)
                | (Migrating, Migrated)
                | (Migrating, Ready)
                | (Migrating, Failed)
                | (Ready, Failed)
                | (Failed, Ready)
        )
    }

    /// `Err(IllegalStatusTransition)` unless `next` is a legal edge
    pub fn ensure_transition(&self, next: MigrationStatus, page: impl std::fmt::Display) -> Result<()> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(Error::IllegalStatusTransition {
            page_id: page.to_string(),
            from: self.to_string(),
            to: next.to_string(),
        })
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            MigrationStatus::Ready => 0,
            MigrationStatus::Migrating => 1,
            MigrationStatus::Migrated => 2,
            MigrationStatus::Failed => 3,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(MigrationStatus::Ready),
            1 => Ok(MigrationStatus::Migrating),
            2 => Ok(MigrationStatus::Migrated),
            3 => Ok(MigrationStatus::Failed),
            other => Err(Error::Corrupted(format!("unknown status byte {}", other))),
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Ready => write!(f, "READY"),
            MigrationStatus::Migrating => write!(f, "MIGRATING"),
            MigrationStatus::Migrated => write!(f, "MIGRATED"),
            MigrationStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Page root row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: PageId,
    pub workspace_id: Uuid,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Only the legacy store tracks migration state; shard copies carry `None`.
    pub migration_status: Option<MigrationStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: Uuid,
    pub page_id: PageId,
    pub position: i32,
    pub block_type: String,
    pub archived: bool,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionLevel {
    Read,
    Write,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub page_id: PageId,
    pub user_id: Uuid,
    pub level: PermissionLevel,
}

/// A page with everything it owns, migrated as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageAggregate {
    pub page: Page,
    /// Ordered by `position`
    pub blocks: Vec<Block>,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounts {
    pub blocks: usize,
    pub permissions: usize,
}

impl PageAggregate {
    pub fn id(&self) -> PageId {
        self.page.id
    }

    pub fn counts(&self) -> AggregateCounts {
        AggregateCounts {
            blocks: self.blocks.len(),
            permissions: self.permissions.len(),
        }
    }

    /// BLAKE3 over the children's fields, blocks in position order and
    /// permissions in user order. Equal digests mean field-equal children.
    pub fn children_digest(&self) -> String {
        let mut hasher = Blake3Hasher::new();
        let mut blocks: Vec<&Block> = self.blocks.iter().collect();
        blocks.sort_by_key(|b| (b.position, b.id));
        for block in blocks {
            hasher.update(block.id.as_bytes());
            hasher.update(&block.position.to_be_bytes());
            hasher.update(block.block_type.as_bytes());
            hasher.update(&[block.archived as u8]);
            hasher.update(&(block.content.len() as u64).to_be_bytes());
            hasher.update(&block.content);
        }
        let mut permissions: Vec<&Permission> = self.permissions.iter().collect();
        permissions.sort_by_key(|p| p.user_id);
        for permission in permissions {
            hasher.update(permission.user_id.as_bytes());
            hasher.update(&[permission.level as u8]);
        }
        hasher.finalize()
    }
}

/// Per-status row counts of the legacy store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub ready: u64,
    pub migrating: u64,
    pub migrated: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn get(&self, status: MigrationStatus) -> u64 {
        match status {
            MigrationStatus::Ready => self.ready,
            MigrationStatus::Migrating => self.migrating,
            MigrationStatus::Migrated => self.migrated,
            MigrationStatus::Failed => self.failed,
        }
    }

    pub fn add(&mut self, status: MigrationStatus, n: u64) {
        match status {
            MigrationStatus::Ready => self.ready += n,
            MigrationStatus::Migrating => self.migrating += n,
            MigrationStatus::Migrated => self.migrated += n,
            MigrationStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.ready + self.migrating + self.migrated + self.failed
    }
}

/// A transaction scoped to a single partition.
///
/// Dropping without `commit` discards every staged write. Writes on a
/// read-only transaction fail with `Error::ReadOnlyTransaction`.
pub trait PageTxn {
    fn get_page(&self, id: PageId) -> Result<Option<Page>>;

    /// Blocks of a page, ordered by position
    fn blocks(&self, id: PageId) -> Result<Vec<Block>>;

    fn permissions(&self, id: PageId) -> Result<Vec<Permission>>;

    fn insert_page(&mut self, page: &Page) -> Result<()>;

    fn insert_block(&mut self, block: &Block) -> Result<()>;

    fn insert_permission(&mut self, permission: &Permission) -> Result<()>;

    fn delete_permissions(&mut self, id: PageId) -> Result<usize>;

    fn delete_blocks(&mut self, id: PageId) -> Result<usize>;

    /// Returns whether a page row was removed
    fn delete_page(&mut self, id: PageId) -> Result<bool>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn load_aggregate(&self, id: PageId) -> Result<Option<PageAggregate>> {
        let Some(page) = self.get_page(id)? else {
            return Ok(None);
        };
        Ok(Some(PageAggregate {
            page,
            blocks: self.blocks(id)?,
            permissions: self.permissions(id)?,
        }))
    }

    /// Insert page, then blocks, then permissions.
    fn insert_aggregate(&mut self, aggregate: &PageAggregate) -> Result<()> {
        self.insert_page(&aggregate.page)?;
        for block in &aggregate.blocks {
            self.insert_block(block)?;
        }
        for permission in &aggregate.permissions {
            self.insert_permission(permission)?;
        }
        Ok(())
    }

    /// Delete permissions, then blocks, then the page. Idempotent.
    fn delete_aggregate(&mut self, id: PageId) -> Result<(AggregateCounts, bool)> {
        let permissions = self.delete_permissions(id)?;
        let blocks = self.delete_blocks(id)?;
        let page = self.delete_page(id)?;
        Ok((
            AggregateCounts {
                blocks,
                permissions,
            },
            page,
        ))
    }
}

/// One partition's repository.
pub trait PageStore: Send + Sync {
    fn partition(&self) -> Partition;

    fn begin(&self, read_only: bool) -> Result<Box<dyn PageTxn + '_>>;

    /// All page ids in the partition, in id order
    fn page_ids(&self) -> Result<Vec<PageId>>;

    fn count_pages(&self) -> Result<u64> {
        Ok(self.page_ids()?.len() as u64)
    }
}

/// The pre-sharding partition, which also owns the migration status column.
pub trait LegacyStore: PageStore {
    fn status(&self, id: PageId) -> Result<Option<MigrationStatus>>;

    /// Atomically move `id` to `to` if its current status is one of `from`.
    /// Returns the number of rows affected (0 or 1). A current status in
    /// `from` with no legal edge to `to` is `Error::IllegalStatusTransition`.
    fn transition_status(
        &self,
        id: PageId,
        from: &[MigrationStatus],
        to: MigrationStatus,
    ) -> Result<usize>;

    /// Ids with `status`, oldest `updated_at` first
    fn fetch_candidates(&self, status: MigrationStatus, limit: usize) -> Result<Vec<PageId>>;

    /// Move every row in `from` to `to`; returns rows affected. An illegal
    /// edge is `Error::IllegalStatusTransition` and touches nothing.
    fn reset_status(&self, from: MigrationStatus, to: MigrationStatus) -> Result<usize>;

    fn count_by_status(&self) -> Result<StatusCounts>;
}

/// Every partition a run can touch, addressable by `Partition`.
#[derive(Clone)]
pub struct ShardSet {
    legacy: Arc<dyn LegacyStore>,
    legacy_pages: Arc<dyn PageStore>,
    shards: Vec<Arc<dyn PageStore>>,
}

impl ShardSet {
    /// `shards[i]` must serve `Partition::Shard(i + 1)`.
    pub fn new<L>(legacy: Arc<L>, shards: Vec<Arc<dyn PageStore>>) -> Result<Self>
    where
        L: LegacyStore + 'static,
    {
        if legacy.partition() != Partition::Legacy {
            return Err(Error::InvalidConfig(format!(
                "legacy slot holds {}",
                legacy.partition()
            )));
        }
        for (i, shard) in shards.iter().enumerate() {
            let expected = Partition::Shard(i as u16 + 1);
            if shard.partition() != expected {
                return Err(Error::InvalidConfig(format!(
                    "shard slot {} holds {}",
                    expected,
                    shard.partition()
                )));
            }
        }
        if shards.is_empty() {
            return Err(Error::InvalidConfig("at least one shard is required".into()));
        }
        let legacy_pages: Arc<dyn PageStore> = legacy.clone();
        Ok(Self {
            legacy,
            legacy_pages,
            shards,
        })
    }

    pub fn legacy(&self) -> &dyn LegacyStore {
        self.legacy.as_ref()
    }

    pub fn shard_count(&self) -> u16 {
        self.shards.len() as u16
    }

    pub fn store(&self, partition: Partition) -> Result<&dyn PageStore> {
        match partition {
            Partition::Legacy => Ok(self.legacy_pages.as_ref()),
            Partition::Shard(n) => self
                .shards
                .get((n as usize).wrapping_sub(1))
                .map(|s| s.as_ref())
                .ok_or_else(|| Error::NotFound(format!("partition {}", partition))),
        }
    }

    /// Legacy first, then shards in order
    pub fn partitions(&self) -> Vec<Partition> {
        std::iter::once(Partition::Legacy)
            .chain((1..=self.shard_count()).map(Partition::Shard))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    /// Page with `blocks` blocks and `permissions` grants, status READY.
    pub fn aggregate(id: PageId, blocks: usize, permissions: usize) -> PageAggregate {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let page = Page {
            id,
            workspace_id: Uuid::nil(),
            title: format!("page {}", id),
            content: "body".to_string(),
            created_at: created,
            updated_at: created,
            migration_status: Some(MigrationStatus::Ready),
        };
        let blocks = (0..blocks)
            .map(|i| Block {
                id: Uuid::new_v4(),
                page_id: id,
                position: i as i32,
                block_type: "text".to_string(),
                archived: i % 2 == 1,
                content: format!("block {}", i).into_bytes(),
            })
            .collect();
        let permissions = (0..permissions)
            .map(|i| Permission {
                page_id: id,
                user_id: Uuid::new_v4(),
                level: if i == 0 {
                    PermissionLevel::Admin
                } else {
                    PermissionLevel::Read
                },
            })
            .collect();
        PageAggregate {
            page,
            blocks,
            permissions,
        }
    }
}
