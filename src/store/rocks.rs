//! Page store using RocksDB
//!
//! Column families:
//! - `pages`: page id → page
//! - `blocks`: page id | position | block id → block
//! - `permissions`: page id | user id → permission
//! - `status_index`: status | updated_at | page id → () (legacy only)
//!
//! A write transaction is a `WriteBatch` applied on commit. Writers are
//! serialized by a store-wide lock; reads inside a transaction see the last
//! committed state, not the transaction's own staged writes. A read-only
//! transaction reads from a RocksDB snapshot taken when it begins.

use super::{
    Block, LegacyStore, MigrationStatus, Page, PageId, PageStore, PageTxn, Partition, Permission,
    StatusCounts,
};
use crate::common::{Error, Result};
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, Snapshot, WriteBatch, DB};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const CF_PAGES: &str = "pages";
const CF_BLOCKS: &str = "blocks";
const CF_PERMISSIONS: &str = "permissions";
const CF_STATUS_INDEX: &str = "status_index";
const COLUMN_FAMILIES: [&str; 4] = [CF_PAGES, CF_BLOCKS, CF_PERMISSIONS, CF_STATUS_INDEX];

/// Order-preserving encoding of a signed position
fn position_key(position: i32) -> [u8; 4] {
    ((position as u32) ^ 0x8000_0000).to_be_bytes()
}

fn block_key(block: &Block) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(block.page_id.as_bytes());
    key.extend_from_slice(&position_key(block.position));
    key.extend_from_slice(block.id.as_bytes());
    key
}

fn permission_key(permission: &Permission) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(permission.page_id.as_bytes());
    key.extend_from_slice(permission.user_id.as_bytes());
    key
}

/// `None` for pages without a migration status (shard copies)
fn status_key(page: &Page) -> Option<Vec<u8>> {
    let status = page.migration_status?;
    let millis = (page.updated_at.timestamp_millis() as u64) ^ (1 << 63);
    let mut key = Vec::with_capacity(25);
    key.push(status.as_byte());
    key.extend_from_slice(&millis.to_be_bytes());
    key.extend_from_slice(page.id.as_bytes());
    Some(key)
}

fn id_suffix(key: &[u8]) -> Result<PageId> {
    if key.len() < 16 {
        return Err(Error::Corrupted("index key too short".into()));
    }
    Uuid::from_slice(&key[key.len() - 16..]).map_err(|e| Error::Corrupted(e.to_string()))
}

pub struct RocksPageStore {
    partition: Partition,
    db: DB,
    write_lock: Mutex<()>,
    read_only: bool,
}

impl RocksPageStore {
    /// Open or create a page store
    pub fn open(path: impl AsRef<Path>, partition: Partition) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, COLUMN_FAMILIES)?;

        Ok(Self {
            partition,
            db,
            write_lock: Mutex::new(()),
            read_only: false,
        })
    }

    /// Open an existing store for reading only.
    ///
    /// Does not take the `LOCK` file, so it works while another process
    /// holds the store open for writing. Sees the state as of opening; every
    /// write path returns `Error::ReadOnlyTransaction`.
    pub fn open_read_only(path: impl AsRef<Path>, partition: Partition) -> Result<Self> {
        let db = DB::open_cf_for_read_only(&Options::default(), path, COLUMN_FAMILIES, false)?;
        Ok(Self {
            partition,
            db,
            write_lock: Mutex::new(()),
            read_only: true,
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>> {
        if self.read_only {
            return Err(Error::ReadOnlyTransaction);
        }
        self.write_lock
            .lock()
            .map_err(|_| Error::Internal(format!("{} write lock poisoned", self.partition)))
    }

    /// Read a page from `snapshot`, or from live state when `None`
    fn read_page(&self, snapshot: Option<&Snapshot<'_>>, id: PageId) -> Result<Option<Page>> {
        let cf = self.cf(CF_PAGES)?;
        let bytes = match snapshot {
            Some(snapshot) => snapshot.get_cf(cf, id.as_bytes())?,
            None => self.db.get_cf(cf, id.as_bytes())?,
        };
        bytes
            .map(|b| bincode::deserialize(&b).map_err(|e| Error::Corrupted(e.to_string())))
            .transpose()
    }

    /// Keys and values under `prefix` in `cf_name`, in key order
    fn scan_prefix(
        &self,
        snapshot: Option<&Snapshot<'_>>,
        cf_name: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf(cf_name)?;
        let mode = IteratorMode::From(prefix, Direction::Forward);
        let iter = match snapshot {
            Some(snapshot) => snapshot.iterator_cf(cf, mode),
            None => self.db.iterator_cf(cf, mode),
        };
        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    /// Stage a page write, keeping the status index in step with the row.
    fn stage_page(&self, batch: &mut WriteBatch, old: Option<&Page>, new: &Page) -> Result<()> {
        let index = self.cf(CF_STATUS_INDEX)?;
        if let Some(key) = old.and_then(status_key) {
            batch.delete_cf(index, key);
        }
        if let Some(key) = status_key(new) {
            batch.put_cf(index, key, b"");
        }
        batch.put_cf(self.cf(CF_PAGES)?, new.id.as_bytes(), bincode::serialize(new)?);
        Ok(())
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

struct RocksTxn<'a> {
    store: &'a RocksPageStore,
    /// `None` for read-only transactions
    batch: Option<WriteBatch>,
    /// Point-in-time view, read-only transactions only
    snapshot: Option<Snapshot<'a>>,
    _writer: Option<MutexGuard<'a, ()>>,
}

impl RocksTxn<'_> {
    fn batch(&mut self) -> Result<&mut WriteBatch> {
        self.batch.as_mut().ok_or(Error::ReadOnlyTransaction)
    }
}

impl PageTxn for RocksTxn<'_> {
    fn get_page(&self, id: PageId) -> Result<Option<Page>> {
        self.store.read_page(self.snapshot.as_ref(), id)
    }

    fn blocks(&self, id: PageId) -> Result<Vec<Block>> {
        self.store
            .scan_prefix(self.snapshot.as_ref(), CF_BLOCKS, id.as_bytes())?
            .into_iter()
            .map(|(_, value)| {
                bincode::deserialize(&value).map_err(|e| Error::Corrupted(e.to_string()))
            })
            .collect()
    }

    fn permissions(&self, id: PageId) -> Result<Vec<Permission>> {
        self.store
            .scan_prefix(self.snapshot.as_ref(), CF_PERMISSIONS, id.as_bytes())?
            .into_iter()
            .map(|(_, value)| {
                bincode::deserialize(&value).map_err(|e| Error::Corrupted(e.to_string()))
            })
            .collect()
    }

    fn insert_page(&mut self, page: &Page) -> Result<()> {
        let store = self.store;
        let old = store.read_page(None, page.id)?;
        store.stage_page(self.batch()?, old.as_ref(), page)
    }

    fn insert_block(&mut self, block: &Block) -> Result<()> {
        let store = self.store;
        let cf = store.cf(CF_BLOCKS)?;
        let value = bincode::serialize(block)?;
        self.batch()?.put_cf(cf, block_key(block), value);
        Ok(())
    }

    fn insert_permission(&mut self, permission: &Permission) -> Result<()> {
        let store = self.store;
        let cf = store.cf(CF_PERMISSIONS)?;
        let value = bincode::serialize(permission)?;
        self.batch()?.put_cf(cf, permission_key(permission), value);
        Ok(())
    }

    fn delete_permissions(&mut self, id: PageId) -> Result<usize> {
        let store = self.store;
        let cf = store.cf(CF_PERMISSIONS)?;
        let rows = store.scan_prefix(None, CF_PERMISSIONS, id.as_bytes())?;
        let batch = self.batch()?;
        for (key, _) in &rows {
            batch.delete_cf(cf, key);
        }
        Ok(rows.len())
    }

    fn delete_blocks(&mut self, id: PageId) -> Result<usize> {
        let store = self.store;
        let cf = store.cf(CF_BLOCKS)?;
        let rows = store.scan_prefix(None, CF_BLOCKS, id.as_bytes())?;
        let batch = self.batch()?;
        for (key, _) in &rows {
            batch.delete_cf(cf, key);
        }
        Ok(rows.len())
    }

    fn delete_page(&mut self, id: PageId) -> Result<bool> {
        let store = self.store;
        let Some(old) = store.read_page(None, id)? else {
            self.batch()?;
            return Ok(false);
        };
        let pages = store.cf(CF_PAGES)?;
        let index = store.cf(CF_STATUS_INDEX)?;
        let batch = self.batch()?;
        if let Some(key) = status_key(&old) {
            batch.delete_cf(index, key);
        }
        batch.delete_cf(pages, id.as_bytes());
        Ok(true)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let RocksTxn {
            store,
            batch,
            _writer,
            ..
        } = *self;
        if let Some(batch) = batch {
            store.db.write(batch)?;
        }
        Ok(())
    }
}

impl PageStore for RocksPageStore {
    fn partition(&self) -> Partition {
        self.partition
    }

    fn begin(&self, read_only: bool) -> Result<Box<dyn PageTxn + '_>> {
        if read_only {
            return Ok(Box::new(RocksTxn {
                store: self,
                batch: None,
                snapshot: Some(self.db.snapshot()),
                _writer: None,
            }));
        }
        let writer = self.lock_writes()?;
        Ok(Box::new(RocksTxn {
            store: self,
            batch: Some(WriteBatch::default()),
            snapshot: None,
            _writer: Some(writer),
        }))
    }

    fn page_ids(&self) -> Result<Vec<PageId>> {
        let iter = self.db.iterator_cf(self.cf(CF_PAGES)?, IteratorMode::Start);
        let mut ids = Vec::new();
        for item in iter {
            let (key, _) = item?;
            ids.push(id_suffix(&key)?);
        }
        Ok(ids)
    }
}

impl LegacyStore for RocksPageStore {
    fn status(&self, id: PageId) -> Result<Option<MigrationStatus>> {
        Ok(self.read_page(None, id)?.and_then(|p| p.migration_status))
    }

    fn transition_status(
        &self,
        id: PageId,
        from: &[MigrationStatus],
        to: MigrationStatus,
    ) -> Result<usize> {
        let _writer = self.lock_writes()?;
        let Some(page) = self.read_page(None, id)? else {
            return Ok(0);
        };
        let Some(current) = page.migration_status.filter(|s| from.contains(s)) else {
            return Ok(0);
        };
        current.ensure_transition(to, id)?;
        let mut updated = page.clone();
        updated.migration_status = Some(to);
        let mut batch = WriteBatch::default();
        self.stage_page(&mut batch, Some(&page), &updated)?;
        self.db.write(batch)?;
        Ok(1)
    }

    fn fetch_candidates(&self, status: MigrationStatus, limit: usize) -> Result<Vec<PageId>> {
        let prefix = [status.as_byte()];
        let iter = self.db.iterator_cf(
            self.cf(CF_STATUS_INDEX)?,
            IteratorMode::From(&prefix, Direction::Forward),
        );
        let mut ids = Vec::new();
        for item in iter {
            if ids.len() >= limit {
                break;
            }
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            ids.push(id_suffix(&key)?);
        }
        Ok(ids)
    }

    fn reset_status(&self, from: MigrationStatus, to: MigrationStatus) -> Result<usize> {
        from.ensure_transition(to, "*")?;
        let _writer = self.lock_writes()?;
        let mut batch = WriteBatch::default();
        let mut affected = 0;
        for (key, _) in self.scan_prefix(None, CF_STATUS_INDEX, &[from.as_byte()])? {
            let id = id_suffix(&key)?;
            let Some(page) = self.read_page(None, id)? else {
                continue;
            };
            let mut updated = page.clone();
            updated.migration_status = Some(to);
            self.stage_page(&mut batch, Some(&page), &updated)?;
            affected += 1;
        }
        self.db.write(batch)?;
        Ok(affected)
    }

    fn count_by_status(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for status in MigrationStatus::ALL {
            let n = self.scan_prefix(None, CF_STATUS_INDEX, &[status.as_byte()])?.len();
            counts.add(status, n as u64);
        }
        Ok(counts)
    }
}
