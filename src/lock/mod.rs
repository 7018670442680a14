//! Cross-process mutual exclusion for page migration
//!
//! A `LockBroker` is the external coordination service (set-if-absent with a
//! lease, compare-and-delete on release). `DistributedLockManager` layers wait
//! timeouts, per-acquisition ownership tokens and `with_lock` on top of it.

pub mod broker;
pub mod file;
pub mod manager;

pub use broker::{InMemoryLockBroker, LockBroker};
pub use file::FileLockBroker;
pub use manager::{DistributedLockManager, LockHandle};

use crate::store::PageId;

/// Namespace for per-page migration locks
pub const LOCK_PREFIX: &str = "pageshard:lock:page:";

/// Lock key guarding one page aggregate
pub fn page_lock_key(id: &PageId) -> String {
    format!("{}{}", LOCK_PREFIX, id)
}
