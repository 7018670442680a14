//! # pageshard
//!
//! Moves page aggregates (a page with its blocks and permissions) out of a
//! single legacy store into hash-routed shards, one page at a time:
//! - deterministic BLAKE3 routing, legacy kept as partition 0
//! - per-page saga with validation before deletion and compensation on failure
//! - a distributed lock per page, shared with live editors
//! - crash recovery of pages left MIGRATING by an interrupted run
//! - progress snapshots persisted with an expiry for outside observers
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!                ┌──────────────────────────┐
//!                │   MigrationOrchestrator  │  batches, retries, cooldown
//!                └────────────┬─────────────┘
//!                             │ per page, under lock
//!                ┌────────────▼─────────────┐
//!                │ MigrationTransaction-    │  mark → route → load →
//!                │ Coordinator (saga)       │  replicate → validate → delete
//!                └──┬──────────┬─────────┬──┘
//!                   │          │         │
//!             ┌─────▼────┐ ┌───▼────┐ ┌──▼─────┐
//!             │  legacy  │ │ shard1 │ │ shard2 │   one txn per store
//!             └──────────┘ └────────┘ └────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Create demo pages in the legacy store
//! pageshard seed --pages 1000
//!
//! # Run a migration to completion
//! pageshard migrate
//!
//! # Inspect (read-only, fine while another process migrates)
//! pageshard status
//! pageshard stats
//! pageshard verify
//!
//! # Admin HTTP API, optionally starting a run right away
//! pageshard serve --bind 127.0.0.1:7070 --auto-start
//! ```

pub mod admin;
pub mod common;
pub mod engine;
pub mod lock;
pub mod migration;
pub mod ops;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, FailureKind, Result};
pub use engine::Engine;
pub use migration::{MigrationOrchestrator, MigrationTransactionCoordinator, RunReport, ShardRouter};
pub use store::{PageAggregate, PageId, Partition};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
