//! Legacy to shard migration

pub mod coordinator;
pub mod orchestrator;
pub mod progress;
pub mod router;
pub mod stats;

pub use coordinator::{MigrationOutcome, MigrationTransactionCoordinator};
pub use orchestrator::{MigrationOrchestrator, RunReport};
pub use progress::{MigrationSnapshot, ProgressRegistry, ProgressTracker, RunStatus, SNAPSHOT_KEY};
pub use router::ShardRouter;
pub use stats::{MigrationStatistics, PartitionCount, StatisticsService};
