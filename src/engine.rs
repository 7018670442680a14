//! Wires stores, router, locks and progress into one runnable unit

use crate::admin::AdminState;
use crate::common::{Config, KvStore, LockBackend, MemStore, Result, RocksKvStore};
use crate::lock::{DistributedLockManager, FileLockBroker, InMemoryLockBroker, LockBroker};
use crate::migration::{
    MigrationOrchestrator, MigrationSnapshot, MigrationStatistics, MigrationTransactionCoordinator,
    ProgressRegistry, ProgressTracker, RunReport, ShardRouter, StatisticsService,
};
use crate::ops::{verify_placement, VerifyReport};
use crate::store::{MemoryPageStore, PageStore, Partition, RocksPageStore, ShardSet};
use std::sync::Arc;

pub struct Engine {
    config: Config,
    orchestrator: Arc<MigrationOrchestrator>,
    progress: ProgressRegistry,
    statistics: Arc<StatisticsService>,
}

/// Lock broker named by `lock.backend`
pub fn open_lock_broker(config: &Config) -> Result<Arc<dyn LockBroker>> {
    match config.lock.backend {
        LockBackend::File => {
            let dir = config
                .lock
                .dir
                .clone()
                .unwrap_or_else(|| config.storage.lock_path());
            Ok(Arc::new(FileLockBroker::open(dir)?))
        }
        LockBackend::Memory => {
            tracing::warn!("in-memory lock broker: other processes are not excluded");
            Ok(Arc::new(InMemoryLockBroker::new()))
        }
    }
}

impl Engine {
    /// Open the RocksDB layout under `storage.data_dir` with the configured
    /// lock broker
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage.data_dir)?;
        let broker = open_lock_broker(&config)?;
        Self::open_with_broker(config, broker)
    }

    /// Open the RocksDB layout, locking pages through `broker`
    pub fn open_with_broker(config: Config, broker: Arc<dyn LockBroker>) -> Result<Self> {
        config.validate()?;
        let storage = &config.storage;
        tracing::info!("Opening stores under {}", storage.data_dir.display());
        std::fs::create_dir_all(&storage.data_dir)?;

        let legacy = Arc::new(RocksPageStore::open(storage.legacy_path(), Partition::Legacy)?);
        let mut shards: Vec<Arc<dyn PageStore>> = Vec::with_capacity(storage.shard_count as usize);
        for n in 1..=storage.shard_count {
            shards.push(Arc::new(RocksPageStore::open(
                storage.shard_path(n),
                Partition::Shard(n),
            )?));
        }
        let stores = ShardSet::new(legacy, shards)?;
        let snapshots = Arc::new(RocksKvStore::open(storage.progress_path())?);
        Self::with_stores(config, stores, snapshots, broker)
    }

    /// Open an existing layout for status, statistics and verification while
    /// another process may be migrating. Views are fixed at open time and a
    /// run started on this engine fails with `Error::ReadOnlyTransaction`.
    pub fn open_read_only(config: Config) -> Result<Self> {
        config.validate()?;
        let storage = &config.storage;
        tracing::info!("Opening stores under {} read-only", storage.data_dir.display());

        let legacy = Arc::new(RocksPageStore::open_read_only(
            storage.legacy_path(),
            Partition::Legacy,
        )?);
        let mut shards: Vec<Arc<dyn PageStore>> = Vec::with_capacity(storage.shard_count as usize);
        for n in 1..=storage.shard_count {
            shards.push(Arc::new(RocksPageStore::open_read_only(
                storage.shard_path(n),
                Partition::Shard(n),
            )?));
        }
        let stores = ShardSet::new(legacy, shards)?;
        let snapshots: Arc<dyn KvStore> = match RocksKvStore::open_read_only(storage.progress_path()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::debug!(error = %e, "no readable progress store, status starts empty");
                Arc::new(MemStore::new())
            }
        };
        Self::with_stores(config, stores, snapshots, Arc::new(InMemoryLockBroker::new()))
    }

    /// Everything in memory; nothing survives the process
    pub fn in_memory(config: Config) -> Result<Self> {
        config.validate()?;
        let legacy = Arc::new(MemoryPageStore::new(Partition::Legacy));
        let shards = (1..=config.storage.shard_count)
            .map(|n| Arc::new(MemoryPageStore::new(Partition::Shard(n))) as Arc<dyn PageStore>)
            .collect();
        let stores = ShardSet::new(legacy, shards)?;
        Self::with_stores(
            config,
            stores,
            Arc::new(MemStore::new()),
            Arc::new(InMemoryLockBroker::new()),
        )
    }

    /// Assemble from caller-supplied stores and lock broker
    pub fn with_stores(
        config: Config,
        stores: ShardSet,
        snapshots: Arc<dyn KvStore>,
        broker: Arc<dyn LockBroker>,
    ) -> Result<Self> {
        config.validate()?;
        let router = ShardRouter::new(config.storage.shard_count)?;
        let coordinator = Arc::new(MigrationTransactionCoordinator::new(stores.clone(), router)?);
        let locks = Arc::new(DistributedLockManager::from_config(
            broker,
            config.node_id.clone(),
            &config.lock,
        ));
        let orchestrator = Arc::new(MigrationOrchestrator::new(
            coordinator,
            locks,
            config.migration.clone(),
            config.lock.clone(),
        ));
        let progress = ProgressRegistry::new(snapshots, config.progress.clone());
        let statistics = Arc::new(StatisticsService::new(stores));

        tracing::info!(
            node_id = %config.node_id,
            shards = router.shard_count(),
            contract = router.contract(),
            "engine ready"
        );
        Ok(Self {
            config,
            orchestrator,
            progress,
            statistics,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stores(&self) -> &ShardSet {
        self.orchestrator.coordinator().stores()
    }

    pub fn router(&self) -> &ShardRouter {
        self.orchestrator.coordinator().router()
    }

    /// Tracker of the latest run started through this engine
    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.progress.latest()
    }

    /// Run a migration to completion in the current task, on a fresh tracker
    pub async fn migrate(&self) -> Result<RunReport> {
        let progress = self.progress.begin_run();
        self.orchestrator.run(&progress).await
    }

    pub fn status(&self) -> MigrationSnapshot {
        self.progress.latest_status()
    }

    pub fn statistics(&self) -> Result<MigrationStatistics> {
        self.statistics.statistics()
    }

    pub fn verify(&self) -> Result<VerifyReport> {
        verify_placement(self.stores(), self.router())
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState::new(
            self.orchestrator.clone(),
            self.progress.clone(),
            self.statistics.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::seed_legacy;

    fn config() -> Config {
        let mut config = Config::default();
        config.migration.delay_between_batches_ms = 0;
        config.migration.batch_size = 8;
        config
    }

    #[tokio::test]
    async fn test_in_memory_round() {
        let engine = Engine::in_memory(config()).unwrap();
        let legacy = engine.stores().store(Partition::Legacy).unwrap();
        seed_legacy(legacy, 20, 3, 2).unwrap();

        let report = engine.migrate().await.unwrap();
        assert_eq!(report.succeeded(), 20);
        assert!(engine.verify().unwrap().is_clean());
        let stats = engine.statistics().unwrap();
        assert_eq!(stats.migrated_total, 20);
        assert_eq!(stats.pending_total, 0);
        assert_eq!(engine.status().total_pages, 20);
    }

    #[tokio::test]
    async fn test_each_run_gets_its_own_tracker() {
        let engine = Engine::in_memory(config()).unwrap();
        let legacy = engine.stores().store(Partition::Legacy).unwrap();
        seed_legacy(legacy, 6, 1, 0).unwrap();
        engine.migrate().await.unwrap();
        let first = engine.progress();

        seed_legacy(legacy, 2, 1, 0).unwrap();
        engine.migrate().await.unwrap();
        let second = engine.progress();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.current_status().success_pages, 6);
        assert_eq!(second.current_status().total_pages, 2);
        assert_eq!(second.current_status().success_pages, 2);
        assert_eq!(engine.status().total_pages, 2);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = config();
        config.storage.shard_count = 0;
        assert!(Engine::in_memory(config).is_err());
    }
}
