//! Recovery test for pageshard: crash mid-migration and restart

use pageshard::ops::seed_legacy;
use pageshard::store::MigrationStatus;
use pageshard::{Config, Engine, Partition};
use tempfile::TempDir;

fn config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.storage.shard_count = 3;
    config.migration.delay_between_batches_ms = 0;
    config
}

#[tokio::test]
async fn test_recovery_after_crash() {
    let dir = TempDir::new().unwrap();

    // Seed, then leave one page half-copied and MIGRATING
    let (crashed, target) = {
        let engine = Engine::open(config(&dir)).unwrap();
        let legacy = engine.stores().store(Partition::Legacy).unwrap();
        let ids = seed_legacy(legacy, 12, 3, 1).unwrap();
        let (id, target) = ids
            .iter()
            .map(|id| (*id, engine.router().target(id).unwrap()))
            .find(|(_, target)| !target.is_legacy())
            .unwrap();

        let claimed = engine
            .stores()
            .legacy()
            .transition_status(id, &[MigrationStatus::Ready], MigrationStatus::Migrating)
            .unwrap();
        assert_eq!(claimed, 1);

        let source = legacy.begin(true).unwrap().load_aggregate(id).unwrap().unwrap();
        let mut txn = engine.stores().store(target).unwrap().begin(false).unwrap();
        let mut partial = source.page.clone();
        partial.migration_status = None;
        txn.insert_page(&partial).unwrap();
        txn.insert_block(&source.blocks[0]).unwrap();
        txn.commit().unwrap();
        (id, target)
    };

    // Simulate crash (drop engine)
    // Reopen: the damage is visible before the next run
    {
        let engine = Engine::open(config(&dir)).unwrap();
        let verify = engine.verify().unwrap();
        assert_eq!(verify.stuck_migrating, vec![crashed]);
        assert_eq!(verify.duplicates, vec![crashed]);

        let report = engine.migrate().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.succeeded(), 12);

        let verify = engine.verify().unwrap();
        assert!(verify.is_clean(), "{:?}", verify);
        let txn = engine.stores().store(target).unwrap().begin(true).unwrap();
        let copy = txn.load_aggregate(crashed).unwrap().unwrap();
        assert_eq!(copy.blocks.len(), 3);
        assert_eq!(copy.permissions.len(), 1);
        drop(txn);
        assert_eq!(engine.stores().legacy().status(crashed).unwrap(), None);
    }
}

#[tokio::test]
async fn test_failed_pages_survive_restart() {
    let dir = TempDir::new().unwrap();
    let failed = {
        let engine = Engine::open(config(&dir)).unwrap();
        let ids = seed_legacy(engine.stores().store(Partition::Legacy).unwrap(), 3, 1, 0).unwrap();
        engine
            .stores()
            .legacy()
            .transition_status(ids[1], &[MigrationStatus::Ready], MigrationStatus::Failed)
            .unwrap();
        ids[1]
    };

    let engine = Engine::open(config(&dir)).unwrap();
    assert_eq!(engine.statistics().unwrap().legacy.failed, 1);
    let report = engine.migrate().await.unwrap();
    assert_eq!(report.succeeded(), 3);
    assert_ne!(
        engine.stores().legacy().status(failed).unwrap(),
        Some(MigrationStatus::Failed)
    );
}
