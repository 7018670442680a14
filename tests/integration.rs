//! Integration tests for pageshard on RocksDB

use pageshard::migration::RunStatus;
use pageshard::ops::seed_legacy;
use pageshard::{Config, Engine, Partition};
use std::time::Instant;
use tempfile::TempDir;

fn config(dir: &TempDir, shards: u16) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.storage.shard_count = shards;
    config.migration.batch_size = 16;
    config.migration.delay_between_batches_ms = 0;
    config.progress.report_interval = 5;
    config
}

#[tokio::test]
async fn test_migration_persists_across_reopen() {
    let dir = TempDir::new().unwrap();

    // Seed and migrate
    let ids = {
        let engine = Engine::open(config(&dir, 3)).unwrap();
        let ids = seed_legacy(engine.stores().store(Partition::Legacy).unwrap(), 40, 4, 2).unwrap();
        let report = engine.migrate().await.unwrap();
        assert_eq!(report.succeeded(), 40);
        assert_eq!(report.failed, 0);
        assert_eq!(report.processed, 40);
        ids
    };

    // Reopen and verify
    {
        let engine = Engine::open(config(&dir, 3)).unwrap();
        let verify = engine.verify().unwrap();
        assert!(verify.is_clean(), "{:?}", verify);
        assert_eq!(verify.legacy_pages + verify.shard_pages, 40);

        for id in &ids {
            let target = engine.router().target(id).unwrap();
            let txn = engine.stores().store(target).unwrap().begin(true).unwrap();
            let aggregate = txn.load_aggregate(*id).unwrap().unwrap();
            assert_eq!(aggregate.blocks.len(), 4);
            assert_eq!(aggregate.permissions.len(), 2);
            if target.is_legacy() {
                assert_eq!(
                    aggregate.page.migration_status,
                    Some(pageshard::store::MigrationStatus::Migrated)
                );
            } else {
                assert_eq!(aggregate.page.migration_status, None);
            }
        }

        let stats = engine.statistics().unwrap();
        assert_eq!(stats.migrated_total, 40);
        assert_eq!(stats.pending_total, 0);

        // the snapshot written by the first process is visible here
        let snapshot = engine.status();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.total_pages, 40);
        assert_eq!(snapshot.processed_pages, 40);
        assert_eq!(snapshot.progress_percentage, 100.0);
    }
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(config(&dir, 2)).unwrap();
    seed_legacy(engine.stores().store(Partition::Legacy).unwrap(), 10, 1, 1).unwrap();

    engine.migrate().await.unwrap();
    let again = engine.migrate().await.unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(again.batches, 0);
    assert!(engine.verify().unwrap().is_clean());
}

#[tokio::test]
async fn test_observer_opens_beside_running_writer() {
    let dir = TempDir::new().unwrap();
    let writer = Engine::open(config(&dir, 2)).unwrap();
    seed_legacy(writer.stores().store(Partition::Legacy).unwrap(), 12, 2, 1).unwrap();
    writer.migrate().await.unwrap();

    // the writer still holds every store open
    let observer = Engine::open_read_only(config(&dir, 2)).unwrap();
    let snapshot = observer.status();
    assert_eq!(snapshot.status, RunStatus::Completed);
    assert_eq!(snapshot.processed_pages, 12);
    assert_eq!(observer.statistics().unwrap().migrated_total, 12);
    assert!(observer.verify().unwrap().is_clean());

    let err = observer.migrate().await.unwrap_err();
    assert!(matches!(err, pageshard::Error::ReadOnlyTransaction), "{}", err);
    assert_eq!(writer.statistics().unwrap().migrated_total, 12);
}

#[tokio::test]
async fn stress_migrate_in_memory() {
    let mut config = Config::default();
    config.migration.delay_between_batches_ms = 0;
    config.migration.batch_size = 200;
    config.progress.report_interval = 250;
    let engine = Engine::in_memory(config).unwrap();

    let n = 2_000;
    seed_legacy(engine.stores().store(Partition::Legacy).unwrap(), n, 3, 1).unwrap();

    let start = Instant::now();
    let report = engine.migrate().await.unwrap();
    let elapsed = start.elapsed();

    println!("Migrated {} pages in {:?}", n, elapsed);
    assert_eq!(report.succeeded(), n);
    assert!(elapsed.as_secs_f64() < 60.0, "Migration too slow");
}
