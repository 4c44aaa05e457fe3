use std::sync::Once;

use kappa_store::config::{BufferPoolSpec, VolumeOpenMode, VolumeSpec};
use kappa_store::{AccumulatorKind, Engine, EngineConfig};

static INIT: Once = Once::new();

fn init_log() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn test_config(dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        volumes: vec![VolumeSpec {
            name: "main".to_string(),
            path: dir.join("main.vol"),
            create: VolumeOpenMode::Create,
            page_size: 4096,
            initial_pages: 4,
            extension_pages: 4,
            maximum_pages: 1024,
        }],
        buffer_pools: vec![BufferPoolSpec { page_size: 4096, frame_count: 64 }],
        journal_path: dir.join("journal"),
        poll_interval_ms: None,
        ..EngineConfig::default()
    }
}

#[test]
fn store_is_visible_after_commit_and_survives_reopen() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    {
        let engine = Engine::open(config.clone()).unwrap();
        engine.create_tree("main", "orders").unwrap();

        let txn = engine.begin_transaction();
        engine.store(&txn, "orders", b"k1", b"v1").unwrap();
        engine.commit(txn).unwrap();

        let reader = engine.begin_transaction();
        let value = engine.fetch(reader.ts(), 0, "orders", b"k1").unwrap();
        assert_eq!(value, Some(b"v1".to_vec()));
        engine.abort(reader);
        engine.close().unwrap();
    }

    // Reopening replays the journal: the committed write must still be there.
    let engine = Engine::open(config).unwrap();
    let reader = engine.begin_transaction();
    let value = engine.fetch(reader.ts(), 0, "orders", b"k1").unwrap();
    assert_eq!(value, Some(b"v1".to_vec()));
}

#[test]
fn aborted_transaction_leaves_no_trace() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(test_config(dir.path())).unwrap();
    engine.create_tree("main", "orders").unwrap();

    let txn = engine.begin_transaction();
    engine.store(&txn, "orders", b"k1", b"v1").unwrap();
    engine.abort(txn);

    let reader = engine.begin_transaction();
    let value = engine.fetch(reader.ts(), 0, "orders", b"k1").unwrap();
    assert_eq!(value, None);
}

#[test]
fn accumulator_delta_is_visible_only_after_commit() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(test_config(dir.path())).unwrap();
    engine.create_tree("main", "counters").unwrap();

    let txn = engine.begin_transaction();
    engine.accumulator_update(&txn, "main", "counters", AccumulatorKind::Sum, 0, 5).unwrap();

    let acc = engine.accumulator("main", "counters", AccumulatorKind::Sum, 0).unwrap();
    assert_eq!(acc.live_value(), 5);

    let reader_ts_before_commit = engine.begin_transaction().ts();
    let before = engine
        .accumulator_snapshot(reader_ts_before_commit, "main", "counters", AccumulatorKind::Sum, 0)
        .unwrap();
    assert_eq!(before, 0);

    engine.commit(txn).unwrap();
    let reader = engine.begin_transaction();
    let after = engine
        .accumulator_snapshot(reader.ts(), "main", "counters", AccumulatorKind::Sum, 0)
        .unwrap();
    assert_eq!(after, 5);
}

#[test]
fn removing_a_tree_eventually_reclaims_its_pages() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(test_config(dir.path())).unwrap();
    engine.create_tree("main", "scratch").unwrap();

    let txn = engine.begin_transaction();
    engine.store(&txn, "scratch", b"k1", b"v1").unwrap();
    engine.commit(txn).unwrap();

    engine.remove_tree("main", "scratch").unwrap();
    let drained = engine.cleanup().run_all_pending(&engine);
    assert_eq!(drained, 1);
    assert_eq!(engine.cleanup().stats().snapshot().pages_reclaimed, 1);
}
