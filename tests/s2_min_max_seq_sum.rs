mod common;

use kappa_store::AccumulatorKind;

/// 100000 committed transactions each bump SUM, MIN, MAX and SEQ
/// accumulators; after a checkpoint folds every participant into each
/// accumulator's base, the snapshot values must match the literal
/// totals the update sequence produces.
#[test]
fn min_max_seq_sum_after_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::test_engine(dir.path());
    engine.create_tree("main", "metrics").unwrap();

    for i in 0i64..100_000 {
        let txn = engine.begin_transaction();
        engine.accumulator_update(&txn, "main", "metrics", AccumulatorKind::Sum, 0, i).unwrap();
        engine
            .accumulator_update(&txn, "main", "metrics", AccumulatorKind::Min, 1, -1000 - (i % 17))
            .unwrap();
        engine
            .accumulator_update(&txn, "main", "metrics", AccumulatorKind::Max, 2, 1000 + (i % 17))
            .unwrap();
        engine.accumulator_update(&txn, "main", "metrics", AccumulatorKind::Seq, 3, 3).unwrap();
        engine.commit(txn).unwrap();
    }

    engine.checkpoint().unwrap();

    let reader = engine.begin_transaction();
    assert_eq!(
        engine.accumulator_snapshot(reader.ts(), "main", "metrics", AccumulatorKind::Min, 1).unwrap(),
        -1016
    );
    assert_eq!(
        engine.accumulator_snapshot(reader.ts(), "main", "metrics", AccumulatorKind::Max, 2).unwrap(),
        1016
    );
    assert_eq!(
        engine.accumulator_snapshot(reader.ts(), "main", "metrics", AccumulatorKind::Seq, 3).unwrap(),
        300_000
    );
    assert_eq!(
        engine.accumulator_snapshot(reader.ts(), "main", "metrics", AccumulatorKind::Sum, 0).unwrap(),
        4_999_950_000
    );
    engine.abort(reader);
}
