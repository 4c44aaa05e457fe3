mod common;

use kappa_store::AccumulatorKind;

/// Two transactions concurrently bump a SUM accumulator by 1 each; each
/// sees only its own update until it commits.
#[test]
fn sum_accumulator_snapshot_isolation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::test_engine(dir.path());
    engine.create_tree("main", "ledger").unwrap();

    let t1 = engine.begin_transaction();
    let t2 = engine.begin_transaction();

    engine.accumulator_update(&t1, "main", "ledger", AccumulatorKind::Sum, 0, 1).unwrap();
    engine.accumulator_update(&t2, "main", "ledger", AccumulatorKind::Sum, 0, 1).unwrap();

    assert_eq!(
        engine.accumulator_snapshot(t1.ts(), "main", "ledger", AccumulatorKind::Sum, 0).unwrap(),
        1
    );
    assert_eq!(
        engine.accumulator_snapshot(t2.ts(), "main", "ledger", AccumulatorKind::Sum, 0).unwrap(),
        1
    );

    let t2_ts = t2.ts();
    engine.commit(t1).unwrap();
    assert_eq!(
        engine.accumulator_snapshot(t2_ts, "main", "ledger", AccumulatorKind::Sum, 0).unwrap(),
        1
    );

    engine.commit(t2).unwrap();
    let t3 = engine.begin_transaction();
    assert_eq!(
        engine.accumulator_snapshot(t3.ts(), "main", "ledger", AccumulatorKind::Sum, 0).unwrap(),
        2
    );
    engine.abort(t3);
}
