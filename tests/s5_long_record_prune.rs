mod common;

/// An aborted long-record insert must disappear once pruned — its
/// chain freed, the page left structurally sound — and never be
/// visible to a later reader.
#[test]
fn aborted_long_record_prunes_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::test_engine(dir.path());
    engine.create_tree("main", "blobs").unwrap();

    let big_value = vec![0x5Au8; 5_000];

    let t1 = engine.begin_transaction();
    engine.store(&t1, "blobs", b"K", &big_value).unwrap();
    engine.abort(t1);

    engine.checkpoint().unwrap();

    let floor_txn = engine.begin_transaction();
    let floor = floor_txn.ts();
    engine.abort(floor_txn);

    loop {
        let n = engine.prune_tree("blobs", floor).unwrap();
        if n == 0 {
            break;
        }
    }

    engine.verify_tree("blobs").unwrap();

    let t2 = engine.begin_transaction();
    assert_eq!(engine.fetch(t2.ts(), 0, "blobs", b"K").unwrap(), None);
    engine.abort(t2);
}
