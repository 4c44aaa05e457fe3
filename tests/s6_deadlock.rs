mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

enum Outcome {
    Committed,
    Aborted,
}

/// T1 writes k1 then k2; T2 writes k2 then k1 — a classic lock-order
/// cycle. Exactly one side must win; the other must discover the
/// deadlock and fail fast rather than ride out the ww-wait timeout.
#[test]
fn exactly_one_side_of_a_deadlock_wins() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(common::test_engine(dir.path()));
    engine.create_tree("main", "locks").unwrap();

    let t1 = engine.begin_transaction();
    engine.store(&t1, "locks", b"k1", b"t1").unwrap();
    let t2 = engine.begin_transaction();
    engine.store(&t2, "locks", b"k2", b"t2").unwrap();

    let barrier = Arc::new(Barrier::new(2));

    let e1 = Arc::clone(&engine);
    let b1 = Arc::clone(&barrier);
    let h1 = thread::spawn(move || {
        b1.wait();
        let started = Instant::now();
        match e1.store(&t1, "locks", b"k2", b"t1-again") {
            Ok(()) => {
                let elapsed = started.elapsed();
                e1.commit(t1).unwrap();
                (Outcome::Committed, elapsed)
            }
            Err(_) => {
                let elapsed = started.elapsed();
                e1.abort(t1);
                (Outcome::Aborted, elapsed)
            }
        }
    });

    let e2 = Arc::clone(&engine);
    let b2 = Arc::clone(&barrier);
    let h2 = thread::spawn(move || {
        b2.wait();
        let started = Instant::now();
        match e2.store(&t2, "locks", b"k1", b"t2-again") {
            Ok(()) => {
                let elapsed = started.elapsed();
                e2.commit(t2).unwrap();
                (Outcome::Committed, elapsed)
            }
            Err(_) => {
                let elapsed = started.elapsed();
                e2.abort(t2);
                (Outcome::Aborted, elapsed)
            }
        }
    });

    let (outcome1, elapsed1) = h1.join().unwrap();
    let (outcome2, elapsed2) = h2.join().unwrap();

    let committed = matches!(outcome1, Outcome::Committed) as u8 + matches!(outcome2, Outcome::Committed) as u8;
    let aborted = matches!(outcome1, Outcome::Aborted) as u8 + matches!(outcome2, Outcome::Aborted) as u8;
    assert_eq!(committed, 1, "exactly one side of the cycle must commit");
    assert_eq!(aborted, 1, "exactly one side of the cycle must observe the deadlock");

    let loser_elapsed = if matches!(outcome1, Outcome::Aborted) { elapsed1 } else { elapsed2 };
    assert!(
        loser_elapsed < Duration::from_secs(1),
        "deadlock must be detected well under the ww-wait timeout, took {:?}",
        loser_elapsed
    );
}
