//! 4.A Timestamp Allocator — a monotonic 64-bit logical clock.
//!
//! Grounded on the donor's `transaction/tx.rs` `TRANSACTION_ID: AtomicU32`
//! counter, widened to `u64` and split into `current()`/`update()` per the
//! spec so recovery can seed it past the highest timestamp seen in the
//! journal without racing a live allocation.

use std::sync::atomic::{AtomicU64, Ordering};

/// A point in the engine's logical clock. Transaction start/commit
/// timestamps, checkpoint timestamps, and MVV version handles are all
/// drawn from the same sequence so that ordering comparisons between them
/// are meaningful.
pub type Timestamp = u64;

pub const TS_ZERO: Timestamp = 0;

pub struct TimestampAllocator {
    counter: AtomicU64,
}

impl TimestampAllocator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    /// Seed the allocator so it never reissues a timestamp already seen
    /// during journal recovery. Never decreases the counter.
    pub fn bump_floor(&self, seen: Timestamp) {
        self.counter.fetch_max(seen + 1, Ordering::SeqCst);
    }

    /// The last timestamp handed out, without allocating a new one.
    pub fn current(&self) -> Timestamp {
        self.counter.load(Ordering::SeqCst) - 1
    }

    /// Allocate and return the next timestamp. The hot path: a single
    /// atomic increment, no locks.
    pub fn update(&self) -> Timestamp {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate a timestamp tagged as a checkpoint boundary. Checkpoint
    /// timestamps are drawn from the same sequence as transaction
    /// timestamps — the "tag" is purely in how the caller records and uses
    /// the value, there is no separate namespace.
    pub fn allocate_checkpoint(&self) -> Timestamp {
        self.update()
    }
}

impl Default for TimestampAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonically_increasing() {
        let alloc = TimestampAllocator::new();
        let a = alloc.update();
        let b = alloc.update();
        assert!(b > a);
        assert_eq!(alloc.current(), b);
    }

    #[test]
    fn bump_floor_never_decreases() {
        let alloc = TimestampAllocator::new();
        let a = alloc.update();
        alloc.bump_floor(1);
        assert!(alloc.update() > a);

        alloc.bump_floor(10_000);
        let next = alloc.update();
        assert!(next > 10_000);
    }

    #[test]
    fn concurrent_updates_are_unique() {
        use std::sync::Arc;
        use std::thread;

        let alloc = Arc::new(TimestampAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..1000 {
                    seen.push(alloc.update());
                }
                seen
            }));
        }

        let mut all: Vec<Timestamp> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "timestamps must be unique");
    }
}
