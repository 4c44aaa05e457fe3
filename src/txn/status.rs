//! TransactionStatus and the version-handle encoding (spec §3, §4.G, §4.H).
//!
//! Grounded on the donor's `transaction/tx.rs` (`TransactionStatus` enum of
//! Active/Aborted/Committed) and `Transaction` struct, generalized from a
//! 32-bit id with no step counter into the spec's `(ts, step)` model: a
//! transaction can perform numbered steps visible to its own later steps
//! but not to concurrent transactions, so the identity a version is
//! authored under is `(ts, step)`, not just `ts`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::txn::timestamp::Timestamp;

/// Sentinel `tc` values. A real commit timestamp is always `> 0`.
pub const UNCOMMITTED: i64 = 0;
pub const ABORTED: i64 = -1;

pub type Step = u32;

/// A version handle packs a transaction's start timestamp and step number
/// into one 64-bit value, as spec.md's glossary describes. We use the low
/// 20 bits for the step (a transaction performing over a million steps is
/// not a case this engine needs to support) and the high 44 bits for the
/// timestamp.
const STEP_BITS: u32 = 20;
const STEP_MASK: u64 = (1 << STEP_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionHandle(pub u64);

impl VersionHandle {
    pub fn new(ts: Timestamp, step: Step) -> Self {
        debug_assert!((step as u64) <= STEP_MASK, "step overflowed version handle");
        VersionHandle((ts << STEP_BITS) | (step as u64 & STEP_MASK))
    }

    pub fn ts(&self) -> Timestamp {
        self.0 >> STEP_BITS
    }

    pub fn step(&self) -> Step {
        (self.0 & STEP_MASK) as Step
    }
}

impl fmt::Display for VersionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "vh({}@{})", self.ts(), self.step())
    }
}

/// In-memory record per live (or recently-finished) transaction.
///
/// `tc` starts at `UNCOMMITTED` and is set exactly once, either to a
/// positive commit timestamp or to `ABORTED`. `mvv_count` tracks how many
/// MVV versions this transaction authored that have not yet been pruned;
/// the status cannot be freed while it is nonzero (spec §4.G "Aborted
/// retention").
pub struct TransactionStatus {
    pub ts: Timestamp,
    tc: AtomicI64,
    mvv_count: AtomicU32,
    /// Transactions blocked in `wwDependency` waiting on this one park a
    /// condvar here; `notify_waiters` wakes them once `tc` is set.
    pub wait_lock: Mutex<()>,
    pub wait_cv: std::sync::Condvar,
    /// Accumulator deltas this transaction has authored, keyed by
    /// `(accumulator id, step)` and coalesced at record time (spec §4.I:
    /// "one Delta per (accumulator, step) per transaction").
    deltas: Mutex<HashMap<(u64, Step), i64>>,
}

impl TransactionStatus {
    pub fn new(ts: Timestamp) -> Self {
        Self {
            ts,
            tc: AtomicI64::new(UNCOMMITTED),
            mvv_count: AtomicU32::new(0),
            wait_lock: Mutex::new(()),
            wait_cv: std::sync::Condvar::new(),
            deltas: Mutex::new(HashMap::new()),
        }
    }

    pub fn tc(&self) -> i64 {
        self.tc.load(Ordering::SeqCst)
    }

    pub fn is_uncommitted(&self) -> bool {
        self.tc() == UNCOMMITTED
    }

    pub fn is_committed(&self) -> bool {
        self.tc() > 0
    }

    pub fn is_aborted(&self) -> bool {
        self.tc() == ABORTED
    }

    pub fn commit(&self, tc: Timestamp) {
        self.tc.store(tc as i64, Ordering::SeqCst);
        let _guard = self.wait_lock.lock().unwrap();
        self.wait_cv.notify_all();
    }

    pub fn abort(&self) {
        self.tc.store(ABORTED, Ordering::SeqCst);
        let _guard = self.wait_lock.lock().unwrap();
        self.wait_cv.notify_all();
    }

    pub fn note_version_authored(&self) {
        self.mvv_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn note_version_pruned(&self) {
        self.mvv_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mvv_count(&self) -> u32 {
        self.mvv_count.load(Ordering::SeqCst)
    }

    /// Record (or coalesce into) this transaction's delta for one
    /// accumulator step. `combine` is the accumulator's own combine rule
    /// (`+` for SUM/SEQ, `min`/`max` for MIN/MAX) so the coalescing here
    /// stays correct for whichever kind owns `accumulator_id`.
    pub fn record_delta(&self, accumulator_id: u64, step: Step, value: i64, combine: impl Fn(i64, i64) -> i64) {
        let mut deltas = self.deltas.lock().unwrap();
        deltas
            .entry((accumulator_id, step))
            .and_modify(|v| *v = combine(*v, value))
            .or_insert(value);
    }

    /// This transaction's deltas for one accumulator, as `(step, value)`
    /// pairs, in no particular order.
    pub fn deltas_for(&self, accumulator_id: u64) -> Vec<(Step, i64)> {
        self.deltas
            .lock()
            .unwrap()
            .iter()
            .filter(|((id, _), _)| *id == accumulator_id)
            .map(|((_, step), v)| (*step, *v))
            .collect()
    }

    /// Resolve visibility of a version authored by `self` for a reader at
    /// `(reader_ts, reader_step)`, as this same transaction (spec §4.G
    /// "same-transaction versions at step <= reader's step are visible").
    pub fn visible_to_self(&self, authored_step: Step, reader_step: Step) -> bool {
        authored_step <= reader_step
    }
}

impl fmt::Debug for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TransactionStatus{{ts: {}, tc: {}, mvv_count: {}}}",
            self.ts,
            self.tc(),
            self.mvv_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_handle_round_trips() {
        let vh = VersionHandle::new(123_456, 7);
        assert_eq!(vh.ts(), 123_456);
        assert_eq!(vh.step(), 7);
    }

    #[test]
    fn status_transitions() {
        let status = TransactionStatus::new(10);
        assert!(status.is_uncommitted());
        status.commit(20);
        assert!(status.is_committed());
        assert_eq!(status.tc(), 20);
    }

    #[test]
    fn abort_is_sticky() {
        let status = TransactionStatus::new(10);
        status.abort();
        assert!(status.is_aborted());
    }
}
