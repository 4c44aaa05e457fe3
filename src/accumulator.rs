//! 4.I Accumulator: transactionally-consistent SUM/MIN/MAX/SEQ aggregates.
//!
//! Grounded on the Transaction Index (§4.G): an accumulator's snapshot
//! value is just another form of MVCC visibility resolution, walking
//! per-transaction deltas the same way `MvvCell::visible_for` walks
//! per-transaction versions (`src/mvv.rs`). There is no direct donor
//! analogue — small-db-small-db has no aggregate type — so the shape
//! here follows the engine's own codec (`src/codec.rs`) for the wire
//! format and the Transaction Index for the concurrency discipline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::{ByteReader, ByteWriter, Decodeable, Encodeable};
use crate::error::{EngineError, EngineResult};
use crate::txn::index::TransactionIndex;
use crate::txn::status::{Step, TransactionStatus};
use crate::txn::timestamp::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorKind {
    Sum,
    Min,
    Max,
    Seq,
}

impl AccumulatorKind {
    fn tag(self) -> u8 {
        match self {
            AccumulatorKind::Sum => 0,
            AccumulatorKind::Min => 1,
            AccumulatorKind::Max => 2,
            AccumulatorKind::Seq => 3,
        }
    }

    fn from_tag(tag: u8) -> EngineResult<Self> {
        match tag {
            0 => Ok(AccumulatorKind::Sum),
            1 => Ok(AccumulatorKind::Min),
            2 => Ok(AccumulatorKind::Max),
            3 => Ok(AccumulatorKind::Seq),
            other => Err(EngineError::CorruptValue(format!(
                "unknown accumulator kind tag {}",
                other
            ))),
        }
    }

    pub fn identity(self) -> i64 {
        match self {
            AccumulatorKind::Sum | AccumulatorKind::Seq => 0,
            AccumulatorKind::Min => i64::MAX,
            AccumulatorKind::Max => i64::MIN,
        }
    }

    pub fn combine(self, a: i64, b: i64) -> i64 {
        match self {
            AccumulatorKind::Sum | AccumulatorKind::Seq => a.saturating_add(b),
            AccumulatorKind::Min => a.min(b),
            AccumulatorKind::Max => a.max(b),
        }
    }
}

/// The persisted form of an accumulator's checkpointed state (spec §6):
/// `kind(1) | index(4) | base(8) | treeName-length(2) | treeName(bytes)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulatorState {
    pub kind: AccumulatorKind,
    pub index: u32,
    pub base: i64,
    pub tree_name: String,
}

impl Encodeable for AccumulatorState {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(15 + self.tree_name.len());
        writer.write(&self.kind.tag());
        writer.write(&self.index);
        writer.write(&self.base);
        writer.write(&self.tree_name);
        writer.into_bytes()
    }
}

impl Decodeable for AccumulatorState {
    fn decode_from(reader: &mut ByteReader<'_>) -> EngineResult<Self> {
        let tag: u8 = reader.read()?;
        let index: u32 = reader.read()?;
        let base: i64 = reader.read()?;
        let tree_name: String = reader.read()?;
        Ok(AccumulatorState {
            kind: AccumulatorKind::from_tag(tag)?,
            index,
            base,
            tree_name,
        })
    }
}

fn accumulator_id(tree_id: u32, index: u32) -> u64 {
    ((tree_id as u64) << 32) | index as u64
}

/// A live, in-memory accumulator. `base` is the checkpointed value as of
/// the last `checkpoint()`; `live` reflects every update applied since,
/// visible to every reader regardless of transaction boundaries (used by
/// callers that want "approximately current," e.g. SEQ's gap-free
/// allocator semantics); `snapshot_value` is the MVCC-correct read.
pub struct Accumulator {
    pub id: u64,
    pub kind: AccumulatorKind,
    pub index: u32,
    pub tree_name: String,
    base: AtomicI64,
    live: AtomicI64,
    participants: Mutex<HashMap<Timestamp, Arc<TransactionStatus>>>,
}

impl Accumulator {
    pub fn new(tree_id: u32, kind: AccumulatorKind, index: u32, tree_name: String, base: i64) -> Self {
        Self {
            id: accumulator_id(tree_id, index),
            kind,
            index,
            tree_name,
            base: AtomicI64::new(base),
            live: AtomicI64::new(base),
            participants: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_state(tree_id: u32, state: AccumulatorState) -> Self {
        Self::new(tree_id, state.kind, state.index, state.tree_name, state.base)
    }

    pub fn base(&self) -> i64 {
        self.base.load(Ordering::SeqCst)
    }

    pub fn live_value(&self) -> i64 {
        self.live.load(Ordering::SeqCst)
    }

    /// Atomically combine `value` into the live value and record a
    /// coalesced delta on `txn`. Returns the post-combine live value,
    /// which is what SEQ's `allocate()` caller wants — the updated value
    /// *before* commit ordering is even decided (spec §4.I "SEQ
    /// semantics").
    pub fn update(&self, value: i64, txn: &Arc<TransactionStatus>, step: Step) -> i64 {
        let mut current = self.live.load(Ordering::SeqCst);
        let next = loop {
            let candidate = self.kind.combine(current, value);
            match self.live.compare_exchange_weak(
                current,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break candidate,
                Err(observed) => current = observed,
            }
        };

        txn.record_delta(self.id, step, value, |a, b| self.kind.combine(a, b));
        self.participants
            .lock()
            .unwrap()
            .entry(txn.ts)
            .or_insert_with(|| Arc::clone(txn));

        next
    }

    /// MVCC-correct snapshot read (spec §4.I): base combined with every
    /// delta whose authoring transaction is visible to `(reader_ts,
    /// reader_step)`. Restarts if the `ActiveTransactionCache` shifts
    /// mid-walk, since a transaction committing partway through the walk
    /// could otherwise be seen only partially.
    pub fn snapshot_value(&self, index: &TransactionIndex, reader_ts: Timestamp, reader_step: Step) -> i64 {
        loop {
            let floor_before = index.cache.floor();
            let mut acc = self.base();

            let participants: Vec<Arc<TransactionStatus>> =
                self.participants.lock().unwrap().values().cloned().collect();

            for txn in &participants {
                let same_txn = txn.ts == reader_ts;
                let visible = if same_txn {
                    true
                } else {
                    let tc = txn.tc();
                    tc > 0 && (tc as u64) <= reader_ts
                };
                if !visible {
                    continue;
                }
                for (step, delta) in txn.deltas_for(self.id) {
                    if same_txn && step > reader_step {
                        continue;
                    }
                    acc = self.kind.combine(acc, delta);
                }
            }

            if index.cache.floor() == floor_before {
                return acc;
            }
            // else: the active set moved under us, restart the walk.
        }
    }

    /// Fold into `base` every delta from a transaction that committed at
    /// or before `at`, dropping those transactions from the participant
    /// set. Returns the new base so the caller can persist an
    /// `AccumulatorState` into the tree's metadata.
    pub fn checkpoint(&self, at: Timestamp) -> i64 {
        let mut acc = self.base();
        let mut participants = self.participants.lock().unwrap();
        participants.retain(|_, txn| {
            let tc = txn.tc();
            if tc > 0 && (tc as u64) <= at {
                for (_, delta) in txn.deltas_for(self.id) {
                    acc = self.kind.combine(acc, delta);
                }
                false
            } else {
                true
            }
        });
        self.base.store(acc, Ordering::SeqCst);
        acc
    }

    pub fn to_state(&self) -> AccumulatorState {
        AccumulatorState {
            kind: self.kind,
            index: self.index,
            base: self.base(),
            tree_name: self.tree_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_record_round_trips() {
        let state = AccumulatorState {
            kind: AccumulatorKind::Sum,
            index: 3,
            base: -42,
            tree_name: "orders".to_string(),
        };
        let bytes = state.encode();
        let mut reader = ByteReader::new(&bytes);
        let decoded = AccumulatorState::decode_from(&mut reader).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn sum_update_returns_running_live_value() {
        let index = TransactionIndex::new(4);
        let txn = index.register();
        let acc = Accumulator::new(1, AccumulatorKind::Sum, 0, "t".to_string(), 0);

        assert_eq!(acc.update(5, &txn, 0), 5);
        assert_eq!(acc.update(3, &txn, 1), 8);
    }

    #[test]
    fn seq_allocator_is_gap_free_per_process() {
        let index = TransactionIndex::new(4);
        let txn = index.register();
        let acc = Accumulator::new(1, AccumulatorKind::Seq, 0, "ids".to_string(), 0);

        let a = acc.update(1, &txn, 0);
        let b = acc.update(1, &txn, 1);
        let c = acc.update(1, &txn, 2);
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn snapshot_only_sees_committed_deltas() {
        let index = TransactionIndex::new(4);
        let acc = Accumulator::new(1, AccumulatorKind::Sum, 0, "t".to_string(), 100);

        let writer = index.register();
        acc.update(10, &writer, 0);

        let reader = index.register();
        assert_eq!(acc.snapshot_value(&index, reader.ts, 0), 100);

        let commit_ts = index.allocator.update();
        index.commit(writer.ts, commit_ts);

        let later_reader_ts = index.allocator.update();
        assert_eq!(acc.snapshot_value(&index, later_reader_ts, 0), 110);
    }

    #[test]
    fn min_max_take_the_extreme_not_the_sum() {
        let index = TransactionIndex::new(4);
        let writer = index.register();
        let acc = Accumulator::new(1, AccumulatorKind::Min, 0, "t".to_string(), 50);

        acc.update(30, &writer, 0);
        acc.update(70, &writer, 1);
        let commit_ts = index.allocator.update();
        index.commit(writer.ts, commit_ts);

        let reader_ts = index.allocator.update();
        assert_eq!(acc.snapshot_value(&index, reader_ts, 0), 30);
    }

    #[test]
    fn checkpoint_folds_committed_deltas_into_base() {
        let index = TransactionIndex::new(4);
        let writer = index.register();
        let acc = Accumulator::new(1, AccumulatorKind::Sum, 0, "t".to_string(), 0);
        acc.update(5, &writer, 0);
        let commit_ts = index.allocator.update();
        index.commit(writer.ts, commit_ts);

        let new_base = acc.checkpoint(commit_ts);
        assert_eq!(new_base, 5);
        assert_eq!(acc.base(), 5);
    }
}
