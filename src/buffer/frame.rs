//! A single buffer-pool frame: page-sized storage plus the metadata the
//! pool needs to pick eviction victims and flush candidates (spec §4.C).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::txn::timestamp::Timestamp;
use crate::volume::PageId;

/// Sentinel `volume_id` meaning "this frame holds no page".
pub const EMPTY: u32 = 0;

pub struct Frame {
    pub volume_id: AtomicU32,
    pub page_id: AtomicU64,
    pub dirty: AtomicBool,
    /// Timestamp at which the page was first dirtied since its last
    /// flush; `0` means clean.
    pub dirty_ts: AtomicU64,
    /// Clock/second-chance bit for eviction (spec §4.C "LRU/clock").
    pub clock_bit: AtomicBool,
    pub data: RwLock<Vec<u8>>,
}

impl Frame {
    pub fn new(page_size: usize) -> Self {
        Self {
            volume_id: AtomicU32::new(EMPTY),
            page_id: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            dirty_ts: AtomicU64::new(0),
            clock_bit: AtomicBool::new(false),
            data: RwLock::new(vec![0u8; page_size]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.volume_id.load(Ordering::SeqCst) == EMPTY
    }

    pub fn key(&self) -> (u32, PageId) {
        (
            self.volume_id.load(Ordering::SeqCst),
            self.page_id.load(Ordering::SeqCst),
        )
    }

    /// Mark dirty, recording `at` only if this is the first dirtying
    /// since the last flush — the write-priority formula needs how long
    /// *ago* the page went dirty, not the most recent touch.
    pub fn mark_dirty(&self, at: Timestamp) {
        self.dirty.store(true, Ordering::SeqCst);
        let _ = self
            .dirty_ts
            .compare_exchange(0, at, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
        self.dirty_ts.store(0, Ordering::SeqCst);
    }
}
