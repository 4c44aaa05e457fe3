//! 4.C Buffer Pool: a fixed-size cache of page images with claim/release
//! latches, clock eviction, and checkpoint-aware dirty selection.
//!
//! Grounded on the donor's buffer pool in shape only (a fixed frame
//! table, a `(volume, pageId) -> frame` index) — its implementation is a
//! `static mut` singleton built around fixed-size tuple pages, which this
//! engine replaces with an owned `BufferPool` over opaque page images and
//! `parking_lot::RwLock` claims (see `latch.rs`).

pub mod frame;
pub mod latch;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{EngineError, EngineResult};
use crate::txn::timestamp::Timestamp;
use crate::volume::{PageId, Volume};
use frame::Frame;
use latch::DEFAULT_LATCH_TIMEOUT;

enum Claim<'a> {
    Read(RwLockReadGuard<'a, Vec<u8>>),
    Write(RwLockWriteGuard<'a, Vec<u8>>),
}

/// A claimed frame. Dropping it releases the latch.
pub struct FrameHandle<'a> {
    pool: &'a BufferPool,
    idx: usize,
    claim: Claim<'a>,
}

impl<'a> FrameHandle<'a> {
    pub fn volume_id(&self) -> u32 {
        self.pool.frames[self.idx].volume_id.load(Ordering::SeqCst)
    }

    pub fn page_id(&self) -> PageId {
        self.pool.frames[self.idx].page_id.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.claim {
            Claim::Read(g) => g,
            Claim::Write(g) => g,
        }
    }

    pub fn bytes_mut(&mut self) -> EngineResult<&mut [u8]> {
        match &mut self.claim {
            Claim::Write(g) => Ok(g),
            Claim::Read(_) => Err(EngineError::Config(
                "attempted to mutate a read-claimed frame".to_string(),
            )),
        }
    }

    /// Mark the frame dirty at timestamp `at`. Only valid on a write claim.
    pub fn mark_dirty(&mut self, at: Timestamp) -> EngineResult<()> {
        if !matches!(self.claim, Claim::Write(_)) {
            return Err(EngineError::Config(
                "attempted to dirty a read-claimed frame".to_string(),
            ));
        }
        self.pool.frames[self.idx].mark_dirty(at);
        Ok(())
    }
}

pub struct BufferPool {
    frames: Vec<Frame>,
    index: Mutex<HashMap<(u32, PageId), usize>>,
    free_list: Mutex<Vec<usize>>,
    clock_hand: AtomicUsize,
    volumes: Mutex<HashMap<u32, Arc<Volume>>>,
    latch_timeout: Duration,
    page_size: usize,
}

impl BufferPool {
    pub fn new(page_size: usize, frame_count: usize) -> Self {
        let mut frames = Vec::with_capacity(frame_count);
        let mut free_list = Vec::with_capacity(frame_count);
        for i in 0..frame_count {
            frames.push(Frame::new(page_size));
            free_list.push(i);
        }
        Self {
            frames,
            index: Mutex::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            clock_hand: AtomicUsize::new(0),
            volumes: Mutex::new(HashMap::new()),
            latch_timeout: DEFAULT_LATCH_TIMEOUT,
            page_size,
        }
    }

    pub fn with_latch_timeout(mut self, timeout: Duration) -> Self {
        self.latch_timeout = timeout;
        self
    }

    pub fn register_volume(&self, volume_id: u32, volume: Arc<Volume>) {
        self.volumes.lock().insert(volume_id, volume);
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn volume_for(&self, volume_id: u32) -> EngineResult<Arc<Volume>> {
        self.volumes
            .lock()
            .get(&volume_id)
            .cloned()
            .ok_or_else(|| EngineError::VolumeNotFound(format!("volume handle {}", volume_id)))
    }

    /// Claim a page, reading it from its volume on a cache miss. `wait`
    /// selects whether the claim blocks (honouring `latch_timeout`) or
    /// fails immediately if the frame is held incompatibly.
    pub fn get(&self, volume_id: u32, page_id: PageId, writable: bool, wait: bool) -> EngineResult<FrameHandle<'_>> {
        loop {
            let existing = self.index.lock().get(&(volume_id, page_id)).copied();

            if let Some(idx) = existing {
                let frame = &self.frames[idx];
                let claim = match self.try_claim(frame, writable, wait)? {
                    Some(c) => c,
                    None => continue,
                };
                if frame.key() != (volume_id, page_id) {
                    // Reassigned under us between the index lookup and
                    // the claim; the stale claim drops here, retry.
                    continue;
                }
                frame.clock_bit.store(true, Ordering::Relaxed);
                return Ok(FrameHandle { pool: self, idx, claim });
            }

            self.load_miss(volume_id, page_id)?;
            // loop back around: the page is now resident, claim it normally.
        }
    }

    fn try_claim<'a>(&self, frame: &'a Frame, writable: bool, wait: bool) -> EngineResult<Option<Claim<'a>>> {
        if writable {
            let guard = if wait {
                frame.data.try_write_for(self.latch_timeout)
            } else {
                frame.data.try_write()
            };
            match guard {
                Some(g) => Ok(Some(Claim::Write(g))),
                None if wait => Err(EngineError::InUse {
                    timeout_ms: self.latch_timeout.as_millis() as u64,
                }),
                None => Ok(None),
            }
        } else {
            let guard = if wait {
                frame.data.try_read_for(self.latch_timeout)
            } else {
                frame.data.try_read()
            };
            match guard {
                Some(g) => Ok(Some(Claim::Read(g))),
                None if wait => Err(EngineError::InUse {
                    timeout_ms: self.latch_timeout.as_millis() as u64,
                }),
                None => Ok(None),
            }
        }
    }

    fn load_miss(&self, volume_id: u32, page_id: PageId) -> EngineResult<()> {
        let volume = self.volume_for(volume_id)?;
        let idx = self.acquire_free_frame()?;
        let frame = &self.frames[idx];

        {
            let mut data = frame
                .data
                .try_write_for(self.latch_timeout)
                .ok_or(EngineError::InUse {
                    timeout_ms: self.latch_timeout.as_millis() as u64,
                })?;
            volume.read_page(page_id, &mut data)?;
        }

        frame.volume_id.store(volume_id, Ordering::SeqCst);
        frame.page_id.store(page_id, Ordering::SeqCst);
        frame.clear_dirty();
        self.index.lock().insert((volume_id, page_id), idx);
        Ok(())
    }

    /// Find a frame to load a page into: an unused one, or evict a victim
    /// by clock sweep, flushing it first if dirty.
    fn acquire_free_frame(&self) -> EngineResult<usize> {
        if let Some(idx) = self.free_list.lock().pop() {
            return Ok(idx);
        }

        let n = self.frames.len();
        for _ in 0..2 * n {
            let idx = self.clock_hand.fetch_add(1, Ordering::SeqCst) % n;
            let frame = &self.frames[idx];
            if frame.is_empty() {
                return Ok(idx);
            }
            if frame.clock_bit.swap(false, Ordering::SeqCst) {
                continue; // give it a second chance
            }
            if let Some(guard) = frame.data.try_write() {
                if frame.dirty.load(Ordering::SeqCst) {
                    let volume = self.volume_for(frame.volume_id.load(Ordering::SeqCst))?;
                    volume.write_page(frame.page_id.load(Ordering::SeqCst), &guard)?;
                }
                drop(guard);
                self.index.lock().remove(&frame.key());
                frame.volume_id.store(frame::EMPTY, Ordering::SeqCst);
                frame.clear_dirty();
                return Ok(idx);
            }
        }
        Err(EngineError::InUse { timeout_ms: 0 })
    }

    /// Flush up to `max_n` dirty frames, highest write-priority first.
    /// Priority rises steeply once a page's dirty timestamp is at or
    /// before `checkpoint_ts` (spec §4.C) since it must be durable before
    /// checkpoint completion; the returned set is reordered by ascending
    /// page address to allow coalesced I/O.
    pub fn select_dirty_buffers(&self, current_ts: Timestamp, checkpoint_ts: Timestamp, max_n: usize) -> Vec<(u32, PageId)> {
        let mut candidates: Vec<(u64, u32, PageId)> = Vec::new();
        for frame in &self.frames {
            if !frame.dirty.load(Ordering::SeqCst) {
                continue;
            }
            let dirty_ts = frame.dirty_ts.load(Ordering::SeqCst);
            if dirty_ts == 0 {
                continue;
            }
            let priority = if dirty_ts <= checkpoint_ts {
                u64::MAX - dirty_ts
            } else {
                current_ts.saturating_sub(dirty_ts)
            };
            candidates.push((
                priority,
                frame.volume_id.load(Ordering::SeqCst),
                frame.page_id.load(Ordering::SeqCst),
            ));
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates.truncate(max_n);
        candidates.sort_by_key(|c| c.2);
        candidates.into_iter().map(|(_, vol, pid)| (vol, pid)).collect()
    }

    pub fn flush_page(&self, volume_id: u32, page_id: PageId) -> EngineResult<()> {
        let idx = match self.index.lock().get(&(volume_id, page_id)).copied() {
            Some(idx) => idx,
            None => return Ok(()), // not resident, nothing to flush
        };
        let frame = &self.frames[idx];
        let guard = frame.data.write();
        if frame.dirty.load(Ordering::SeqCst) {
            let volume = self.volume_for(volume_id)?;
            volume.write_page(page_id, &guard)?;
            frame.clear_dirty();
            debug!("flushed dirty page {} of volume {}", page_id, volume_id);
        }
        Ok(())
    }

    /// Evict every frame belonging to `volume_id` (spec §4.C), blocking
    /// until each frame's latch is free. Used on temporary-volume drop and
    /// post-crash recovery.
    pub fn invalidate(&self, volume_id: u32) {
        let mut index = self.index.lock();
        let mut free_list = self.free_list.lock();
        for (idx, frame) in self.frames.iter().enumerate() {
            if frame.volume_id.load(Ordering::SeqCst) != volume_id {
                continue;
            }
            let _guard = frame.data.write();
            index.remove(&frame.key());
            frame.volume_id.store(frame::EMPTY, Ordering::SeqCst);
            frame.clear_dirty();
            free_list.push(idx);
        }
    }
}
