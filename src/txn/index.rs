//! 4.G Transaction Index.
//!
//! Grounded on the donor's `transaction/concurrent_status.rs`
//! (`ConcurrentStatus`, `request_latch`, `update_wait_for_graph`, and its
//! `Database::mut_concurrent_status()` global-lock discipline) but
//! reshaped per spec: transactions are bucketed by `hash(ts) mod
//! nBuckets` with a per-bucket lock instead of one process-wide lock, and
//! `wwDependency` resolves a version's writer rather than a page latch —
//! this engine's page latches live in the buffer pool (§4.C), not here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::txn::status::{TransactionStatus, VersionHandle, ABORTED, UNCOMMITTED};
use crate::txn::timestamp::{Timestamp, TimestampAllocator};
use crate::txn::wait_for_graph::WaitForGraph;

const DEFAULT_BUCKET_COUNT: usize = 64;

struct Bucket {
    statuses: HashMap<Timestamp, Arc<TransactionStatus>>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            statuses: HashMap::new(),
        }
    }
}

/// Lock-free(ish) snapshot of the set of active transactions, refreshed
/// periodically by a background worker (or synchronously in tests). Reads
/// of `floor()` never block on a bucket lock.
pub struct ActiveTransactionCache {
    floor: AtomicU64,
    active: RwLock<Vec<Timestamp>>,
}

impl ActiveTransactionCache {
    fn new() -> Self {
        Self {
            floor: AtomicU64::new(0),
            active: RwLock::new(Vec::new()),
        }
    }

    /// Oldest `ts` of any still-active transaction, or `u64::MAX` if none.
    pub fn floor(&self) -> Timestamp {
        self.floor.load(Ordering::Acquire)
    }

    pub fn is_active(&self, ts: Timestamp) -> bool {
        self.active.read().unwrap().binary_search(&ts).is_ok()
    }

    fn publish(&self, mut active: Vec<Timestamp>) {
        active.sort_unstable();
        let floor = active.first().copied().unwrap_or(u64::MAX);
        self.floor.store(floor, Ordering::Release);
        *self.active.write().unwrap() = active;
    }
}

pub struct TransactionIndex {
    buckets: Vec<Mutex<Bucket>>,
    pub allocator: TimestampAllocator,
    pub cache: ActiveTransactionCache,
    wait_for_graph: Mutex<WaitForGraph>,
}

impl TransactionIndex {
    pub fn new(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.clamp(1, 4096);
        let mut buckets = Vec::with_capacity(bucket_count);
        for _ in 0..bucket_count {
            buckets.push(Mutex::new(Bucket::new()));
        }
        Self {
            buckets,
            allocator: TimestampAllocator::new(),
            cache: ActiveTransactionCache::new(),
            wait_for_graph: Mutex::new(WaitForGraph::new()),
        }
    }

    fn bucket_for(&self, ts: Timestamp) -> &Mutex<Bucket> {
        &self.buckets[(ts as usize) % self.buckets.len()]
    }

    /// Allocate a new start timestamp and register a status for it.
    pub fn register(&self) -> Arc<TransactionStatus> {
        let ts = self.allocator.update();
        let status = Arc::new(TransactionStatus::new(ts));
        self.bucket_for(ts)
            .lock()
            .unwrap()
            .statuses
            .insert(ts, Arc::clone(&status));
        status
    }

    pub fn status_of(&self, ts: Timestamp) -> Option<Arc<TransactionStatus>> {
        self.bucket_for(ts).lock().unwrap().statuses.get(&ts).cloned()
    }

    pub fn commit(&self, ts: Timestamp, tc: Timestamp) {
        if let Some(status) = self.status_of(ts) {
            status.commit(tc);
        }
        self.wait_for_graph.lock().unwrap().remove_transaction(ts);
    }

    pub fn abort(&self, ts: Timestamp) {
        if let Some(status) = self.status_of(ts) {
            status.abort();
        }
        self.wait_for_graph.lock().unwrap().remove_transaction(ts);
    }

    /// Free a status once its mvv-count has reached zero and no older
    /// active transaction remains that might still need to classify its
    /// versions (spec §4.G "Aborted retention").
    pub fn notify_completed(&self, ts: Timestamp) {
        let can_free = match self.status_of(ts) {
            Some(status) => status.mvv_count() == 0 && self.cache.floor() > ts,
            None => return,
        };
        if can_free {
            self.bucket_for(ts).lock().unwrap().statuses.remove(&ts);
        }
    }

    /// Rebuild the `ActiveTransactionCache` from every bucket. Called by
    /// the transaction-index-updater background worker, or synchronously
    /// by tests.
    pub fn refresh_active_cache(&self) {
        let mut active = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock().unwrap();
            for status in bucket.statuses.values() {
                if status.is_uncommitted() {
                    active.push(status.ts);
                }
            }
        }
        self.cache.publish(active);
    }

    /// Resolve a version's visibility for a reader, per spec §4.G.
    /// Returns the writer's `tc` (positive = committed-at), `UNCOMMITTED`,
    /// or `ABORTED`. Same-transaction versions are resolved by the caller
    /// (it knows the current step) before reaching here.
    pub fn commit_status(&self, vh: VersionHandle) -> i64 {
        match self.status_of(vh.ts()) {
            Some(status) => status.tc(),
            // No status at all: either pruned long ago (and therefore
            // necessarily committed before the snapshot floor) or never
            // registered. Treat as committed-at-its-own-ts, the oldest
            // possible visible interpretation.
            None => vh.ts() as i64,
        }
    }

    /// ww-dependency resolution (spec §4.G): `source` is about to write a
    /// key last written by the transaction named in `vh`. Blocks up to
    /// `timeout` if that writer is still active; detects deadlock first.
    pub fn ww_dependency(
        &self,
        vh: VersionHandle,
        source: &TransactionStatus,
        timeout: Duration,
    ) -> i64 {
        let target_ts = vh.ts();
        if target_ts == source.ts {
            return source.tc();
        }

        let target = match self.status_of(target_ts) {
            Some(t) => t,
            None => return vh.ts() as i64, // already pruned -> necessarily committed
        };

        if target.is_committed() {
            return target.tc();
        }
        if target.is_aborted() {
            return ABORTED;
        }

        // Still active: register the wait edge and check for deadlock
        // before blocking.
        {
            let mut graph = self.wait_for_graph.lock().unwrap();
            graph.add_edge(source.ts, target_ts);
            if graph.find_cycle_from(source.ts) {
                warn!("deadlock detected: txn {} waiting on txn {} would close a cycle", source.ts, target_ts);
                graph.remove_edge(source.ts, target_ts);
                return UNCOMMITTED;
            }
        }

        debug!("txn {} blocking on writer {} (timeout {:?})", source.ts, target_ts, timeout);

        let deadline = Instant::now() + timeout;
        let result = {
            let mut guard = target.wait_lock.lock().unwrap();
            loop {
                if !target.is_uncommitted() {
                    break target.tc();
                }
                let now = Instant::now();
                if now >= deadline {
                    break UNCOMMITTED;
                }
                let (g, timeout_result) =
                    target.wait_cv.wait_timeout(guard, deadline - now).unwrap();
                guard = g;
                if timeout_result.timed_out() && target.is_uncommitted() {
                    break UNCOMMITTED;
                }
            }
        };

        self.wait_for_graph
            .lock()
            .unwrap()
            .remove_edge(source.ts, target_ts);
        result
    }
}

impl Default for TransactionIndex {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_COUNT)
    }
}
