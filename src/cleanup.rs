//! 4.L Cleanup Manager: a bounded, priority-ordered work queue of small
//! maintenance actions (prune obsolete MVV versions at a page, reclaim a
//! removed tree's pages) drained by a background worker. Grounded in
//! shape on the donor's worker/queue-free design generalized the way
//! `small-db-small-db`'s own test harness drives concurrent work through
//! `crossbeam::channel` (see `tests/integretions/concurrent_test.rs`):
//! a bounded channel stands in for the queue, `try_send` realizes the
//! "over-capacity offers are refused and counted" requirement, and
//! `select!` realizes the worker's poll loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, select, Receiver, Sender};
use log::{debug, warn};

use crate::error::EngineResult;
use crate::txn::timestamp::Timestamp;
use crate::volume::PageId;

/// A higher `priority` value is drained first; ties drain FIFO. Pruning
/// a single page is cheap and frequent; reclaiming a whole removed
/// tree's pages is rarer and more valuable, so it outranks routine
/// pruning when both are waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    PruneMvvPage {
        volume_id: u32,
        page_id: PageId,
        snapshot_floor: Timestamp,
    },
    ReclaimTree {
        volume_id: u32,
        tree_name: String,
        root: PageId,
    },
}

impl CleanupAction {
    fn priority(&self) -> u8 {
        match self {
            CleanupAction::ReclaimTree { .. } => 1,
            CleanupAction::PruneMvvPage { .. } => 0,
        }
    }
}

/// Collaborator the worker calls back into to actually carry out an
/// action. Implemented by the top-level engine, which alone holds the
/// registry of open volumes/trees this module has no business owning.
pub trait CleanupHandlers: Send + Sync {
    /// Prune one leaf page's MVV cells; returns the number of versions
    /// removed.
    fn prune_mvv_page(&self, volume_id: u32, page_id: PageId, snapshot_floor: Timestamp) -> EngineResult<usize>;

    /// Physically reclaim a removed tree's pages; returns the number of
    /// pages freed.
    fn reclaim_tree(&self, volume_id: u32, tree_name: &str, root: PageId) -> EngineResult<usize>;
}

#[derive(Debug, Default)]
pub struct CleanupStats {
    pub actions_completed: AtomicU64,
    pub actions_failed: AtomicU64,
    pub actions_refused: AtomicU64,
    pub versions_pruned: AtomicU64,
    pub pages_reclaimed: AtomicU64,
}

impl CleanupStats {
    pub fn snapshot(&self) -> CleanupStatsSnapshot {
        CleanupStatsSnapshot {
            actions_completed: self.actions_completed.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            actions_refused: self.actions_refused.load(Ordering::Relaxed),
            versions_pruned: self.versions_pruned.load(Ordering::Relaxed),
            pages_reclaimed: self.pages_reclaimed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStatsSnapshot {
    pub actions_completed: u64,
    pub actions_failed: u64,
    pub actions_refused: u64,
    pub versions_pruned: u64,
    pub pages_reclaimed: u64,
}

/// Two channels rather than one priority-ordered structure: `select!`
/// always polls `high` before `low` when both are ready, which gives
/// `ReclaimTree` strict priority over `PruneMvvPage` without needing a
/// binary heap or its locking.
pub struct CleanupManager {
    high: (Sender<CleanupAction>, Receiver<CleanupAction>),
    low: (Sender<CleanupAction>, Receiver<CleanupAction>),
    stats: CleanupStats,
}

impl CleanupManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            high: bounded(capacity),
            low: bounded(capacity),
            stats: CleanupStats::default(),
        }
    }

    pub fn stats(&self) -> &CleanupStats {
        &self.stats
    }

    /// Enqueue `action`. Returns `false`, counting the refusal, if the
    /// relevant queue is already at capacity — the caller (a split, a
    /// commit, a periodic sweep) must not block on cleanup ever catching
    /// up.
    pub fn offer(&self, action: CleanupAction) -> bool {
        let sender = if action.priority() > 0 { &self.high.0 } else { &self.low.0 };
        match sender.try_send(action) {
            Ok(()) => true,
            Err(_) => {
                self.stats.actions_refused.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn run_action(&self, action: CleanupAction, handlers: &dyn CleanupHandlers) {
        let result = match &action {
            CleanupAction::PruneMvvPage { volume_id, page_id, snapshot_floor } => {
                handlers.prune_mvv_page(*volume_id, *page_id, *snapshot_floor).map(|n| {
                    self.stats.versions_pruned.fetch_add(n as u64, Ordering::Relaxed);
                })
            }
            CleanupAction::ReclaimTree { volume_id, tree_name, root } => {
                handlers.reclaim_tree(*volume_id, tree_name, *root).map(|n| {
                    self.stats.pages_reclaimed.fetch_add(n as u64, Ordering::Relaxed);
                })
            }
        };

        match result {
            Ok(()) => {
                self.stats.actions_completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.actions_failed.fetch_add(1, Ordering::Relaxed);
                warn!("cleanup action {:?} failed: {}", action, e);
            }
        }
    }

    /// Drain and run one action, preferring `high` over `low`. Returns
    /// `false` if both queues were empty.
    pub fn run_one(&self, handlers: &dyn CleanupHandlers) -> bool {
        if let Ok(action) = self.high.1.try_recv() {
            self.run_action(action, handlers);
            return true;
        }
        if let Ok(action) = self.low.1.try_recv() {
            self.run_action(action, handlers);
            return true;
        }
        false
    }

    /// Drain every currently queued action. Used by tests and by
    /// `Engine::close` to settle the queue synchronously instead of
    /// racing the background worker during shutdown.
    pub fn run_all_pending(&self, handlers: &dyn CleanupHandlers) -> u64 {
        let mut n = 0;
        while self.run_one(handlers) {
            n += 1;
        }
        n
    }

    /// Spawn the background worker. `poll_interval` of zero disables
    /// the idle wait and busy-polls instead — only sensible in tests
    /// that want a short-lived worker; production configs always pass a
    /// positive interval (spec §5's `pollInterval = -1` disables the
    /// worker entirely, which callers realize by simply not calling this
    /// and driving `run_all_pending` themselves instead).
    pub fn spawn_worker(self: Arc<Self>, handlers: Arc<dyn CleanupHandlers>, poll_interval: Duration) -> (thread::JoinHandle<()>, Sender<()>) {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let high_rx = self.high.1.clone();
        let low_rx = self.low.1.clone();
        let manager = Arc::clone(&self);

        let handle = thread::spawn(move || {
            debug!("cleanup manager worker starting");
            loop {
                select! {
                    recv(high_rx) -> msg => {
                        if let Ok(action) = msg {
                            manager.run_action(action, handlers.as_ref());
                        }
                    }
                    recv(low_rx) -> msg => {
                        if let Ok(action) = msg {
                            manager.run_action(action, handlers.as_ref());
                        }
                    }
                    recv(stop_rx) -> _ => break,
                    default(poll_interval) => {}
                }
            }
            debug!("cleanup manager worker stopped");
        });

        (handle, stop_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandlers {
        pruned: Mutex<Vec<(u32, PageId)>>,
        reclaimed: Mutex<Vec<String>>,
        fail_next_prune: std::sync::atomic::AtomicBool,
    }

    impl CleanupHandlers for RecordingHandlers {
        fn prune_mvv_page(&self, volume_id: u32, page_id: PageId, _snapshot_floor: Timestamp) -> EngineResult<usize> {
            if self.fail_next_prune.swap(false, Ordering::SeqCst) {
                return Err(crate::error::EngineError::Retry);
            }
            self.pruned.lock().unwrap().push((volume_id, page_id));
            Ok(3)
        }

        fn reclaim_tree(&self, _volume_id: u32, tree_name: &str, _root: PageId) -> EngineResult<usize> {
            self.reclaimed.lock().unwrap().push(tree_name.to_string());
            Ok(5)
        }
    }

    #[test]
    fn offer_refuses_once_a_queue_is_full() {
        let manager = CleanupManager::new(1);
        assert!(manager.offer(CleanupAction::PruneMvvPage { volume_id: 1, page_id: 1, snapshot_floor: 0 }));
        assert!(!manager.offer(CleanupAction::PruneMvvPage { volume_id: 1, page_id: 2, snapshot_floor: 0 }));
        assert_eq!(manager.stats().snapshot().actions_refused, 1);
    }

    #[test]
    fn reclaim_tree_drains_before_a_pending_prune() {
        let manager = CleanupManager::new(8);
        let handlers = RecordingHandlers::default();
        manager.offer(CleanupAction::PruneMvvPage { volume_id: 1, page_id: 1, snapshot_floor: 0 });
        manager.offer(CleanupAction::ReclaimTree { volume_id: 1, tree_name: "orders".to_string(), root: 9 });

        assert!(manager.run_one(&handlers));
        assert_eq!(handlers.reclaimed.lock().unwrap().as_slice(), ["orders"]);
        assert!(handlers.pruned.lock().unwrap().is_empty());

        assert!(manager.run_one(&handlers));
        assert_eq!(handlers.pruned.lock().unwrap().as_slice(), [(1, 1)]);
    }

    #[test]
    fn a_failed_action_is_counted_but_does_not_stop_the_drain() {
        let manager = CleanupManager::new(8);
        let handlers = RecordingHandlers::default();
        handlers.fail_next_prune.store(true, Ordering::SeqCst);

        manager.offer(CleanupAction::PruneMvvPage { volume_id: 1, page_id: 1, snapshot_floor: 0 });
        manager.offer(CleanupAction::PruneMvvPage { volume_id: 1, page_id: 2, snapshot_floor: 0 });

        let ran = manager.run_all_pending(&handlers);
        assert_eq!(ran, 2);
        assert_eq!(manager.stats().snapshot().actions_failed, 1);
        assert_eq!(handlers.pruned.lock().unwrap().as_slice(), [(1, 2)]);
    }

    #[test]
    fn spawn_worker_drains_offers_made_after_it_starts() {
        let manager = Arc::new(CleanupManager::new(8));
        let handlers: Arc<dyn CleanupHandlers> = Arc::new(RecordingHandlers::default());
        let (join, stop) = Arc::clone(&manager).spawn_worker(Arc::clone(&handlers), Duration::from_millis(5));

        manager.offer(CleanupAction::ReclaimTree { volume_id: 1, tree_name: "gone".to_string(), root: 1 });
        thread::sleep(Duration::from_millis(100));

        stop.send(()).unwrap();
        join.join().unwrap();

        assert_eq!(manager.stats().snapshot().actions_completed, 1);
    }
}
