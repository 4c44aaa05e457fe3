//! Top-level engine wiring (spec §1, §5, §6): opens the configured
//! volumes and buffer pools, bootstraps each volume's directory,
//! recovers the journal, and exposes the store/fetch/traverse surface
//! plus transaction lifecycle, checkpointing, and background worker
//! management. Grounded on the donor's `database.rs`
//! (`Database::global()` wiring a single buffer pool and table
//! catalog as process-wide state) generalized to the spec's
//! multi-volume, multi-tree, journaled model.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::Sender;
use log::{debug, info, warn};

use crate::accumulator::{Accumulator, AccumulatorKind, AccumulatorState};
use crate::alert::{Alert, AlertMonitor, LoggingAlertMonitor};
use crate::buffer::BufferPool;
use crate::cleanup::{CleanupAction, CleanupHandlers, CleanupManager};
use crate::config::{CommitPolicy, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::journal::recovery::{self, RecoveryListener};
use crate::journal::{JournalManager, PendingUpdate};
use crate::tree::directory::Directory;
use crate::tree::{Direction, Tree};
use crate::txn::index::TransactionIndex;
use crate::txn::status::{Step, TransactionStatus};
use crate::txn::timestamp::Timestamp;
use crate::volume::{PageId, Volume};

const JOURNAL_FILE_NAME: &str = "journal";

struct VolumeEntry {
    id: u32,
    volume: Arc<Volume>,
    pool: Arc<BufferPool>,
    directory: Directory,
    trees: Mutex<HashMap<String, Arc<Tree>>>,
}

#[derive(Default)]
struct PendingTxn {
    updates: Vec<PendingUpdate>,
}

/// A handle to one in-flight transaction: the transaction index's
/// status object plus the step counter a caller bumps between
/// logically separate writes within the same transaction.
pub struct TxnHandle {
    pub status: Arc<TransactionStatus>,
    step: Mutex<Step>,
}

impl TxnHandle {
    pub fn ts(&self) -> Timestamp {
        self.status.ts
    }

    /// The step the *next* write should be authored at, then advances
    /// the counter for the write after that.
    pub fn next_step(&self) -> Step {
        let mut step = self.step.lock().unwrap();
        let current = *step;
        *step += 1;
        current
    }
}

pub struct Engine {
    config: EngineConfig,
    volumes: HashMap<String, VolumeEntry>,
    volume_by_id: HashMap<u32, String>,
    index: Arc<TransactionIndex>,
    journal: Arc<JournalManager>,
    cleanup: Arc<CleanupManager>,
    accumulators: Mutex<HashMap<u64, Arc<Accumulator>>>,
    alert: Arc<dyn AlertMonitor>,
    pending: Mutex<HashMap<Timestamp, PendingTxn>>,
    workers: Mutex<Vec<(std::thread::JoinHandle<()>, Sender<()>)>>,
}

impl CleanupHandlers for Engine {
    fn prune_mvv_page(&self, volume_id: u32, page_id: PageId, snapshot_floor: Timestamp) -> EngineResult<usize> {
        let name = self
            .volume_by_id
            .get(&volume_id)
            .ok_or_else(|| EngineError::VolumeNotFound(format!("volume handle {}", volume_id)))?;
        let entry = &self.volumes[name];
        // Any open tree on this volume can run the page-local prune;
        // the pruning logic only touches the page's own bytes.
        let trees = entry.trees.lock().unwrap();
        let tree = trees.values().next().ok_or_else(|| {
            EngineError::CorruptVolume(format!("volume '{}' has no open tree to prune through", name))
        })?;
        tree.prune_page(&self.index, page_id, snapshot_floor, self.index.allocator.update())
    }

    fn reclaim_tree(&self, volume_id: u32, tree_name: &str, root: PageId) -> EngineResult<usize> {
        let name = self
            .volume_by_id
            .get(&volume_id)
            .ok_or_else(|| EngineError::VolumeNotFound(format!("volume handle {}", volume_id)))?;
        let entry = &self.volumes[name];
        // `remove_tree` already dropped the directory entry by the time
        // this runs, so the root captured at removal time is the only
        // way left to find the tree's pages — reopening by name would
        // just see a gone entry.
        let tree = Tree::from_root(
            tree_name.to_string(),
            volume_id,
            volume_id,
            Arc::clone(&entry.volume),
            Arc::clone(&entry.pool),
            root,
        );
        let mut freed = 0;
        for page_id in tree.all_pages()? {
            entry.volume.deallocate_page(page_id)?;
            freed += 1;
        }
        entry.trees.lock().unwrap().remove(tree_name);
        Ok(freed)
    }
}

impl Engine {
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        Self::open_with_alert(config, Arc::new(LoggingAlertMonitor))
    }

    pub fn open_with_alert(config: EngineConfig, alert: Arc<dyn AlertMonitor>) -> EngineResult<Self> {
        config.validate()?;

        let mut pools_by_page_size: HashMap<u32, Arc<BufferPool>> = HashMap::new();
        for spec in &config.buffer_pools {
            pools_by_page_size
                .entry(spec.page_size)
                .or_insert_with(|| Arc::new(BufferPool::new(spec.page_size as usize, spec.frame_count)));
        }

        let index = Arc::new(TransactionIndex::default());
        let mut volumes = HashMap::new();
        let mut volume_by_id = HashMap::new();
        let mut next_volume_id = 1u32;

        for spec in &config.volumes {
            let volume = Arc::new(Volume::open(spec)?);
            let pool = pools_by_page_size.entry(spec.page_size).or_insert_with(|| {
                Arc::new(BufferPool::new(spec.page_size as usize, 256))
            });
            let volume_id = next_volume_id;
            next_volume_id += 1;
            pool.register_volume(volume_id, Arc::clone(&volume));
            let directory = Directory::bootstrap(Arc::clone(&volume), Arc::clone(pool), volume_id)?;
            volume_by_id.insert(volume_id, spec.name.clone());
            volumes.insert(
                spec.name.clone(),
                VolumeEntry { id: volume_id, volume, pool: Arc::clone(pool), directory, trees: Mutex::new(HashMap::new()) },
            );
        }

        let journal_dir = config.journal_path.clone();
        let at = index.allocator.update();
        let journal = {
            let mut listener_report = None;
            // A fresh `Engine` needs to know which engine's trees exist
            // before recovery can replay into them; `find_tree_by_name`
            // below opens trees on demand via each volume's directory,
            // so recovery can run immediately, ahead of constructing
            // `Self`, by replaying through a throwaway closure-based
            // listener instead of `EngineRecoveryListener` (which needs
            // `&Engine`). Build volumes/directories first, then recover
            // into them directly before the `Engine` value exists.
            let mut tree_cache: HashMap<(String, String), Arc<Tree>> = HashMap::new();
            let volume_exists = |name: &str| volumes.values().any(|e| e.directory.lookup(name).ok().flatten().is_some());

            struct BootListener<'a> {
                volumes: &'a HashMap<String, VolumeEntry>,
                cache: &'a mut HashMap<(String, String), Arc<Tree>>,
                index: &'a TransactionIndex,
            }
            impl<'a> BootListener<'a> {
                fn resolve(&mut self, tree_name: &str) -> EngineResult<Arc<Tree>> {
                    for (vname, entry) in self.volumes {
                        let key = (vname.clone(), tree_name.to_string());
                        if let Some(t) = self.cache.get(&key) {
                            return Ok(Arc::clone(t));
                        }
                        if let Some(tree) = entry.directory.open(tree_name, entry.id)? {
                            let tree = Arc::new(tree);
                            self.cache.insert(key, Arc::clone(&tree));
                            return Ok(tree);
                        }
                    }
                    Err(EngineError::TreeNotFound(tree_name.to_string()))
                }
            }
            impl<'a> RecoveryListener for BootListener<'a> {
                fn store(&mut self, tree_name: &str, key: &[u8], value: &[u8]) -> EngineResult<()> {
                    let tree = self.resolve(tree_name)?;
                    tree.raw_put(key, value, 0)
                }
                fn remove_key_range(&mut self, tree_name: &str, from: &[u8], to: &[u8]) -> EngineResult<()> {
                    let tree = self.resolve(tree_name)?;
                    let txn = self.index.register();
                    tree.remove_key_range(self.index, &txn, 0, from, to)?;
                    self.index.abort(txn.ts); // replay-only transaction, never really committed
                    Ok(())
                }
                fn remove_tree(&mut self, tree_name: &str) -> EngineResult<()> {
                    for entry in self.volumes.values() {
                        if entry.directory.lookup(tree_name)?.is_some() {
                            entry.directory.remove(tree_name, 0)?;
                        }
                    }
                    Ok(())
                }
                fn delta(&mut self, _accumulator_id: u64, _step: Step, _value: i64) -> EngineResult<()> {
                    // Accumulator deltas are reconstructed from each
                    // tree's own checkpointed `AccumulatorState` plus
                    // participant transactions the transaction index
                    // still holds; replayed transactions never re-enter
                    // the index, so there is nothing further to apply
                    // here beyond the store/remove side effects above.
                    Ok(())
                }
            }

            let mut boot_listener = BootListener { volumes: &volumes, cache: &mut tree_cache, index: &index };
            let report = recovery::recover(&journal_dir, JOURNAL_FILE_NAME, config.ignore_missing_volumes, volume_exists, &mut boot_listener)?;
            index.allocator.bump_floor(report.max_timestamp_seen);
            listener_report = Some(report);

            let report = listener_report.unwrap();
            if report.highest_file_num == 0 {
                JournalManager::create(&journal_dir, JOURNAL_FILE_NAME, config.journal_size, at)?
            } else {
                JournalManager::resume_after_recovery(
                    &journal_dir,
                    JOURNAL_FILE_NAME,
                    config.journal_size,
                    report.highest_file_num + 1,
                    HashMap::new(),
                    HashMap::new(),
                    at,
                )?
            }
        };

        let engine = Self {
            config,
            volumes,
            volume_by_id,
            index,
            journal: Arc::new(journal),
            cleanup: Arc::new(CleanupManager::new(1024)),
            accumulators: Mutex::new(HashMap::new()),
            alert,
            pending: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        };

        info!("engine opened with {} volume(s)", engine.volumes.len());
        Ok(engine)
    }

    fn volume_entry(&self, volume_name: &str) -> EngineResult<&VolumeEntry> {
        self.volumes.get(volume_name).ok_or_else(|| EngineError::VolumeNotFound(volume_name.to_string()))
    }

    fn find_tree_by_name(&self, tree_name: &str) -> EngineResult<(u32, Arc<Tree>)> {
        for entry in self.volumes.values() {
            if let Some(tree) = entry.trees.lock().unwrap().get(tree_name) {
                return Ok((entry.id, Arc::clone(tree)));
            }
            if let Some(tree) = entry.directory.open(tree_name, entry.id)? {
                let tree = Arc::new(tree);
                entry.trees.lock().unwrap().insert(tree_name.to_string(), Arc::clone(&tree));
                return Ok((entry.id, tree));
            }
        }
        self.alert.notify(Alert::MissingVolume { name: tree_name.to_string() });
        Err(EngineError::TreeNotFound(tree_name.to_string()))
    }

    /// `Volume::next_available_page` for `volume_name`. Diagnostic only,
    /// used to check that a volume's page count returns to baseline
    /// after a full insert/delete/reclaim cycle.
    pub fn volume_next_available_page(&self, volume_name: &str) -> EngineResult<u64> {
        Ok(self.volume_entry(volume_name)?.volume.next_available_page())
    }

    pub fn create_tree(&self, volume_name: &str, tree_name: &str) -> EngineResult<()> {
        let entry = self.volume_entry(volume_name)?;
        let at = self.index.allocator.update();
        let tree = entry.directory.create(tree_name, entry.id, at)?;
        entry.trees.lock().unwrap().insert(tree_name.to_string(), Arc::new(tree));
        Ok(())
    }

    pub fn remove_tree(&self, volume_name: &str, tree_name: &str) -> EngineResult<()> {
        let entry = self.volume_entry(volume_name)?;
        let at = self.index.allocator.update();
        entry.directory.remove(tree_name, at)?;
        let root = entry.trees.lock().unwrap().get(tree_name).map(|t| t.root()).unwrap_or(0);
        entry.trees.lock().unwrap().remove(tree_name);
        self.cleanup.offer(CleanupAction::ReclaimTree { volume_id: entry.id, tree_name: tree_name.to_string(), root });
        Ok(())
    }

    /// Register (or fetch the already-registered) accumulator for
    /// `(tree_name, index)`, reconstructing it from its last
    /// checkpointed state if this is the first reference since open.
    pub fn accumulator(&self, volume_name: &str, tree_name: &str, kind: AccumulatorKind, index: u32) -> EngineResult<Arc<Accumulator>> {
        let entry = self.volume_entry(volume_name)?;
        let (tree_id, _tree) = self.find_tree_by_name(tree_name)?;
        let acc_id = ((tree_id as u64) << 32) | index as u64;

        if let Some(acc) = self.accumulators.lock().unwrap().get(&acc_id) {
            return Ok(Arc::clone(acc));
        }

        let states = entry.directory.load_accumulator_states(tree_name)?;
        let base = states.into_iter().find(|s| s.index == index).map(|s| s.base).unwrap_or(0);
        let acc = Arc::new(Accumulator::new(tree_id, kind, index, tree_name.to_string(), base));
        self.accumulators.lock().unwrap().insert(acc_id, Arc::clone(&acc));
        Ok(acc)
    }

    /// Combine `delta` into an accumulator under `txn`. The delta is
    /// recorded on the transaction's own status (spec §4.I) and folded
    /// into the journal's `TX` record at commit time by
    /// `collect_accumulator_deltas`; there is nothing to enqueue here.
    pub fn accumulator_update(
        &self,
        txn: &TxnHandle,
        volume_name: &str,
        tree_name: &str,
        kind: AccumulatorKind,
        index: u32,
        delta: i64,
    ) -> EngineResult<i64> {
        let acc = self.accumulator(volume_name, tree_name, kind, index)?;
        let step = txn.next_step();
        Ok(acc.update(delta, &txn.status, step))
    }

    /// MVCC-correct read of an accumulator as of `(reader_ts, 0)` (spec
    /// §4.I) — the accumulator counterpart to `fetch`.
    pub fn accumulator_snapshot(
        &self,
        reader_ts: Timestamp,
        volume_name: &str,
        tree_name: &str,
        kind: AccumulatorKind,
        index: u32,
    ) -> EngineResult<i64> {
        let acc = self.accumulator(volume_name, tree_name, kind, index)?;
        Ok(acc.snapshot_value(&self.index, reader_ts, 0))
    }

    pub fn begin_transaction(&self) -> TxnHandle {
        let status = self.index.register();
        self.journal.begin_transaction(status.ts);
        TxnHandle { status, step: Mutex::new(0) }
    }

    pub fn store(&self, txn: &TxnHandle, tree_name: &str, key: &[u8], value: &[u8]) -> EngineResult<()> {
        let (_, tree) = self.find_tree_by_name(tree_name)?;
        let step = txn.next_step();
        tree.store(&self.index, &txn.status, step, key, value)?;
        self.pending.lock().unwrap().entry(txn.ts()).or_default().updates.push(PendingUpdate::Store {
            tree: tree_name.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    pub fn fetch(&self, reader_ts: Timestamp, reader_step: Step, tree_name: &str, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let (_, tree) = self.find_tree_by_name(tree_name)?;
        tree.fetch(&self.index, reader_ts, reader_step, key)
    }

    pub fn remove_key_range(&self, txn: &TxnHandle, tree_name: &str, from: &[u8], to: &[u8]) -> EngineResult<usize> {
        let (_, tree) = self.find_tree_by_name(tree_name)?;
        let step = txn.next_step();
        let removed = tree.remove_key_range(&self.index, &txn.status, step, from, to)?;
        self.pending.lock().unwrap().entry(txn.ts()).or_default().updates.push(PendingUpdate::DeleteRange {
            tree: tree_name.to_string(),
            from: from.to_vec(),
            to: to.to_vec(),
        });
        Ok(removed)
    }

    /// Sweep every leaf of `tree_name` for MVV versions obsolete before
    /// `snapshot_floor`, dropping fully-pruned key blocks and joining
    /// pages that empty out (spec §4.D/§4.H). Ordinarily driven by
    /// `CleanupAction::PruneMvvPage`; exposed directly for callers that
    /// want pruning applied immediately rather than queued.
    /// Run `Page::verify` over every leaf of `tree_name` (spec §8
    /// invariant 1). Diagnostic only.
    pub fn verify_tree(&self, tree_name: &str) -> EngineResult<()> {
        let (_, tree) = self.find_tree_by_name(tree_name)?;
        tree.verify_leaves()
    }

    pub fn prune_tree(&self, tree_name: &str, snapshot_floor: Timestamp) -> EngineResult<usize> {
        let (_, tree) = self.find_tree_by_name(tree_name)?;
        let at = self.index.allocator.update();
        let mut total = 0;
        for page_id in tree.leaf_pages()? {
            total += tree.prune_page(&self.index, page_id, snapshot_floor, at)?;
        }
        Ok(total)
    }

    pub fn traverse(
        &self,
        reader_ts: Timestamp,
        reader_step: Step,
        tree_name: &str,
        key: &[u8],
        direction: Direction,
        inclusive: bool,
    ) -> EngineResult<Option<(Vec<u8>, Vec<u8>)>> {
        let (_, tree) = self.find_tree_by_name(tree_name)?;
        tree.traverse(&self.index, reader_ts, reader_step, key, direction, inclusive)
    }

    /// Commit `txn`: allocate a commit timestamp, make every version it
    /// authored visible by setting its status, and write a `TX` journal
    /// record covering every update it made since `begin_transaction`.
    /// `CommitPolicy::Hard` fsyncs before returning; `Group`/`Soft`
    /// return once the record is appended, relying on a later flush.
    pub fn commit(&self, txn: TxnHandle) -> EngineResult<()> {
        let updates = self.pending.lock().unwrap().remove(&txn.ts()).map(|p| p.updates).unwrap_or_default();
        let commit_ts = self.index.allocator.update();

        let mut journal_updates: Vec<PendingUpdate> = updates;
        for (accumulator_id, step, value) in self.collect_accumulator_deltas(&txn) {
            journal_updates.push(PendingUpdate::Delta { accumulator_id, step, value });
        }

        if !journal_updates.is_empty() {
            self.journal.write_transaction(txn.ts(), commit_ts, journal_updates)?;
        }
        self.index.commit(txn.ts(), commit_ts);

        let sync = matches!(self.config.commit_policy, CommitPolicy::Hard);
        if sync {
            self.journal.force(true)?;
        }
        self.index.notify_completed(txn.ts());
        Ok(())
    }

    pub fn abort(&self, txn: TxnHandle) {
        self.pending.lock().unwrap().remove(&txn.ts());
        self.journal.abort_transaction(txn.ts());
        self.index.abort(txn.ts());
        self.index.notify_completed(txn.ts());
    }

    fn collect_accumulator_deltas(&self, txn: &TxnHandle) -> Vec<(u64, Step, i64)> {
        let accumulators = self.accumulators.lock().unwrap();
        let mut out = Vec::new();
        for acc in accumulators.values() {
            for (step, value) in txn.status.deltas_for(acc.id) {
                out.push((acc.id, step, value));
            }
        }
        out
    }

    /// Run a checkpoint (spec §4.B/§4.J): refresh the active-transaction
    /// cache, fold every accumulator's completed participants into its
    /// base (persisting the result), and write a `CP` journal record
    /// whose `base_address` is the oldest journal address the page map
    /// still needs.
    pub fn checkpoint(&self) -> EngineResult<()> {
        self.index.refresh_active_cache();
        let at = self.index.allocator.allocate_checkpoint();
        let current = self.index.allocator.current();

        for entry in self.volumes.values() {
            // select_dirty_buffers is priority-capped at max_n; loop until
            // a pass comes back with nothing left to flush so every page
            // dirtied at or before `at` is durable before the CP record
            // below claims it as the recovery floor.
            let max_n = entry.pool.frame_count();
            loop {
                let dirty = entry.pool.select_dirty_buffers(current, at, max_n);
                if dirty.is_empty() {
                    break;
                }
                for (volume_id, page_id) in &dirty {
                    entry.pool.flush_page(*volume_id, *page_id)?;
                }
            }
        }

        for entry in self.volumes.values() {
            let accumulators = self.accumulators.lock().unwrap();
            for acc in accumulators.values() {
                if acc.tree_name.is_empty() {
                    continue;
                }
                if entry.trees.lock().unwrap().contains_key(&acc.tree_name) {
                    let base = acc.checkpoint(at);
                    let state = AccumulatorState { kind: acc.kind, index: acc.index, base, tree_name: acc.tree_name.clone() };
                    entry.directory.save_accumulator_state(&state, at)?;
                }
            }
        }

        self.journal.checkpoint(at, at)?;
        self.journal.force(true)?;
        Ok(())
    }

    /// Copy dirty journaled page images back into their home volumes
    /// and reclaim journal files no longer referenced. Spec §4.J; a
    /// no-op while `config.appendonly` is set.
    pub fn copy_back(&self, max_n: usize) -> EngineResult<usize> {
        if self.config.appendonly {
            return Ok(0);
        }
        let before = self.index.allocator.current();
        let volume_by_id = &self.volume_by_id;
        let volumes = &self.volumes;
        self.journal.copy_back(before, max_n, |volume_handle| {
            volume_by_id.get(&volume_handle).and_then(|name| volumes.get(name)).map(|e| Arc::clone(&e.volume))
        })
    }

    pub fn cleanup(&self) -> &CleanupManager {
        &self.cleanup
    }

    /// Run every background pass synchronously once — the
    /// `pollInterval = -1` testing mode spec §5 describes, driven by
    /// the caller instead of a timer thread.
    pub fn run_maintenance_once(&self) -> EngineResult<()> {
        self.checkpoint()?;
        self.copy_back(64)?;
        self.cleanup.run_all_pending(self);
        Ok(())
    }

    /// Start the background workers named in spec §5 (checkpoint
    /// writer, journal copier, cleanup manager) if `poll_interval_ms`
    /// is set; a `None` interval leaves everything to be driven
    /// manually via `run_maintenance_once`, matching `pollInterval = -1`.
    ///
    /// Each worker holds its own `Arc<Engine>` clone, so once this runs
    /// the engine will not drop on its own; call `close()` explicitly
    /// before the last external handle goes away.
    pub fn start_background_workers(self: &Arc<Self>) {
        let Some(interval_ms) = self.config.poll_interval_ms else {
            debug!("poll_interval_ms disabled; background workers not started");
            return;
        };
        let interval = Duration::from_millis(interval_ms);

        let (cleanup_handle, cleanup_stop) = Arc::clone(&self.cleanup).spawn_worker(Arc::clone(self) as Arc<dyn CleanupHandlers>, interval);
        self.workers.lock().unwrap().push((cleanup_handle, cleanup_stop));

        let engine = Arc::clone(self);
        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(0);
        let handle = std::thread::spawn(move || loop {
            crossbeam::channel::select! {
                recv(stop_rx) -> _ => break,
                default(interval) => {
                    if let Err(e) = engine.checkpoint() {
                        warn!("background checkpoint failed: {}", e);
                    }
                    if let Err(e) = engine.copy_back(256) {
                        warn!("background copy-back failed: {}", e);
                    }
                }
            }
        });
        self.workers.lock().unwrap().push((handle, stop_tx));
    }

    /// Stop every background worker and settle any cleanup actions that
    /// were still queued, then flush the journal. Spec §4.L: "on
    /// shutdown the queue is discarded" — actions not yet drained by
    /// the time `run_all_pending` is called here are simply dropped
    /// along with the channel.
    pub fn close(&self) -> EngineResult<()> {
        for (handle, stop) in self.workers.lock().unwrap().drain(..) {
            let _ = stop.send(());
            let _ = handle.join();
        }
        self.journal.force(true)?;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing engine: {}", e);
        }
    }
}
