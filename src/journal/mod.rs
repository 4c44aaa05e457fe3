//! 4.J Journal Manager: a single append-only, rolling-file write-ahead
//! log of page images and transaction records.
//!
//! There is no donor WAL to generalize from (small-db-small-db has no
//! journal — its `log.rs` is `env_logger` setup, not a write-ahead log),
//! so the rolling-file, tagged-entry shape here follows
//! `prataprc-rdms`'s `wral::journal::Journal`/`InnerJournal` design in
//! spirit: numbered files, a header written at the start of each, and a
//! clean boundary record at the end of a retired file. The wire format
//! itself is this crate's own `codec.rs`, not `prataprc-rdms`'s
//! `cbordata` encoding.

pub mod page_map;
pub mod record;
pub mod recovery;

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::codec::ByteReader;
use crate::error::{EngineError, EngineResult};
use crate::txn::status::Step;
use crate::txn::timestamp::Timestamp;
use crate::volume::{PageId, Volume};

use page_map::PageMap;
use record::{
    address_file_num, address_offset, journal_address, CheckpointRecord, HandleRecord,
    JournalAddress, LiveTransactionsRecord, PageImageRecord, Record, TransactionRecord, Update,
};

/// An update destined for a `TX` record, addressed by tree name rather
/// than the compact journal handle — `JournalManager` resolves and
/// assigns the handle the first time a name is seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingUpdate {
    Store { tree: String, key: Vec<u8>, value: Vec<u8> },
    DeleteRange { tree: String, from: Vec<u8>, to: Vec<u8> },
    RemoveTree { tree: String },
    Delta { accumulator_id: u64, step: Step, value: i64 },
}

struct WriterState {
    file_num: u64,
    file: File,
    offset: u64,
    volume_handles: HashMap<String, u32>,
    next_volume_handle: u32,
    tree_handles: HashMap<String, u32>,
    next_tree_handle: u32,
    live_transactions: BTreeSet<Timestamp>,
}

pub struct JournalManager {
    dir: PathBuf,
    name: String,
    block_size: u64,
    page_map: PageMap,
    state: Mutex<WriterState>,
}

impl JournalManager {
    fn file_path(dir: &Path, name: &str, file_num: u64) -> PathBuf {
        dir.join(format!("{}.{:06}", name, file_num))
    }

    fn open_fresh_file(
        dir: &Path,
        name: &str,
        file_num: u64,
        volume_handles: HashMap<String, u32>,
        tree_handles: HashMap<String, u32>,
        live_transactions: BTreeSet<Timestamp>,
        at: Timestamp,
    ) -> EngineResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| EngineError::io("journal mkdir", e))?;
        let path = Self::file_path(dir, name, file_num);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| EngineError::io("journal create", e))?;

        let next_volume_handle = volume_handles.values().copied().max().map_or(1, |m| m + 1);
        let next_tree_handle = tree_handles.values().copied().max().map_or(1, |m| m + 1);

        let state = WriterState {
            file_num,
            file,
            offset: 0,
            volume_handles,
            next_volume_handle,
            tree_handles,
            next_tree_handle,
            live_transactions,
        };

        let manager = JournalManager {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            block_size: 0, // patched by callers below
            page_map: PageMap::new(),
            state: Mutex::new(state),
        };

        let mut guard = manager.state.lock().unwrap();
        manager.write_file_header(&mut guard, at)?;
        drop(guard);
        Ok(manager)
    }

    /// Start a brand-new journal in `dir`: file `1`, a `JH` sentinel,
    /// and nothing else — there is no prior handle table or in-flight
    /// transaction to carry forward.
    pub fn create(dir: impl AsRef<Path>, name: &str, block_size: u64, at: Timestamp) -> EngineResult<Self> {
        let mut manager = Self::open_fresh_file(
            dir.as_ref(),
            name,
            1,
            HashMap::new(),
            HashMap::new(),
            BTreeSet::new(),
            at,
        )?;
        manager.block_size = block_size;
        Ok(manager)
    }

    /// Resume writing after recovery: start a fresh file numbered one
    /// past the highest file recovery saw, carrying forward the
    /// existing volume/tree handle tables so in-flight transactions
    /// replayed from the old journal still resolve to the same handles.
    pub fn resume_after_recovery(
        dir: impl AsRef<Path>,
        name: &str,
        block_size: u64,
        next_file_num: u64,
        volume_handles: HashMap<String, u32>,
        tree_handles: HashMap<String, u32>,
        at: Timestamp,
    ) -> EngineResult<Self> {
        let mut manager = Self::open_fresh_file(
            dir.as_ref(),
            name,
            next_file_num,
            volume_handles,
            tree_handles,
            BTreeSet::new(),
            at,
        )?;
        manager.block_size = block_size;
        Ok(manager)
    }

    /// Write `JH`, then every known volume/tree handle, then an empty
    /// live-transaction record — the fixed prologue every journal file
    /// opens with, so a reader scanning forward from file 1 can resolve
    /// every handle a later record in the stream might use.
    fn write_file_header(&self, state: &mut WriterState, at: Timestamp) -> EngineResult<()> {
        let jh = Record::JournalHeader.encode_full(at);
        self.write_raw(state, &jh)?;

        let volume_handles: Vec<(String, u32)> =
            state.volume_handles.iter().map(|(k, v)| (k.clone(), *v)).collect();
        for (name, handle) in volume_handles {
            let bytes = Record::VolumeHandle(HandleRecord { handle, name }).encode_full(at);
            self.write_raw(state, &bytes)?;
        }

        let tree_handles: Vec<(String, u32)> =
            state.tree_handles.iter().map(|(k, v)| (k.clone(), *v)).collect();
        for (name, handle) in tree_handles {
            let bytes = Record::TreeHandle(HandleRecord { handle, name }).encode_full(at);
            self.write_raw(state, &bytes)?;
        }

        let live: Vec<Timestamp> = state.live_transactions.iter().copied().collect();
        let bytes = Record::LiveTransactions(LiveTransactionsRecord { active_txns: live }).encode_full(at);
        self.write_raw(state, &bytes)?;
        Ok(())
    }

    /// Append `bytes` to the current file. On a write failure the file
    /// is truncated back to `state.offset` so a subsequent append does
    /// not leave a half-written record ahead of a later one.
    fn write_raw(&self, state: &mut WriterState, bytes: &[u8]) -> EngineResult<JournalAddress> {
        let address = journal_address(state.file_num, state.offset);
        if let Err(e) = state.file.write_all(bytes) {
            let _ = state.file.set_len(state.offset);
            return Err(EngineError::io("journal append", e));
        }
        state.offset += bytes.len() as u64;
        Ok(address)
    }

    fn resolve_volume_handle(&self, state: &mut WriterState, volume_name: &str, at: Timestamp) -> EngineResult<u32> {
        if let Some(&handle) = state.volume_handles.get(volume_name) {
            return Ok(handle);
        }
        let handle = state.next_volume_handle;
        state.next_volume_handle += 1;
        state.volume_handles.insert(volume_name.to_string(), handle);
        let bytes = Record::VolumeHandle(HandleRecord { handle, name: volume_name.to_string() }).encode_full(at);
        self.write_raw(state, &bytes)?;
        Ok(handle)
    }

    fn resolve_tree_handle(&self, state: &mut WriterState, tree_name: &str, at: Timestamp) -> EngineResult<u32> {
        if let Some(&handle) = state.tree_handles.get(tree_name) {
            return Ok(handle);
        }
        let handle = state.next_tree_handle;
        state.next_tree_handle += 1;
        state.tree_handles.insert(tree_name.to_string(), handle);
        let bytes = Record::TreeHandle(HandleRecord { handle, name: tree_name.to_string() }).encode_full(at);
        self.write_raw(state, &bytes)?;
        Ok(handle)
    }

    fn maybe_rollover(&self, state: &mut WriterState, at: Timestamp) -> EngineResult<()> {
        if state.offset >= self.block_size {
            self.rollover(state, at)?;
        }
        Ok(())
    }

    /// Close out the current file with a `JE` sentinel and open file
    /// `n+1`, never leaving an in-flight `TX` record split across the
    /// boundary — rollover only ever runs between top-level appends.
    fn rollover(&self, state: &mut WriterState, at: Timestamp) -> EngineResult<()> {
        debug!("journal {}: rolling over from file {} at offset {}", self.name, state.file_num, state.offset);
        let je = Record::JournalEnd.encode_full(at);
        self.write_raw(state, &je)?;
        state.file.sync_data().map_err(|e| EngineError::io("journal rollover sync", e))?;

        state.file_num += 1;
        let path = Self::file_path(&self.dir, &self.name, state.file_num);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| EngineError::io("journal rollover create", e))?;
        state.file = file;
        state.offset = 0;

        self.write_file_header(state, at)
    }

    pub fn begin_transaction(&self, start_ts: Timestamp) {
        self.state.lock().unwrap().live_transactions.insert(start_ts);
    }

    /// Drop a transaction from the live set without journaling anything
    /// — aborted transactions leave no `TX` record (spec §4.J covers
    /// only committed transactions).
    pub fn abort_transaction(&self, start_ts: Timestamp) {
        self.state.lock().unwrap().live_transactions.remove(&start_ts);
    }

    /// Journal one dirty page image, registering it in the in-memory
    /// page map so a buffer-pool miss (or recovery) can find it.
    pub fn write_page_image(&self, volume_name: &str, page_id: PageId, image: &[u8], at: Timestamp) -> EngineResult<JournalAddress> {
        let mut state = self.state.lock().unwrap();
        let volume_handle = self.resolve_volume_handle(&mut state, volume_name, at)?;
        let record = Record::PageImage(PageImageRecord {
            volume_handle,
            page_id,
            image: image.to_vec(),
        });
        let bytes = record.encode_full(at);
        let address = self.write_raw(&mut state, &bytes)?;
        self.maybe_rollover(&mut state, at)?;
        drop(state);
        self.page_map.record(volume_handle, page_id, address, at);
        Ok(address)
    }

    /// Journal a committed transaction's updates as one `TX` record.
    pub fn write_transaction(&self, start_ts: Timestamp, commit_ts: Timestamp, updates: Vec<PendingUpdate>) -> EngineResult<JournalAddress> {
        let mut state = self.state.lock().unwrap();
        let mut resolved = Vec::with_capacity(updates.len());
        for update in updates {
            let resolved_update = match update {
                PendingUpdate::Store { tree, key, value } => Update::Store {
                    tree_handle: self.resolve_tree_handle(&mut state, &tree, commit_ts)?,
                    key,
                    value,
                },
                PendingUpdate::DeleteRange { tree, from, to } => Update::DeleteRange {
                    tree_handle: self.resolve_tree_handle(&mut state, &tree, commit_ts)?,
                    from,
                    to,
                },
                PendingUpdate::RemoveTree { tree } => Update::RemoveTree {
                    tree_handle: self.resolve_tree_handle(&mut state, &tree, commit_ts)?,
                },
                PendingUpdate::Delta { accumulator_id, step, value } => {
                    Update::Delta { accumulator_id, step, value }
                }
            };
            resolved.push(resolved_update);
        }

        let record = Record::Transaction(TransactionRecord { start_ts, commit_ts, updates: resolved });
        let bytes = record.encode_full(commit_ts);
        let address = self.write_raw(&mut state, &bytes)?;
        state.live_transactions.remove(&start_ts);
        self.maybe_rollover(&mut state, commit_ts)?;
        Ok(address)
    }

    /// Write a `CP` record: the recoverable prefix (`base_address`) is
    /// the oldest journal address any tracked page still depends on.
    pub fn checkpoint(&self, at: Timestamp, wall_time: u64) -> EngineResult<JournalAddress> {
        let mut state = self.state.lock().unwrap();
        let base_address = self
            .page_map
            .oldest_address()
            .unwrap_or_else(|| journal_address(state.file_num, state.offset));
        let active_txns: Vec<Timestamp> = state.live_transactions.iter().copied().collect();
        let record = Record::Checkpoint(CheckpointRecord { wall_time, base_address, active_txns });
        let bytes = record.encode_full(at);
        let address = self.write_raw(&mut state, &bytes)?;
        self.maybe_rollover(&mut state, at)?;
        Ok(address)
    }

    /// Make every append so far durable. `sync=false` is for
    /// `CommitPolicy::Soft`, which relies on a periodic background
    /// flush instead of fsyncing every commit.
    pub fn force(&self, sync: bool) -> EngineResult<()> {
        if !sync {
            return Ok(());
        }
        let state = self.state.lock().unwrap();
        state.file.sync_data().map_err(|e| EngineError::io("journal fsync", e))
    }

    fn read_record_at(&self, address: JournalAddress) -> EngineResult<Record> {
        let file_num = address_file_num(address);
        let offset = address_offset(address);
        let path = Self::file_path(&self.dir, &self.name, file_num);
        let mut file = File::open(&path).map_err(|e| EngineError::io("journal read open", e))?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| EngineError::io("journal read seek", e))?;

        let mut header = [0u8; 14];
        file.read_exact(&mut header).map_err(|e| EngineError::io("journal read header", e))?;
        let total_len = u32::from_be_bytes(header[2..6].try_into().unwrap()) as usize;

        let mut full = vec![0u8; total_len];
        full[..14].copy_from_slice(&header);
        file.read_exact(&mut full[14..]).map_err(|e| EngineError::io("journal read body", e))?;

        let mut reader = ByteReader::new(&full);
        let (record, _at) = Record::decode_full(&mut reader)?;
        Ok(record)
    }

    /// Reads can race a copy-back pass that just deleted the file
    /// holding `address` — retry once before giving up.
    fn read_record_at_tolerant(&self, address: JournalAddress) -> EngineResult<Record> {
        match self.read_record_at(address) {
            Err(EngineError::IoFailed { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                self.read_record_at(address)
            }
            other => other,
        }
    }

    /// Copy up to `max_n` of the oldest journaled page images (those
    /// whose timestamp is at or before `before`) into their home
    /// volumes, then drop them from the page map. `resolve_volume` maps
    /// a journal volume handle back to the live `Volume`; pages for a
    /// handle it can't resolve are left for the next pass.
    pub fn copy_back<F>(&self, before: Timestamp, max_n: usize, resolve_volume: F) -> EngineResult<usize>
    where
        F: Fn(u32) -> Option<Arc<Volume>>,
    {
        let candidates = self.page_map.copy_back_candidates(before, max_n);
        let mut copied = 0;
        for (volume_handle, page_id, node) in candidates {
            let Some(volume) = resolve_volume(volume_handle) else {
                warn!("journal {}: copy-back found no live volume for handle {}, deferring", self.name, volume_handle);
                continue;
            };
            let record = self.read_record_at_tolerant(node.address)?;
            if let Record::PageImage(page_record) = record {
                volume.write_page(page_id, &page_record.image)?;
                self.page_map.remove_entry(volume_handle, page_id, node.address);
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// Delete every journal file below `before_file_num` once nothing
    /// in the page map still references it and no live transaction
    /// could have started before it — called after a successful
    /// `copy_back` + `checkpoint` pass.
    pub fn reclaim_files_below(&self, before_file_num: u64) -> EngineResult<usize> {
        if let Some(oldest) = self.page_map.oldest_address() {
            if address_file_num(oldest) < before_file_num {
                return Ok(0); // still referenced; nothing to reclaim yet
            }
        }
        let mut removed = 0;
        for file_num in 1..before_file_num {
            let path = Self::file_path(&self.dir, &self.name, file_num);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!("journal {}: reclaimed file {}", self.name, file_num);
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::io("journal reclaim", e)),
            }
        }
        Ok(removed)
    }

    pub fn current_file_num(&self) -> u64 {
        self.state.lock().unwrap().file_num
    }

    pub fn page_map(&self) -> &PageMap {
        &self.page_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_page_image_is_retrievable_via_copy_back() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalManager::create(dir.path(), "jnl", 1 << 20, 1).unwrap();

        let image = vec![0xEEu8; 64];
        journal.write_page_image("main", 5, &image, 10).unwrap();

        let volume_spec = crate::config::VolumeSpec {
            name: "main".to_string(),
            path: dir.path().join("main.vol"),
            create: crate::config::VolumeOpenMode::Create,
            page_size: 64,
            initial_pages: 8,
            extension_pages: 8,
            maximum_pages: 1000,
        };
        let volume = Arc::new(Volume::open(&volume_spec).unwrap());
        // Make sure page 5 exists in the volume before writing into it.
        for _ in 0..6 {
            volume.alloc_new_page().unwrap();
        }

        let copied = journal
            .copy_back(100, 10, |handle| if handle == 1 { Some(Arc::clone(&volume)) } else { None })
            .unwrap();
        assert_eq!(copied, 1);

        let mut readback = vec![0u8; 64];
        volume.read_page(5, &mut readback).unwrap();
        assert_eq!(readback, image);
        assert!(journal.page_map().is_empty());
    }

    #[test]
    fn write_transaction_resolves_tree_handles_and_clears_live_set() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalManager::create(dir.path(), "jnl", 1 << 20, 1).unwrap();
        journal.begin_transaction(5);

        journal
            .write_transaction(
                5,
                9,
                vec![
                    PendingUpdate::Store { tree: "orders".to_string(), key: b"k".to_vec(), value: b"v".to_vec() },
                    PendingUpdate::Delta { accumulator_id: 42, step: 0, value: 3 },
                ],
            )
            .unwrap();

        assert!(journal.state.lock().unwrap().live_transactions.is_empty());
        assert_eq!(journal.state.lock().unwrap().tree_handles.get("orders"), Some(&1));
    }

    #[test]
    fn rollover_starts_a_fresh_file_once_block_size_is_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalManager::create(dir.path(), "jnl", 64, 1).unwrap();
        for i in 0..20u64 {
            journal.write_page_image("v", i, &[0u8; 16], i + 1).unwrap();
        }
        assert!(journal.current_file_num() > 1);
    }

    #[test]
    fn checkpoint_base_address_tracks_the_oldest_live_page() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalManager::create(dir.path(), "jnl", 1 << 20, 1).unwrap();
        let first = journal.write_page_image("v", 1, &[1u8; 8], 5).unwrap();
        journal.write_page_image("v", 2, &[2u8; 8], 6).unwrap();

        let cp_address = journal.checkpoint(10, 1_700_000_000).unwrap();
        let record = journal.read_record_at(cp_address).unwrap();
        match record {
            Record::Checkpoint(cp) => assert_eq!(cp.base_address, first),
            other => panic!("expected checkpoint record, got {:?}", other),
        }
    }
}
