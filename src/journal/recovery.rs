//! 4.K Recovery Manager: replays a journal written by a prior,
//! uncleanly-terminated run.
//!
//! Grounded in shape on `prataprc-rdms`'s `wral::journal::IterJournal`
//! ranged replay iterator (a forward scan over a journal rebuilding an
//! index before entries are read back out in order); the actual replay
//! target here is a caller-supplied listener rather than an in-memory
//! index, since recovered updates must be re-applied to live trees
//! (§4.F) and accumulators (§4.I), not just re-read.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::codec::ByteReader;
use crate::error::{EngineError, EngineResult};
use crate::txn::status::Step;
use crate::txn::timestamp::Timestamp;

use super::record::{Record, TransactionRecord, Update};

/// Callbacks a recovering engine implements to re-apply committed work.
/// Trees and volumes are addressed by name — the only identifier stable
/// across the crash (handles are a purely-in-journal compression and a
/// fresh run may assign them differently).
pub trait RecoveryListener {
    fn start_recovery(&mut self) {}
    fn start_transaction(&mut self, start_ts: Timestamp, commit_ts: Timestamp) {
        let _ = (start_ts, commit_ts);
    }
    fn store(&mut self, tree_name: &str, key: &[u8], value: &[u8]) -> EngineResult<()>;
    fn remove_key_range(&mut self, tree_name: &str, from: &[u8], to: &[u8]) -> EngineResult<()>;
    fn remove_tree(&mut self, tree_name: &str) -> EngineResult<()>;
    fn delta(&mut self, accumulator_id: u64, step: Step, value: i64) -> EngineResult<()>;
    fn end_transaction(&mut self) {}
    fn end_recovery(&mut self) {}
}

#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    pub transactions_replayed: u64,
    pub updates_applied: u64,
    pub updates_skipped_missing_volume: u64,
    pub max_timestamp_seen: Timestamp,
    pub last_checkpoint_ts: Timestamp,
    pub highest_file_num: u64,
}

/// List every `<name>.NNNNNN` journal file in `dir`, sorted by file
/// number ascending.
fn list_journal_files(dir: &Path, name: &str) -> EngineResult<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    let prefix = format!("{}.", name);
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(EngineError::io("journal recovery listdir", e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::io("journal recovery readdir", e))?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if let Some(suffix) = file_name.strip_prefix(&prefix) {
            if let Ok(num) = suffix.parse::<u64>() {
                out.push((num, entry.path()));
            }
        }
    }
    out.sort_by_key(|(num, _)| *num);
    Ok(out)
}

fn read_whole_file(path: &Path) -> EngineResult<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| EngineError::io("journal recovery open", e))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(|e| EngineError::io("journal recovery read", e))?;
    Ok(buf)
}

/// Replay every committed transaction found across `dir`'s journal
/// files into `listener`, in commit-timestamp order.
///
/// 1. Scan every journal file forward from file 1, tolerating a
///    truncated trailing record (the last record of the most recent
///    file written before the crash) by stopping the scan there rather
///    than failing.
/// 2. While scanning, resolve `IV`/`IT` handle tables so later `PA`/`TX`
///    records can be named, and remember the most recent `CP` record's
///    timestamp as `checkpoint_ts`.
/// 3. Collect every `TX` record with `commit_ts > checkpoint_ts` into
///    the recovery set; `TX` records at or before `checkpoint_ts` are
///    already reflected in the volumes a checkpoint covers and are
///    skipped.
/// 4. Sort the recovery set by `commit_ts` and replay each one via
///    `listener`, skipping (and counting) updates against a volume
///    `ignore_missing_volumes` says to tolerate.
/// 5. A transaction whose `start_ts` is older than the oldest file
///    actually present is never resurrected — its effects, if
///    committed, were already captured by an earlier checkpoint that
///    has since been reclaimed.
pub fn recover(
    dir: &Path,
    name: &str,
    ignore_missing_volumes: bool,
    volume_exists: impl Fn(&str) -> bool,
    listener: &mut dyn RecoveryListener,
) -> EngineResult<RecoveryReport> {
    let files = list_journal_files(dir, name)?;
    let mut report = RecoveryReport::default();
    listener.start_recovery();

    if files.is_empty() {
        listener.end_recovery();
        return Ok(report);
    }

    let mut tree_names: HashMap<u32, String> = HashMap::new();
    let mut checkpoint_ts: Timestamp = 0;
    let mut recovery_set: Vec<TransactionRecord> = Vec::new();

    for (file_num, path) in &files {
        report.highest_file_num = (*file_num).max(report.highest_file_num);
        let bytes = read_whole_file(path)?;
        let mut reader = ByteReader::new(&bytes);

        loop {
            if reader.remaining() == 0 {
                break;
            }
            let decoded = Record::decode_full(&mut reader);
            let (record, at) = match decoded {
                Ok(pair) => pair,
                Err(_) => break, // truncated trailing record from the crash; stop here
            };
            report.max_timestamp_seen = report.max_timestamp_seen.max(at);

            match record {
                Record::TreeHandle(h) => {
                    tree_names.insert(h.handle, h.name);
                }
                Record::Checkpoint(cp) => {
                    checkpoint_ts = checkpoint_ts.max(at);
                    let _ = cp; // base_address consulted by the cleanup manager, not recovery
                }
                Record::Transaction(tx) => {
                    report.max_timestamp_seen = report.max_timestamp_seen.max(tx.commit_ts);
                    recovery_set.push(tx);
                }
                Record::PageImage(_)
                | Record::JournalHeader
                | Record::JournalEnd
                | Record::LiveTransactions(_)
                | Record::VolumeHandle(_) => {}
            }
        }
    }
    report.last_checkpoint_ts = checkpoint_ts;

    // Step 5's "never resurrect a transaction older than the recovered
    // base address" falls out of the file scan itself: a transaction
    // whose effects a reclaimed checkpoint already covers has no
    // surviving TX record to find, since its journal file was deleted
    // once `copy_back` finished with it. Nothing here needs to special
    // case `start_ts` against `lowest_file_num` beyond that.
    recovery_set.retain(|tx| tx.commit_ts > checkpoint_ts);
    recovery_set.sort_by_key(|tx| tx.commit_ts);

    for tx in &recovery_set {
        listener.start_transaction(tx.start_ts, tx.commit_ts);
        for update in &tx.updates {
            let tree_name = match update {
                Update::Store { tree_handle, .. }
                | Update::DeleteRange { tree_handle, .. }
                | Update::RemoveTree { tree_handle } => tree_names.get(tree_handle).cloned(),
                Update::Delta { .. } => None,
            };
            if let Some(name) = &tree_name {
                if !volume_exists(name) {
                    if ignore_missing_volumes {
                        log::warn!("recovery: skipping update against missing volume/tree '{}'", name);
                        report.updates_skipped_missing_volume += 1;
                        continue;
                    } else {
                        return Err(EngineError::VolumeNotFound(name.clone()));
                    }
                }
            }

            match update {
                Update::Store { key, value, .. } => {
                    listener.store(tree_name.as_deref().unwrap_or(""), key, value)?;
                }
                Update::DeleteRange { from, to, .. } => {
                    listener.remove_key_range(tree_name.as_deref().unwrap_or(""), from, to)?;
                }
                Update::RemoveTree { .. } => {
                    listener.remove_tree(tree_name.as_deref().unwrap_or(""))?;
                }
                Update::Delta { accumulator_id, step, value } => {
                    listener.delta(*accumulator_id, *step, *value)?;
                }
            }
            report.updates_applied += 1;
        }
        listener.end_transaction();
        report.transactions_replayed += 1;
    }

    listener.end_recovery();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{JournalManager, PendingUpdate};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        stores: Mutex<Vec<(String, Vec<u8>, Vec<u8>)>>,
        deltas: Mutex<Vec<(u64, Step, i64)>>,
    }

    impl RecoveryListener for RecordingListener {
        fn store(&mut self, tree_name: &str, key: &[u8], value: &[u8]) -> EngineResult<()> {
            self.stores.lock().unwrap().push((tree_name.to_string(), key.to_vec(), value.to_vec()));
            Ok(())
        }
        fn remove_key_range(&mut self, _tree_name: &str, _from: &[u8], _to: &[u8]) -> EngineResult<()> {
            Ok(())
        }
        fn remove_tree(&mut self, _tree_name: &str) -> EngineResult<()> {
            Ok(())
        }
        fn delta(&mut self, accumulator_id: u64, step: Step, value: i64) -> EngineResult<()> {
            self.deltas.lock().unwrap().push((accumulator_id, step, value));
            Ok(())
        }
    }

    #[test]
    fn recover_replays_committed_transactions_in_commit_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalManager::create(dir.path(), "jnl", 1 << 20, 1).unwrap();
        journal.begin_transaction(2);
        journal
            .write_transaction(2, 9, vec![PendingUpdate::Store { tree: "orders".to_string(), key: b"a".to_vec(), value: b"1".to_vec() }])
            .unwrap();
        journal.begin_transaction(3);
        journal
            .write_transaction(3, 6, vec![PendingUpdate::Store { tree: "orders".to_string(), key: b"b".to_vec(), value: b"2".to_vec() }])
            .unwrap();
        drop(journal);

        let mut listener = RecordingListener::default();
        let report = recover(dir.path(), "jnl", false, |_| true, &mut listener).unwrap();

        assert_eq!(report.transactions_replayed, 2);
        let stores = listener.stores.lock().unwrap();
        assert_eq!(stores[0].2, b"2"); // commit_ts 6 before commit_ts 9
        assert_eq!(stores[1].2, b"1");
    }

    #[test]
    fn recover_skips_updates_against_a_missing_volume_when_asked_to() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalManager::create(dir.path(), "jnl", 1 << 20, 1).unwrap();
        journal.begin_transaction(2);
        journal
            .write_transaction(2, 5, vec![PendingUpdate::Store { tree: "gone".to_string(), key: b"a".to_vec(), value: b"1".to_vec() }])
            .unwrap();
        drop(journal);

        let mut listener = RecordingListener::default();
        let report = recover(dir.path(), "jnl", true, |_| false, &mut listener).unwrap();
        assert_eq!(report.updates_skipped_missing_volume, 1);
        assert!(listener.stores.lock().unwrap().is_empty());
    }

    #[test]
    fn recover_fails_closed_on_a_missing_volume_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalManager::create(dir.path(), "jnl", 1 << 20, 1).unwrap();
        journal.begin_transaction(2);
        journal
            .write_transaction(2, 5, vec![PendingUpdate::Store { tree: "gone".to_string(), key: b"a".to_vec(), value: b"1".to_vec() }])
            .unwrap();
        drop(journal);

        let mut listener = RecordingListener::default();
        let result = recover(dir.path(), "jnl", false, |_| false, &mut listener);
        assert!(result.is_err());
    }

    #[test]
    fn recover_on_an_empty_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = RecordingListener::default();
        let report = recover(dir.path(), "jnl", false, |_| true, &mut listener).unwrap();
        assert_eq!(report.transactions_replayed, 0);
    }
}
