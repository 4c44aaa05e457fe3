//! The journal's in-memory page map (spec §4.J): for every `(volume,
//! pageId)` pair touched since the last copy-back, the set of journal
//! addresses holding an image of that page, newest first. A lookup for
//! a page returns the newest entry whose timestamp does not exceed the
//! requester's snapshot — the same "newest visible version" shape as
//! the MVV cell chain (§4.H), just at page rather than record
//! granularity.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::txn::timestamp::Timestamp;
use crate::volume::PageId;

use super::record::JournalAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageNode {
    pub address: JournalAddress,
    pub timestamp: Timestamp,
}

#[derive(Default)]
pub struct PageMap {
    table: Mutex<HashMap<(u32, PageId), Vec<PageNode>>>,
}

impl PageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly journaled image. Entries for a page are kept
    /// newest-first so `lookup` can return on the first match.
    pub fn record(&self, volume_handle: u32, page_id: PageId, address: JournalAddress, at: Timestamp) {
        let mut table = self.table.lock().unwrap();
        let nodes = table.entry((volume_handle, page_id)).or_default();
        let insert_at = nodes.partition_point(|n| n.timestamp > at);
        nodes.insert(insert_at, PageNode { address, timestamp: at });
    }

    /// The newest image of `(volume_handle, page_id)` visible at
    /// `max_ts`, or `None` if the page has never been journaled (or
    /// every entry postdates `max_ts`).
    pub fn lookup(&self, volume_handle: u32, page_id: PageId, max_ts: Timestamp) -> Option<PageNode> {
        let table = self.table.lock().unwrap();
        table
            .get(&(volume_handle, page_id))?
            .iter()
            .find(|n| n.timestamp <= max_ts)
            .copied()
    }

    /// The oldest address still referenced by any tracked page — the
    /// recoverable-prefix boundary a checkpoint's `base_address` must
    /// not advance past.
    pub fn oldest_address(&self) -> Option<JournalAddress> {
        let table = self.table.lock().unwrap();
        table
            .values()
            .filter_map(|nodes| nodes.last())
            .map(|n| n.address)
            .min()
    }

    /// Drop the entry at `address` for `(volume_handle, page_id)` once
    /// the copy-back writer has durably written it into the volume
    /// file — it no longer needs to be recovered from the journal.
    pub fn remove_entry(&self, volume_handle: u32, page_id: PageId, address: JournalAddress) {
        let mut table = self.table.lock().unwrap();
        if let Some(nodes) = table.get_mut(&(volume_handle, page_id)) {
            nodes.retain(|n| n.address != address);
            if nodes.is_empty() {
                table.remove(&(volume_handle, page_id));
            }
        }
    }

    /// Every `(volume_handle, page_id, address)` triple whose newest
    /// entry is still older than `before` — candidates for the next
    /// copy-back pass, oldest first.
    pub fn copy_back_candidates(&self, before: Timestamp, max_n: usize) -> Vec<(u32, PageId, PageNode)> {
        let table = self.table.lock().unwrap();
        let mut out: Vec<(u32, PageId, PageNode)> = table
            .iter()
            .filter_map(|(&(vh, pid), nodes)| {
                let oldest = nodes.last()?;
                (oldest.timestamp <= before).then_some((vh, pid, *oldest))
            })
            .collect();
        out.sort_by_key(|(_, _, node)| node.timestamp);
        out.truncate(max_n);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_the_newest_entry_not_exceeding_the_snapshot() {
        let map = PageMap::new();
        map.record(1, 10, 100, 5);
        map.record(1, 10, 200, 15);
        map.record(1, 10, 300, 25);

        assert_eq!(map.lookup(1, 10, 30).unwrap().address, 300);
        assert_eq!(map.lookup(1, 10, 20).unwrap().address, 200);
        assert_eq!(map.lookup(1, 10, 10).unwrap().address, 100);
        assert!(map.lookup(1, 10, 4).is_none());
    }

    #[test]
    fn unrelated_pages_do_not_interfere() {
        let map = PageMap::new();
        map.record(1, 10, 100, 5);
        map.record(2, 10, 200, 5);
        assert!(map.lookup(1, 11, 10).is_none());
        assert_eq!(map.lookup(2, 10, 10).unwrap().address, 200);
    }

    #[test]
    fn remove_entry_drops_the_key_once_empty() {
        let map = PageMap::new();
        map.record(1, 10, 100, 5);
        map.remove_entry(1, 10, 100);
        assert!(map.lookup(1, 10, 10).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn copy_back_candidates_are_oldest_first_and_capped() {
        let map = PageMap::new();
        map.record(1, 1, 10, 1);
        map.record(1, 2, 20, 3);
        map.record(1, 3, 30, 2);

        let candidates = map.copy_back_candidates(10, 2);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].2.timestamp, 1);
        assert_eq!(candidates[1].2.timestamp, 2);
    }
}
