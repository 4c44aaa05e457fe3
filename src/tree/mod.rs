//! 4.F Tree: a B+-tree of MVV-coded leaf values over the page (§4.D) and
//! buffer pool (§4.C) layers, searched and split in the donor's
//! `btree/file.rs` manner (`find_leaf_page`, `split_leaf_page`,
//! `get_parent_with_empty_slots`) but generalized from single-tuple
//! insertion to the engine's versioned `store`/`fetch`/`traverse` surface.
//!
//! Search descends root-to-leaf using each internal page's "low key per
//! child" convention — an entry's key is the smallest key reachable
//! through its child, matching how `split()` copies a new right page's
//! first key up into the parent. A page whose search overruns its last
//! key is followed sideways via its right-sibling pointer, bounded by
//! `MAX_SIDEWAYS_STEPS`, to tolerate a split that raced ahead of an
//! in-flight descent.

pub mod directory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::buffer::BufferPool;
use crate::codec::{ByteReader, Decodeable};
use crate::error::{EngineError, EngineResult};
use crate::mvv::{decode_cell, encode_cell, MvvCell, VersionValue};
use crate::page::longrec::{self, LongRecordHandle, LONG_RECORD_MARKER};
use crate::page::split::{self, SplitPolicy};
use crate::page::{InsertOutcome, Page, PageType};
use crate::txn::index::TransactionIndex;
use crate::txn::status::{Step, TransactionStatus, VersionHandle, UNCOMMITTED};
use crate::txn::timestamp::Timestamp;
use crate::volume::{PageId, Volume};

/// Bound on sideways right-sibling hops during a single descent, per
/// spec §4.F — past this, the volume is considered corrupt rather than
/// looping forever chasing a moving target.
pub const MAX_SIDEWAYS_STEPS: usize = 50;

const DEFAULT_WW_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

struct Descend {
    leaf: PageId,
    /// (internal page id, child index taken) from root down to, but not
    /// including, the leaf. Used by backward traversal to find a
    /// predecessor leaf with no left-sibling pointer to follow directly.
    path: Vec<(PageId, usize)>,
}

/// One B+-tree. Cheap to construct repeatedly — the actual state lives
/// in the volume and buffer pool; this struct is a handle plus the
/// root-pointer and structural generation counter a caller's level cache
/// checks against.
pub struct Tree {
    name: String,
    tree_id: u32,
    volume_id: u32,
    volume: Arc<Volume>,
    pool: Arc<BufferPool>,
    root: AtomicU64,
    generation: AtomicU64,
    ww_timeout: Duration,
}

impl Tree {
    pub(crate) fn from_root(
        name: String,
        tree_id: u32,
        volume_id: u32,
        volume: Arc<Volume>,
        pool: Arc<BufferPool>,
        root: PageId,
    ) -> Self {
        Self {
            name,
            tree_id,
            volume_id,
            volume,
            pool,
            root: AtomicU64::new(root),
            generation: AtomicU64::new(0),
            ww_timeout: DEFAULT_WW_TIMEOUT,
        }
    }

    pub fn with_ww_timeout(mut self, timeout: Duration) -> Self {
        self.ww_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Small integer handle used to key this tree's accumulators (spec
    /// §4.I) — distinct from the root `PageId`, which changes on every
    /// root split, so accumulator state stays stable across structural
    /// changes but never survives a `remove`+`create` of the same name
    /// (the directory hands out a fresh id on every `create`).
    pub fn tree_id(&self) -> u32 {
        self.tree_id
    }

    pub fn root(&self) -> PageId {
        self.root.load(Ordering::Acquire)
    }

    /// Bumped on every split or root replacement. A caller-held level
    /// cache keyed on this value is stale, and must re-descend, once it
    /// disagrees with the live value.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn create(directory: &directory::Directory, name: &str, volume_id: u32, at: Timestamp) -> EngineResult<Tree> {
        directory.create(name, volume_id, at)
    }

    pub fn open(directory: &directory::Directory, name: &str, volume_id: u32) -> EngineResult<Option<Tree>> {
        directory.open(name, volume_id)
    }

    pub fn remove(self, directory: &directory::Directory, at: Timestamp) -> EngineResult<()> {
        directory.remove(&self.name, at)
    }

    fn read_page(&self, page_id: PageId) -> EngineResult<Page> {
        let handle = self.pool.get(self.volume_id, page_id, false, true)?;
        Page::from_bytes(handle.bytes().to_vec())
    }

    fn write_page(&self, page_id: PageId, page: &Page, at: Timestamp) -> EngineResult<()> {
        let mut handle = self.pool.get(self.volume_id, page_id, true, true)?;
        handle.bytes_mut()?.copy_from_slice(page.bytes());
        handle.mark_dirty(at)?;
        Ok(())
    }

    /// Write a page that has no prior resident frame (a fresh split
    /// sibling or a new root) straight through to the volume; the buffer
    /// pool will pick it up as a normal cache miss the next time it's
    /// claimed.
    fn write_new_page(&self, page_id: PageId, page: &Page) -> EngineResult<()> {
        self.volume.write_page(page_id, page.bytes())
    }

    fn descend(&self, key: &[u8]) -> EngineResult<Descend> {
        let mut path = Vec::new();
        let mut page_id = self.root();
        loop {
            let mut page = self.read_page(page_id)?;
            if page.is_leaf() {
                return Ok(Descend { leaf: page_id, path });
            }
            let found = page.search(key);
            let child_index = if found.exact { found.index } else { found.index.saturating_sub(1) };
            path.push((page_id, child_index));
            page_id = page.child_page_id(child_index);
        }
    }

    /// Land on the leaf actually holding (or that should hold) `key`,
    /// following right siblings if a concurrent split moved it past the
    /// page reached by `descend`.
    fn locate_for_key(&self, root_leaf: PageId, key: &[u8]) -> EngineResult<(PageId, Page, crate::page::FoundAt)> {
        let mut page_id = root_leaf;
        let mut page = self.read_page(page_id)?;
        let mut found = page.search(key);
        let mut steps = 0;
        while !found.exact && found.index == page.key_block_count() && page.right_sibling() != 0 {
            if steps >= MAX_SIDEWAYS_STEPS {
                return Err(EngineError::CorruptVolume(format!(
                    "tree '{}': exceeded {} sideways steps searching for a key",
                    self.name, MAX_SIDEWAYS_STEPS
                )));
            }
            page_id = page.right_sibling();
            page = self.read_page(page_id)?;
            found = page.search(key);
            steps += 1;
        }
        Ok((page_id, page, found))
    }

    fn decode_cell_at(&self, page: &Page, index: usize) -> EngineResult<MvvCell> {
        let bytes = page.value_bytes(index);
        if bytes.first() == Some(&LONG_RECORD_MARKER) {
            let mut reader = ByteReader::new(bytes);
            let handle = LongRecordHandle::decode_from(&mut reader)?;
            let chain_bytes = longrec::read_chain(&self.volume, &handle)?;
            decode_cell(&chain_bytes)
        } else {
            decode_cell(bytes)
        }
    }

    fn encode_cell_for_storage(&self, cell: &MvvCell) -> EngineResult<Vec<u8>> {
        let encoded = encode_cell(cell);
        let threshold = self.volume.page_size() / 4;
        if encoded.len() > threshold {
            let handle = longrec::write_chain(&self.volume, &encoded)?;
            Ok(handle.encode())
        } else {
            Ok(encoded)
        }
    }

    /// Store `value` under `key` as a new MVV version authored by `txn`
    /// at `step` (spec §4.F/§4.H). If the key's last writer is a
    /// different, still-active transaction, resolves the write-write
    /// dependency (spec §4.G) before proceeding; a deadlock or timeout
    /// surfaces as `EngineError::InUse`.
    pub fn store(
        &self,
        index: &TransactionIndex,
        txn: &TransactionStatus,
        step: Step,
        key: &[u8],
        value: &[u8],
    ) -> EngineResult<()> {
        if key.is_empty() {
            return Err(EngineError::InvalidKey("key must not be empty".to_string()));
        }
        let descend = self.descend(key)?;
        let (leaf_id, mut page, found) = self.locate_for_key(descend.leaf, key)?;

        let mut cell = if found.exact {
            self.decode_cell_at(&page, found.index)?
        } else {
            MvvCell::new()
        };

        if let Some(last) = cell.versions.first() {
            if last.handle.ts() != txn.ts {
                let status = index.ww_dependency(last.handle, txn, self.ww_timeout);
                if status == UNCOMMITTED {
                    return Err(EngineError::InUse {
                        timeout_ms: self.ww_timeout.as_millis() as u64,
                    });
                }
            }
        }

        cell.push_front(VersionHandle::new(txn.ts, step), VersionValue::Value(value.to_vec()));
        txn.note_version_authored();

        let encoded = self.encode_cell_for_storage(&cell)?;
        let dirty_at = index.allocator.update();

        if found.exact {
            page.remove_key_range(found.index, found.index + 1);
        }
        match page.insert_leaf(key, &encoded) {
            InsertOutcome::Inserted => self.write_page(leaf_id, &page, dirty_at),
            InsertOutcome::NeedsSplit => self.split_and_propagate(leaf_id, page, descend.path, dirty_at),
        }
    }

    /// Resolve the value visible to a reader at `(reader_ts,
    /// reader_step)`, or `None` if the key has never been stored or its
    /// visible version is a tombstone.
    pub fn fetch(
        &self,
        index: &TransactionIndex,
        reader_ts: Timestamp,
        reader_step: Step,
        key: &[u8],
    ) -> EngineResult<Option<Vec<u8>>> {
        let descend = self.descend(key)?;
        let (_, page, found) = self.locate_for_key(descend.leaf, key)?;
        if !found.exact {
            return Ok(None);
        }
        let cell = self.decode_cell_at(&page, found.index)?;
        Ok(cell
            .visible_for(index, reader_ts, reader_step)
            .and_then(|v| v.bytes().map(|b| b.to_vec())))
    }

    /// Tombstone every key in `[from, to)` as a new version authored by
    /// `txn` — a removal is itself a version, not a physical delete, so
    /// it is subject to the same MVCC visibility rules as `store`.
    pub fn remove_key_range(
        &self,
        index: &TransactionIndex,
        txn: &TransactionStatus,
        step: Step,
        from: &[u8],
        to: &[u8],
    ) -> EngineResult<usize> {
        let mut removed = 0;
        let mut cursor = from.to_vec();

        loop {
            let descend = self.descend(&cursor)?;
            let (leaf_id, mut page, found) = self.locate_for_key(descend.leaf, &cursor)?;
            let start_index = found.index;

            if start_index >= page.key_block_count() {
                match next_leaf(&page) {
                    Some(next_id) => {
                        cursor = self.min_key_of(next_id)?;
                        if cursor.is_empty() {
                            break;
                        }
                        continue;
                    }
                    None => break,
                }
            }

            let k = page.reconstruct_key(start_index);
            if k.as_slice() >= to {
                break;
            }

            let mut cell = self.decode_cell_at(&page, start_index)?;
            cell.push_front(VersionHandle::new(txn.ts, step), VersionValue::Tombstone);
            txn.note_version_authored();
            let encoded = self.encode_cell_for_storage(&cell)?;
            let dirty_at = index.allocator.update();

            page.remove_key_range(start_index, start_index + 1);
            let leaf_path = self.descend(&k)?.path;
            match page.insert_leaf(&k, &encoded) {
                InsertOutcome::Inserted => self.write_page(leaf_id, &page, dirty_at)?,
                InsertOutcome::NeedsSplit => self.split_and_propagate(leaf_id, page, leaf_path, dirty_at)?,
            }
            removed += 1;

            let mut next_key = k;
            next_key.push(0);
            cursor = next_key;
        }

        Ok(removed)
    }

    fn min_key_of(&self, page_id: PageId) -> EngineResult<Vec<u8>> {
        let page = self.read_page(page_id)?;
        if page.key_block_count() == 0 {
            return Ok(Vec::new());
        }
        Ok(page.reconstruct_key(0))
    }

    /// Find the first (forward) or last (backward) key relative to
    /// `key`, `inclusive` of `key` itself, whose visible version (spec
    /// §4.G) is not a tombstone.
    pub fn traverse(
        &self,
        index: &TransactionIndex,
        reader_ts: Timestamp,
        reader_step: Step,
        key: &[u8],
        direction: Direction,
        inclusive: bool,
    ) -> EngineResult<Option<(Vec<u8>, Vec<u8>)>> {
        match direction {
            Direction::Forward => self.traverse_forward(index, reader_ts, reader_step, key, inclusive),
            Direction::Backward => self.traverse_backward(index, reader_ts, reader_step, key, inclusive),
        }
    }

    fn traverse_forward(
        &self,
        index: &TransactionIndex,
        reader_ts: Timestamp,
        reader_step: Step,
        key: &[u8],
        inclusive: bool,
    ) -> EngineResult<Option<(Vec<u8>, Vec<u8>)>> {
        let descend = self.descend(key)?;
        let (mut leaf_id, mut page, found) = self.locate_for_key(descend.leaf, key)?;
        let mut i = if found.exact {
            if inclusive {
                found.index
            } else {
                found.index + 1
            }
        } else {
            found.index
        };

        let mut steps = 0;
        loop {
            if i >= page.key_block_count() {
                let sib = page.right_sibling();
                if sib == 0 || steps >= MAX_SIDEWAYS_STEPS {
                    return Ok(None);
                }
                leaf_id = sib;
                page = self.read_page(leaf_id)?;
                i = 0;
                steps += 1;
                continue;
            }
            let k = page.reconstruct_key(i);
            let cell = self.decode_cell_at(&page, i)?;
            if let Some(visible) = cell.visible_for(index, reader_ts, reader_step) {
                if let Some(bytes) = visible.bytes() {
                    return Ok(Some((k, bytes.to_vec())));
                }
            }
            i += 1;
        }
    }

    fn traverse_backward(
        &self,
        index: &TransactionIndex,
        reader_ts: Timestamp,
        reader_step: Step,
        key: &[u8],
        inclusive: bool,
    ) -> EngineResult<Option<(Vec<u8>, Vec<u8>)>> {
        let descend = self.descend(key)?;
        let (_, mut page, found) = self.locate_for_key(descend.leaf, key)?;
        let mut path = descend.path;
        let mut i: isize = if found.exact {
            if inclusive {
                found.index as isize
            } else {
                found.index as isize - 1
            }
        } else {
            found.index as isize - 1
        };

        loop {
            if i < 0 {
                match self.previous_leaf(&mut path)? {
                    Some(prev_id) => {
                        page = self.read_page(prev_id)?;
                        i = page.key_block_count() as isize - 1;
                        continue;
                    }
                    None => return Ok(None),
                }
            }
            let idx = i as usize;
            let k = page.reconstruct_key(idx);
            let cell = self.decode_cell_at(&page, idx)?;
            if let Some(visible) = cell.visible_for(index, reader_ts, reader_step) {
                if let Some(bytes) = visible.bytes() {
                    return Ok(Some((k, bytes.to_vec())));
                }
            }
            i -= 1;
        }
    }

    /// Walk `path` (root-to-leaf, exclusive of the leaf) up and back down
    /// to find the leaf immediately to the left of where it started,
    /// since pages only carry a right-sibling pointer. Mutates `path` in
    /// place so a second call continues correctly from the new position.
    fn previous_leaf(&self, path: &mut Vec<(PageId, usize)>) -> EngineResult<Option<PageId>> {
        loop {
            match path.pop() {
                None => return Ok(None),
                Some((parent_id, child_index)) => {
                    if child_index == 0 {
                        continue;
                    }
                    let parent = self.read_page(parent_id)?;
                    let mut page_id = parent.child_page_id(child_index - 1);
                    path.push((parent_id, child_index - 1));
                    loop {
                        let page = self.read_page(page_id)?;
                        if page.is_leaf() {
                            return Ok(Some(page_id));
                        }
                        let last = page.key_block_count() - 1;
                        path.push((page_id, last));
                        page_id = page.child_page_id(last);
                    }
                }
            }
        }
    }

    /// Split a page that just failed to accept an insert, then propagate
    /// the new separator up the `path` recorded during descent,
    /// recursively splitting ancestors as needed and replacing the root
    /// if the split reaches it (spec §4.F, grounded on the donor's
    /// `split_leaf_page`/`get_parent_with_empty_slots`).
    fn split_and_propagate(
        &self,
        page_id: PageId,
        mut page: Page,
        mut path: Vec<(PageId, usize)>,
        dirty_at: Timestamp,
    ) -> EngineResult<()> {
        let right_page_id = self.volume.alloc_new_page()?;
        let right = split::split(&mut page, right_page_id, SplitPolicy::NiceBias);
        let separator = right.reconstruct_key(0);
        debug!("split page {} -> {} on volume {}", page_id, right_page_id, self.volume_id);

        self.write_page(page_id, &page, dirty_at)?;
        self.write_new_page(right_page_id, &right)?;
        self.generation.fetch_add(1, Ordering::AcqRel);

        match path.pop() {
            None => {
                let left_first_key = page.reconstruct_key(0);
                let level = page.level() + 1;
                let mut new_root = Page::new(self.volume.page_size(), PageType::Internal, level);
                new_root.insert_internal(&left_first_key, page_id);
                new_root.insert_internal(&separator, right_page_id);
                let new_root_id = self.volume.alloc_new_page()?;
                self.write_new_page(new_root_id, &new_root)?;
                self.root.store(new_root_id, Ordering::Release);
                Ok(())
            }
            Some((parent_id, _)) => {
                let mut parent = self.read_page(parent_id)?;
                match parent.insert_internal(&separator, right_page_id) {
                    InsertOutcome::Inserted => self.write_page(parent_id, &parent, dirty_at),
                    InsertOutcome::NeedsSplit => self.split_and_propagate(parent_id, parent, path, dirty_at),
                }
            }
        }
    }

    /// Every leaf page reachable from the current root, left to right.
    /// Used by the cleanup manager (spec §4.L) to sweep a tree for
    /// prunable MVV versions without needing its own descent logic.
    pub fn leaf_pages(&self) -> EngineResult<Vec<PageId>> {
        let mut page_id = self.root();
        loop {
            let page = self.read_page(page_id)?;
            if page.is_leaf() {
                break;
            }
            page_id = page.child_page_id(0);
        }

        let mut out = Vec::new();
        let mut current = page_id;
        loop {
            out.push(current);
            let page = self.read_page(current)?;
            match next_leaf(&page) {
                Some(next_id) => current = next_id,
                None => break,
            }
        }
        Ok(out)
    }

    /// Every page reachable from the current root, internal nodes
    /// included. Used when a tree has already been dropped from its
    /// directory and only its root page id survives to walk from (spec
    /// §4.L tree reclaim) — `leaf_pages` alone would leak the internal
    /// nodes above them.
    pub fn all_pages(&self) -> EngineResult<Vec<PageId>> {
        let mut out = Vec::new();
        let mut frontier = vec![self.root()];
        while let Some(page_id) = frontier.pop() {
            let page = self.read_page(page_id)?;
            if !page.is_leaf() {
                for i in 0..page.key_block_count() {
                    frontier.push(page.child_page_id(i));
                }
            }
            out.push(page_id);
        }
        Ok(out)
    }

    /// Run `Page::verify` (spec §8 invariant 1) over every leaf reachable
    /// from the current root.
    pub fn verify_leaves(&self) -> EngineResult<()> {
        for page_id in self.leaf_pages()? {
            self.read_page(page_id)?.verify()?;
        }
        Ok(())
    }

    /// Drop every MVV version at `page_id` that `MvvCell::prune` (spec
    /// §4.H) would drop given `snapshot_floor`, rewriting the page only
    /// if anything actually changed. A key block whose cell prunes down
    /// to `MvvCell::is_empty()` is dropped outright rather than
    /// reinserted; a long-record cell that prunes this way has its
    /// chain freed via `longrec::free_chain` first. If every key block
    /// on the page prunes away, the now-empty leaf is unlinked from its
    /// parent and deallocated (or, if it is the tree's root, just left
    /// empty) so pages a drained tree no longer needs are actually
    /// freed back to the volume. Returns the number of versions removed.
    pub fn prune_page(&self, index: &TransactionIndex, page_id: PageId, snapshot_floor: Timestamp, at: Timestamp) -> EngineResult<usize> {
        let mut page = self.read_page(page_id)?;
        if !page.is_leaf() {
            return Ok(0);
        }

        let count = page.key_block_count();
        let original_first_key = if count > 0 { Some(page.reconstruct_key(0)) } else { None };
        let mut rebuilt: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(count);
        let mut total_removed = 0;

        for i in 0..count {
            let key = page.reconstruct_key(i);
            let bytes = page.value_bytes(i);
            if bytes.first() == Some(&LONG_RECORD_MARKER) {
                let mut reader = ByteReader::new(bytes);
                let handle = LongRecordHandle::decode_from(&mut reader)?;
                let chain_bytes = longrec::read_chain(&self.volume, &handle)?;
                let mut cell = decode_cell(&chain_bytes)?;
                let removed = cell.prune(index, snapshot_floor);
                if removed > 0 {
                    total_removed += removed;
                    longrec::free_chain(&self.volume, &handle)?;
                    if !cell.is_empty() {
                        rebuilt.push((key, self.encode_cell_for_storage(&cell)?));
                    }
                } else {
                    rebuilt.push((key, bytes.to_vec()));
                }
                continue;
            }
            let mut cell = decode_cell(bytes)?;
            let removed = cell.prune(index, snapshot_floor);
            if removed > 0 {
                total_removed += removed;
                if !cell.is_empty() {
                    rebuilt.push((key, encode_cell(&cell)));
                }
            } else {
                rebuilt.push((key, bytes.to_vec()));
            }
        }

        if total_removed == 0 {
            return Ok(0);
        }

        if rebuilt.is_empty() {
            let path = match original_first_key {
                Some(k) => self.descend(&k)?.path,
                None => Vec::new(),
            };
            page.remove_key_range(0, count);
            if path.is_empty() {
                // Tree's permanent root leaf: keep it, just now empty.
                self.write_page(page_id, &page, at)?;
            } else {
                self.join_after_emptying_leaf(path, page_id, at)?;
            }
            return Ok(total_removed);
        }

        page.remove_key_range(0, count);
        for (key, value) in &rebuilt {
            match page.insert_leaf(key, value) {
                InsertOutcome::Inserted => {}
                InsertOutcome::NeedsSplit => {
                    return Err(EngineError::CorruptVolume(format!(
                        "tree '{}': pruning page {} unexpectedly required a split",
                        self.name, page_id
                    )));
                }
            }
        }
        self.write_page(page_id, &page, at)?;
        Ok(total_removed)
    }

    /// `page_id` just had its last key block pruned away. Unlink it from
    /// its parent's key block at `path`'s tail, relink the previous leaf's
    /// `right_sibling` around it, deallocate the page, and cascade the
    /// same collapse upward through any ancestor that itself becomes
    /// childless or single-childed (spec §4.D page maintenance).
    fn join_after_emptying_leaf(&self, path: Vec<(PageId, usize)>, empty_leaf_id: PageId, at: Timestamp) -> EngineResult<()> {
        self.generation.fetch_add(1, Ordering::AcqRel);

        let empty_leaf = self.read_page(empty_leaf_id)?;
        let right_sibling = empty_leaf.right_sibling();

        let mut prev_path = path.clone();
        if let Some(prev_id) = self.previous_leaf(&mut prev_path)? {
            let mut prev_page = self.read_page(prev_id)?;
            prev_page.set_right_sibling(right_sibling);
            self.write_page(prev_id, &prev_page, at)?;
        }

        self.volume.deallocate_page(empty_leaf_id)?;
        debug!("tree '{}': freed emptied leaf {} on volume {}", self.name, empty_leaf_id, self.volume_id);
        self.remove_child_and_collapse(path, at)
    }

    /// Remove the child entry at `path`'s tail from its parent. If the
    /// parent itself becomes childless, free it and keep cascading
    /// upward; if it degenerates to a single child and is the root,
    /// collapse the root to that child directly.
    fn remove_child_and_collapse(&self, mut path: Vec<(PageId, usize)>, at: Timestamp) -> EngineResult<()> {
        loop {
            let (parent_id, child_index) = match path.pop() {
                Some(entry) => entry,
                None => return Ok(()),
            };
            let mut parent = self.read_page(parent_id)?;
            parent.remove_key_range(child_index, child_index + 1);
            let remaining = parent.key_block_count();

            if remaining == 0 {
                if path.is_empty() {
                    // The root's only child is gone; collapse it to an
                    // empty leaf rather than leave a childless internal
                    // root behind.
                    let empty_root = Page::new(self.volume.page_size(), PageType::Leaf, 0);
                    self.write_page(parent_id, &empty_root, at)?;
                    return Ok(());
                }
                self.volume.deallocate_page(parent_id)?;
                debug!("tree '{}': freed emptied internal page {} on volume {}", self.name, parent_id, self.volume_id);
                continue;
            }

            if remaining == 1 && path.is_empty() {
                let only_child = parent.child_page_id(0);
                self.root.store(only_child, Ordering::Release);
                self.volume.deallocate_page(parent_id)?;
                debug!("tree '{}': root collapsed to single child {}", self.name, only_child);
                return Ok(());
            }

            self.write_page(parent_id, &parent, at)?;
            return Ok(());
        }
    }

    pub(crate) fn raw_get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let descend = self.descend(key)?;
        let (_, page, found) = self.locate_for_key(descend.leaf, key)?;
        if !found.exact {
            return Ok(None);
        }
        Ok(Some(page.value_bytes(found.index).to_vec()))
    }

    pub(crate) fn raw_put(&self, key: &[u8], value: &[u8], at: Timestamp) -> EngineResult<()> {
        let descend = self.descend(key)?;
        let (leaf_id, mut page, found) = self.locate_for_key(descend.leaf, key)?;
        if found.exact {
            page.remove_key_range(found.index, found.index + 1);
        }
        match page.insert_leaf(key, value) {
            InsertOutcome::Inserted => self.write_page(leaf_id, &page, at),
            InsertOutcome::NeedsSplit => self.split_and_propagate(leaf_id, page, descend.path, at),
        }
    }

    pub(crate) fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    #[cfg(test)]
    pub(crate) fn force_root_for_test(&self, root: PageId, generation: u64) {
        self.root.store(root, Ordering::Release);
        self.generation.store(generation, Ordering::Release);
    }
}

fn next_leaf(page: &Page) -> Option<PageId> {
    let sib = page.right_sibling();
    if sib == 0 {
        None
    } else {
        Some(sib)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VolumeOpenMode, VolumeSpec};

    fn test_env(dir: &std::path::Path, page_size: u32) -> (Arc<Volume>, Arc<BufferPool>) {
        let spec = VolumeSpec {
            name: "v".to_string(),
            path: dir.join("v.vol"),
            create: VolumeOpenMode::Create,
            page_size,
            initial_pages: 4,
            extension_pages: 8,
            maximum_pages: 10_000,
        };
        let volume = Arc::new(Volume::open(&spec).unwrap());
        let pool = Arc::new(BufferPool::new(page_size as usize, 64));
        pool.register_volume(1, Arc::clone(&volume));
        (volume, pool)
    }

    fn new_tree(volume: &Arc<Volume>, pool: &Arc<BufferPool>) -> Tree {
        let page = Page::new(volume.page_size(), PageType::Leaf, 0);
        let root = volume.alloc_new_page().unwrap();
        volume.write_page(root, page.bytes()).unwrap();
        Tree::from_root("t".to_string(), 1, 1, Arc::clone(volume), Arc::clone(pool), root)
    }

    #[test]
    fn store_then_fetch_round_trips_a_value() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, pool) = test_env(dir.path(), 1024);
        let tree = new_tree(&volume, &pool);
        let index = TransactionIndex::new(4);
        let txn = index.register();

        tree.store(&index, &txn, 0, b"k1", b"v1").unwrap();
        index.commit(txn.ts, index.allocator.update());

        let reader_ts = index.allocator.update();
        let got = tree.fetch(&index, reader_ts, 0, b"k1").unwrap();
        assert_eq!(got, Some(b"v1".to_vec()));
    }

    #[test]
    fn store_is_invisible_to_a_reader_whose_snapshot_predates_it() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, pool) = test_env(dir.path(), 1024);
        let tree = new_tree(&volume, &pool);
        let index = TransactionIndex::new(4);

        let reader_ts = index.allocator.update();
        let txn = index.register();
        tree.store(&index, &txn, 0, b"k1", b"v1").unwrap();

        let got = tree.fetch(&index, reader_ts, 0, b"k1").unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn splitting_a_leaf_preserves_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, pool) = test_env(dir.path(), 256);
        let tree = new_tree(&volume, &pool);
        let index = TransactionIndex::new(4);
        let txn = index.register();

        let keys: Vec<Vec<u8>> = (0..40u32).map(|i| format!("key{:04}", i).into_bytes()).collect();
        for k in &keys {
            tree.store(&index, &txn, 0, k, b"value").unwrap();
        }

        assert!(tree.generation() > 0, "inserting enough keys must force at least one split");
        index.commit(txn.ts, index.allocator.update());

        let reader_ts = index.allocator.update();
        for k in &keys {
            let got = tree.fetch(&index, reader_ts, 0, k).unwrap();
            assert_eq!(got, Some(b"value".to_vec()), "missing key {:?}", k);
        }
    }

    #[test]
    fn remove_key_range_tombstones_do_not_appear_in_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, pool) = test_env(dir.path(), 1024);
        let tree = new_tree(&volume, &pool);
        let index = TransactionIndex::new(4);
        let txn = index.register();

        for k in [b"a".as_slice(), b"b", b"c", b"d"] {
            tree.store(&index, &txn, 0, k, b"x").unwrap();
        }
        let removed = tree.remove_key_range(&index, &txn, 1, b"b", b"d").unwrap();
        assert_eq!(removed, 2);
        index.commit(txn.ts, index.allocator.update());

        let reader_ts = index.allocator.update();
        assert_eq!(tree.fetch(&index, reader_ts, 0, b"a").unwrap(), Some(b"x".to_vec()));
        assert_eq!(tree.fetch(&index, reader_ts, 1, b"b").unwrap(), None);
        assert_eq!(tree.fetch(&index, reader_ts, 1, b"c").unwrap(), None);
        assert_eq!(tree.fetch(&index, reader_ts, 0, b"d").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn traverse_forward_visits_keys_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, pool) = test_env(dir.path(), 1024);
        let tree = new_tree(&volume, &pool);
        let index = TransactionIndex::new(4);
        let txn = index.register();

        for k in [b"a".as_slice(), b"c", b"e"] {
            tree.store(&index, &txn, 0, k, k).unwrap();
        }
        index.commit(txn.ts, index.allocator.update());
        let reader_ts = index.allocator.update();

        let first = tree.traverse(&index, reader_ts, 0, b"b", Direction::Forward, true).unwrap().unwrap();
        assert_eq!(first.0, b"c");
        let next = tree.traverse(&index, reader_ts, 0, &first.0, Direction::Forward, false).unwrap().unwrap();
        assert_eq!(next.0, b"e");
        assert!(tree.traverse(&index, reader_ts, 0, &next.0, Direction::Forward, false).unwrap().is_none());
    }

    #[test]
    fn traverse_backward_visits_keys_in_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, pool) = test_env(dir.path(), 1024);
        let tree = new_tree(&volume, &pool);
        let index = TransactionIndex::new(4);
        let txn = index.register();

        for k in [b"a".as_slice(), b"c", b"e"] {
            tree.store(&index, &txn, 0, k, k).unwrap();
        }
        index.commit(txn.ts, index.allocator.update());
        let reader_ts = index.allocator.update();

        let last = tree.traverse(&index, reader_ts, 0, b"d", Direction::Backward, true).unwrap().unwrap();
        assert_eq!(last.0, b"c");
        let prev = tree.traverse(&index, reader_ts, 0, &last.0, Direction::Backward, false).unwrap().unwrap();
        assert_eq!(prev.0, b"a");
        assert!(tree.traverse(&index, reader_ts, 0, &prev.0, Direction::Backward, false).unwrap().is_none());
    }

    #[test]
    fn traverse_backward_crosses_a_split_leaf_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, pool) = test_env(dir.path(), 256);
        let tree = new_tree(&volume, &pool);
        let index = TransactionIndex::new(4);
        let txn = index.register();

        let keys: Vec<Vec<u8>> = (0..40u32).map(|i| format!("key{:04}", i).into_bytes()).collect();
        for k in &keys {
            tree.store(&index, &txn, 0, k, b"v").unwrap();
        }
        assert!(tree.generation() > 0);
        index.commit(txn.ts, index.allocator.update());

        let reader_ts = index.allocator.update();
        let last_key = keys.last().unwrap();
        let mut seen = Vec::new();
        let mut cursor = last_key.clone();
        let mut inclusive = true;
        loop {
            match tree.traverse(&index, reader_ts, 0, &cursor, Direction::Backward, inclusive).unwrap() {
                Some((k, _)) => {
                    seen.push(k.clone());
                    cursor = k;
                    inclusive = false;
                }
                None => break,
            }
        }
        seen.reverse();
        assert_eq!(seen, keys);
    }

    #[test]
    fn ww_dependency_blocks_a_conflicting_writer() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, pool) = test_env(dir.path(), 1024);
        let tree = new_tree(&volume, &pool).with_ww_timeout(Duration::from_millis(30));
        let index = Arc::new(TransactionIndex::new(4));
        let writer = index.register();
        tree.store(&index, &writer, 0, b"k", b"first").unwrap();

        let other = index.register();
        let err = tree.store(&index, &other, 0, b"k", b"second").unwrap_err();
        assert!(matches!(err, EngineError::InUse { .. }));
    }

    #[test]
    fn prune_page_drops_a_shadowed_older_version() {
        let dir = tempfile::tempdir().unwrap();
        let (volume, pool) = test_env(dir.path(), 1024);
        let tree = new_tree(&volume, &pool);
        let index = TransactionIndex::new(4);

        let first = index.register();
        tree.store(&index, &first, 0, b"k", b"v1").unwrap();
        index.commit(first.ts, index.allocator.update());

        let second = index.register();
        tree.store(&index, &second, 0, b"k", b"v2").unwrap();
        index.commit(second.ts, index.allocator.update());

        let floor = index.allocator.update();
        let pages = tree.leaf_pages().unwrap();
        assert_eq!(pages.len(), 1);

        let removed = tree.prune_page(&index, pages[0], floor, index.allocator.update()).unwrap();
        assert_eq!(removed, 1);

        let reader_ts = index.allocator.update();
        assert_eq!(tree.fetch(&index, reader_ts, 0, b"k").unwrap(), Some(b"v2".to_vec()));
    }
}
