//! 4.D Page (B+-tree node): a fixed-size image growing inward from two
//! ends — fixed-size key blocks from the low end, variable-length tail
//! blocks from the high end.
//!
//! The donor's `BTreeLeafPage`/`BTreeInternalPage` (btree/page.rs) use
//! fixed-width tuple slots with a bitmap header, which has no notion of
//! prefix compression or a variable tail region. This module keeps the
//! donor's split between a leaf shape and an internal shape (distinct
//! accessors, a `right_sibling` pointer, slot-oriented iteration) but
//! replaces the fixed-slot body with the two-ended, ebc-compressed layout
//! the engine's key ordering guarantee requires.

pub mod fast_index;
pub mod longrec;
pub mod split;

use crate::codec::{ByteReader, ByteWriter, Decodeable, Encodeable};
use crate::error::{EngineError, EngineResult};
use crate::volume::PageId;
use fast_index::FastIndex;

pub const HEADER_SIZE: usize = 16;
pub const KEY_BLOCK_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Head,
    Leaf,
    Internal,
    Garbage,
    LongRecord,
}

impl PageType {
    fn tag(self) -> u8 {
        match self {
            PageType::Head => 0,
            PageType::Leaf => 1,
            PageType::Internal => 2,
            PageType::Garbage => 3,
            PageType::LongRecord => 4,
        }
    }

    fn from_tag(tag: u8) -> EngineResult<Self> {
        Ok(match tag {
            0 => PageType::Head,
            1 => PageType::Leaf,
            2 => PageType::Internal,
            3 => PageType::Garbage,
            4 => PageType::LongRecord,
            other => return Err(EngineError::CorruptVolume(format!("bad page type tag {}", other))),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct PageHeader {
    page_type: PageType,
    level: u8,
    key_block_end: u16,
    alloc: u16,
    right_sibling: PageId,
}

impl PageHeader {
    fn empty(page_type: PageType, level: u8, page_size: usize) -> Self {
        Self {
            page_type,
            level,
            key_block_end: HEADER_SIZE as u16,
            alloc: page_size as u16,
            right_sibling: 0,
        }
    }

    fn read(bytes: &[u8]) -> EngineResult<Self> {
        let mut reader = ByteReader::new(&bytes[..HEADER_SIZE]);
        let page_type = PageType::from_tag(reader.read::<u8>()?)?;
        let level = reader.read::<u8>()?;
        let key_block_end = reader.read::<u16>()?;
        let alloc = reader.read::<u16>()?;
        let right_sibling = reader.read::<u64>()?;
        Ok(Self {
            page_type,
            level,
            key_block_end,
            alloc,
            right_sibling,
        })
    }

    fn write(&self, bytes: &mut [u8]) {
        let mut w = ByteWriter::with_capacity(HEADER_SIZE);
        w.write(&self.page_type.tag());
        w.write(&self.level);
        w.write(&self.key_block_end);
        w.write(&self.alloc);
        w.write(&self.right_sibling);
        bytes[..HEADER_SIZE].copy_from_slice(&w.to_padded_bytes(HEADER_SIZE));
    }
}

/// Fixed-size descriptor for one key. `ebc` bytes of the key are shared
/// with the previous key block (elided here, recovered from the left
/// neighbour on reconstruction); the remaining `key_len` bytes and the
/// block's own payload live in the tail block at `tail_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBlock {
    pub ebc: u16,
    pub key_len: u16,
    pub tail_len: u16,
    pub tail_offset: u16,
}

impl KeyBlock {
    fn read(bytes: &[u8]) -> EngineResult<Self> {
        let mut reader = ByteReader::new(bytes);
        Ok(Self {
            ebc: reader.read()?,
            key_len: reader.read()?,
            tail_len: reader.read()?,
            tail_offset: reader.read()?,
        })
    }

    fn write(&self, bytes: &mut [u8]) {
        let mut w = ByteWriter::with_capacity(KEY_BLOCK_SIZE);
        w.write(&self.ebc);
        w.write(&self.key_len);
        w.write(&self.tail_len);
        w.write(&self.tail_offset);
        bytes[..KEY_BLOCK_SIZE].copy_from_slice(&w.into_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundAt {
    pub index: usize,
    pub exact: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    NeedsSplit,
}

/// A single B+-tree page image. Owns a `page_size`-byte buffer; callers
/// round-trip it through the buffer pool's frame bytes.
pub struct Page {
    bytes: Vec<u8>,
    page_size: usize,
    fast_index: Option<FastIndex>,
}

impl Page {
    pub fn new(page_size: usize, page_type: PageType, level: u8) -> Self {
        let mut bytes = vec![0u8; page_size];
        PageHeader::empty(page_type, level, page_size).write(&mut bytes);
        Self {
            bytes,
            page_size,
            fast_index: None,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> EngineResult<Self> {
        let page_size = bytes.len();
        PageHeader::read(&bytes)?; // validate
        Ok(Self {
            bytes,
            page_size,
            fast_index: None,
        })
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn header(&self) -> PageHeader {
        PageHeader::read(&self.bytes).expect("page header validated at construction")
    }

    fn set_header(&mut self, header: &PageHeader) {
        header.write(&mut self.bytes);
    }

    pub fn page_type(&self) -> PageType {
        self.header().page_type
    }

    pub fn level(&self) -> u8 {
        self.header().level
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0 && self.page_type() == PageType::Leaf
    }

    pub fn right_sibling(&self) -> PageId {
        self.header().right_sibling
    }

    pub fn set_right_sibling(&mut self, pid: PageId) {
        let mut header = self.header();
        header.right_sibling = pid;
        self.set_header(&header);
    }

    pub fn key_block_count(&self) -> usize {
        (self.header().key_block_end as usize - HEADER_SIZE) / KEY_BLOCK_SIZE
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total bytes (fixed key block plus its tail) occupied by entry
    /// `index`; used by split-point selection.
    pub(crate) fn entry_total_size(&self, index: usize) -> usize {
        KEY_BLOCK_SIZE + self.key_block(index).tail_len as usize
    }

    fn key_block(&self, index: usize) -> KeyBlock {
        let start = HEADER_SIZE + index * KEY_BLOCK_SIZE;
        KeyBlock::read(&self.bytes[start..start + KEY_BLOCK_SIZE]).expect("key block in bounds")
    }

    fn set_key_block(&mut self, index: usize, block: &KeyBlock) {
        let start = HEADER_SIZE + index * KEY_BLOCK_SIZE;
        block.write(&mut self.bytes[start..start + KEY_BLOCK_SIZE]);
    }

    fn tail_bytes(&self, block: &KeyBlock) -> &[u8] {
        let start = block.tail_offset as usize;
        &self.bytes[start..start + block.tail_len as usize]
    }

    /// Free bytes available for one more key block plus its tail.
    pub fn free_space(&self) -> usize {
        let header = self.header();
        (header.alloc as usize).saturating_sub(header.key_block_end as usize + KEY_BLOCK_SIZE)
    }

    /// Reconstruct the full key at `index` by prefixing the previous
    /// key's bytes up to `ebc`.
    pub fn reconstruct_key(&self, index: usize) -> Vec<u8> {
        if index == 0 {
            let block = self.key_block(0);
            return self.tail_bytes(&block)[..block.key_len as usize].to_vec();
        }
        let prev = self.reconstruct_key(index - 1);
        let block = self.key_block(index);
        let mut key = prev[..block.ebc as usize].to_vec();
        key.extend_from_slice(&self.tail_bytes(&block)[..block.key_len as usize]);
        key
    }

    fn invalidate_fast_index(&mut self) {
        self.fast_index = None;
    }

    fn ensure_fast_index(&mut self) {
        if self.fast_index.is_none() {
            self.fast_index = Some(FastIndex::recompute(self));
        }
    }

    /// Binary search for `key` using the cached reconstructed keys
    /// (spec §4.E) so a split/rebalance doesn't force an O(n) re-walk of
    /// the ebc chain per comparison.
    pub fn search(&mut self, key: &[u8]) -> FoundAt {
        self.ensure_fast_index();
        self.fast_index.as_ref().unwrap().search(key)
    }

    pub fn value_bytes(&self, index: usize) -> &[u8] {
        let block = self.key_block(index);
        &self.tail_bytes(&block)[block.key_len as usize..]
    }

    pub fn child_page_id(&self, index: usize) -> PageId {
        let bytes = self.value_bytes(index);
        u64::from_be_bytes(bytes[..8].try_into().expect("internal tail holds an 8-byte child pointer"))
    }

    fn insert_tail(&mut self, index: usize, key: &[u8], payload: &[u8]) -> InsertOutcome {
        let header = self.header();
        let ebc = if index == 0 {
            0
        } else {
            let left = self.reconstruct_key(index - 1);
            common_prefix_len(&left, key)
        };
        let key_rest = key[ebc..].to_vec();
        let tail_len = key_rest.len() + payload.len();

        // The successor's ebc was computed against its old left
        // neighbour; once this insert lands, its predecessor becomes the
        // new key, so its remainder must be recompressed. Compute the
        // new tail up front (rather than after the shift) since the old
        // predecessor is about to be overwritten.
        let rebase = if index < self.key_block_count() {
            let next_full_key = self.reconstruct_key(index);
            let old_block = self.key_block(index);
            let new_ebc = common_prefix_len(&key, &next_full_key);
            if new_ebc != old_block.ebc as usize {
                let value = self.tail_bytes(&old_block)[old_block.key_len as usize..].to_vec();
                let new_key_rest = next_full_key[new_ebc..].to_vec();
                Some((new_ebc, new_key_rest, value))
            } else {
                None
            }
        } else {
            None
        };
        let rebase_tail_len = rebase.as_ref().map_or(0, |(_, k, v)| k.len() + v.len());

        let needed = KEY_BLOCK_SIZE + tail_len + rebase_tail_len;
        if needed > self.free_space() {
            return InsertOutcome::NeedsSplit;
        }

        let mut alloc = header.alloc as usize;
        alloc -= tail_len;
        let new_alloc = alloc;
        self.bytes[new_alloc..new_alloc + key_rest.len()].copy_from_slice(&key_rest);
        self.bytes[new_alloc + key_rest.len()..new_alloc + tail_len].copy_from_slice(payload);

        let block_start = HEADER_SIZE + index * KEY_BLOCK_SIZE;
        let new_key_block_end = header.key_block_end as usize + KEY_BLOCK_SIZE;
        self.bytes
            .copy_within(block_start..header.key_block_end as usize, block_start + KEY_BLOCK_SIZE);

        self.set_key_block(
            index,
            &KeyBlock {
                ebc: ebc as u16,
                key_len: key_rest.len() as u16,
                tail_len: tail_len as u16,
                tail_offset: new_alloc as u16,
            },
        );

        let mut header = header;
        header.key_block_end = new_key_block_end as u16;

        if let Some((new_ebc, new_key_rest, value)) = rebase {
            alloc -= new_key_rest.len() + value.len();
            self.bytes[alloc..alloc + new_key_rest.len()].copy_from_slice(&new_key_rest);
            self.bytes[alloc + new_key_rest.len()..alloc + new_key_rest.len() + value.len()]
                .copy_from_slice(&value);
            header.alloc = alloc as u16;
            self.set_header(&header);
            self.set_key_block(
                index + 1,
                &KeyBlock {
                    ebc: new_ebc as u16,
                    key_len: new_key_rest.len() as u16,
                    tail_len: (new_key_rest.len() + value.len()) as u16,
                    tail_offset: alloc as u16,
                },
            );
        } else {
            header.alloc = alloc as u16;
            self.set_header(&header);
        }

        self.invalidate_fast_index();
        InsertOutcome::Inserted
    }

    pub fn insert_leaf(&mut self, key: &[u8], value: &[u8]) -> InsertOutcome {
        let found = self.search(key);
        self.insert_tail(found.index, key, value)
    }

    pub fn insert_internal(&mut self, key: &[u8], child: PageId) -> InsertOutcome {
        let found = self.search(key);
        self.insert_tail(found.index, key, &child.to_be_bytes())
    }

    /// Delete key blocks in `[from, to)`, shifting later blocks left. Does
    /// not reclaim the freed tail bytes; `compact()` does that.
    pub fn remove_key_range(&mut self, from: usize, to: usize) -> usize {
        let count = self.key_block_count();
        if from >= to || from >= count {
            return 0;
        }
        let to = to.min(count);
        let removed = to - from;

        // The block surviving at `from` keeps its old remainder, which
        // was compressed against a predecessor that is about to
        // disappear; capture its full key now, before the shift, so it
        // can be recompressed against its new predecessor afterwards.
        let survivor_full_key = if to < count { Some(self.reconstruct_key(to)) } else { None };

        let header = self.header();
        let tail_start = HEADER_SIZE + to * KEY_BLOCK_SIZE;
        let tail_end = header.key_block_end as usize;
        let dest = HEADER_SIZE + from * KEY_BLOCK_SIZE;
        self.bytes.copy_within(tail_start..tail_end, dest);

        let mut header = header;
        header.key_block_end -= (removed * KEY_BLOCK_SIZE) as u16;
        self.set_header(&header);

        if let Some(full_key) = survivor_full_key {
            let new_left_key = if from == 0 { Vec::new() } else { self.reconstruct_key(from - 1) };
            self.recompress_at(from, &full_key, &new_left_key);
        }
        self.invalidate_fast_index();
        removed
    }

    /// Rewrite the tail block at `index` (whose full key is already
    /// known) compressed against `new_left_key`, appending the new
    /// remainder at the current high-water mark. The old tail bytes
    /// become slack, reclaimed by the next `compact()`.
    fn recompress_at(&mut self, index: usize, full_key: &[u8], new_left_key: &[u8]) {
        let old_block = self.key_block(index);
        let new_ebc = common_prefix_len(new_left_key, full_key);
        if new_ebc == old_block.ebc as usize {
            return;
        }
        let value = self.tail_bytes(&old_block)[old_block.key_len as usize..].to_vec();
        let key_rest = full_key[new_ebc..].to_vec();
        let new_tail_len = key_rest.len() + value.len();

        let header = self.header();
        let new_alloc = (header.alloc as usize).saturating_sub(new_tail_len);
        self.bytes[new_alloc..new_alloc + key_rest.len()].copy_from_slice(&key_rest);
        self.bytes[new_alloc + key_rest.len()..new_alloc + new_tail_len].copy_from_slice(&value);

        self.set_key_block(
            index,
            &KeyBlock {
                ebc: new_ebc as u16,
                key_len: key_rest.len() as u16,
                tail_len: new_tail_len as u16,
                tail_offset: new_alloc as u16,
            },
        );
        let mut header = header;
        header.alloc = new_alloc as u16;
        self.set_header(&header);
    }

    /// Reclaim slack between the key-block region and the tail region by
    /// repacking tail blocks contiguously from the high end, in key
    /// order. Must be followed by `invalidate()` of any fast index held
    /// elsewhere (spec §4.E) — this method owns and invalidates its own.
    pub fn compact(&mut self) {
        let count = self.key_block_count();
        let page_size = self.page_size;
        let mut new_bytes = vec![0u8; page_size];
        new_bytes[..HEADER_SIZE].copy_from_slice(&self.bytes[..HEADER_SIZE]);

        let mut alloc = page_size;
        for i in 0..count {
            let block = self.key_block(i);
            let tail = self.tail_bytes(&block).to_vec();
            alloc -= tail.len();
            new_bytes[alloc..alloc + tail.len()].copy_from_slice(&tail);
            let mut moved = block;
            moved.tail_offset = alloc as u16;
            let start = HEADER_SIZE + i * KEY_BLOCK_SIZE;
            moved.write(&mut new_bytes[start..start + KEY_BLOCK_SIZE]);
        }

        let mut header = self.header();
        header.alloc = alloc as u16;
        header.write(&mut new_bytes);
        self.bytes = new_bytes;
        self.invalidate_fast_index();
    }

    /// Confirm key ordering, ebc correctness, and tail bounds (spec §4.D).
    pub fn verify(&mut self) -> EngineResult<()> {
        let count = self.key_block_count();
        let header = self.header();
        let mut prev: Option<Vec<u8>> = None;
        for i in 0..count {
            let block = self.key_block(i);
            if block.tail_offset < header.key_block_end || (block.tail_offset as usize) + (block.tail_len as usize) > self.page_size {
                return Err(EngineError::CorruptVolume(format!(
                    "page tail block {} out of bounds (offset {}, len {})",
                    i, block.tail_offset, block.tail_len
                )));
            }
            let key = self.reconstruct_key(i);
            if let Some(prev_key) = &prev {
                if key <= *prev_key {
                    return Err(EngineError::CorruptVolume(format!(
                        "page key block {} out of order",
                        i
                    )));
                }
                let expected_ebc = common_prefix_len(prev_key, &key);
                if (block.ebc as usize) > expected_ebc {
                    return Err(EngineError::CorruptVolume(format!(
                        "page key block {} has ebc {} exceeding true common prefix {}",
                        i, block.ebc, expected_ebc
                    )));
                }
            }
            prev = Some(key);
        }
        self.ensure_fast_index();
        if self.fast_index.as_ref().unwrap().len() != count {
            return Err(EngineError::CorruptVolume("fast index out of sync with key blocks".to_string()));
        }
        Ok(())
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_search_leaf_round_trips_values() {
        let mut page = Page::new(512, PageType::Leaf, 0);
        page.insert_leaf(b"apple", b"v1");
        page.insert_leaf(b"banana", b"v2");
        page.insert_leaf(b"cherry", b"v3");

        assert_eq!(page.key_block_count(), 3);
        assert_eq!(page.reconstruct_key(0), b"apple");
        assert_eq!(page.reconstruct_key(1), b"banana");
        assert_eq!(page.reconstruct_key(2), b"cherry");

        let found = page.search(b"banana");
        assert!(found.exact);
        assert_eq!(page.value_bytes(found.index), b"v2");
    }

    #[test]
    fn ebc_compresses_shared_prefix() {
        let mut page = Page::new(512, PageType::Leaf, 0);
        page.insert_leaf(b"apple1", b"v1");
        page.insert_leaf(b"apple2", b"v2");
        let block = page.key_block(1);
        assert_eq!(block.ebc, 5);
        assert_eq!(block.key_len, 1);
    }

    #[test]
    fn search_on_missing_key_reports_insertion_point() {
        let mut page = Page::new(512, PageType::Leaf, 0);
        page.insert_leaf(b"a", b"1");
        page.insert_leaf(b"c", b"3");
        let found = page.search(b"b");
        assert!(!found.exact);
        assert_eq!(found.index, 1);
    }

    #[test]
    fn internal_page_stores_child_pointers() {
        let mut page = Page::new(512, PageType::Internal, 1);
        page.insert_internal(b"m", 42);
        let found = page.search(b"m");
        assert!(found.exact);
        assert_eq!(page.child_page_id(found.index), 42);
    }

    #[test]
    fn remove_key_range_drops_entries_and_keeps_order_valid() {
        let mut page = Page::new(512, PageType::Leaf, 0);
        for k in [b"a", b"b", b"c", b"d"] {
            page.insert_leaf(k, b"x");
        }
        page.remove_key_range(1, 3);
        assert_eq!(page.key_block_count(), 2);
        assert_eq!(page.reconstruct_key(0), b"a");
        assert_eq!(page.reconstruct_key(1), b"d");
        page.verify().unwrap();
    }

    #[test]
    fn verify_detects_out_of_order_keys() {
        let mut page = Page::new(512, PageType::Leaf, 0);
        page.insert_leaf(b"a", b"1");
        page.insert_leaf(b"b", b"2");
        // Corrupt by swapping the two key blocks' tail offsets/content.
        let b0 = page.key_block(0);
        let b1 = page.key_block(1);
        page.set_key_block(0, &b1);
        page.set_key_block(1, &b0);
        assert!(page.verify().is_err());
    }

    #[test]
    fn compact_preserves_logical_contents() {
        let mut page = Page::new(512, PageType::Leaf, 0);
        page.insert_leaf(b"a", b"1");
        page.insert_leaf(b"b", b"2");
        page.remove_key_range(0, 1);
        let before_free = page.free_space();
        page.compact();
        assert!(page.free_space() >= before_free);
        assert_eq!(page.reconstruct_key(0), b"b");
        page.verify().unwrap();
    }

    #[test]
    fn right_sibling_round_trips() {
        let mut page = Page::new(512, PageType::Leaf, 0);
        page.set_right_sibling(99);
        assert_eq!(page.right_sibling(), 99);
    }
}
