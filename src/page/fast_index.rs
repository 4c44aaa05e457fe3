//! 4.E Fast Index: a per-page cache mapping each key block to its fully
//! reconstructed key, so binary search doesn't re-walk the ebc chain for
//! every comparison. Invalidated on any structural mutation to the page
//! and lazily recomputed on the next search.

use super::{FoundAt, Page};

pub struct FastIndex {
    keys: Vec<Vec<u8>>,
}

impl FastIndex {
    pub fn recompute(page: &Page) -> Self {
        let count = page.key_block_count();
        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            keys.push(page.reconstruct_key(i));
        }
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Binary search the cached keys for `key`. `index` is either the
    /// position of an exact match, or the insertion point that keeps the
    /// page's keys in order.
    pub fn search(&self, key: &[u8]) -> FoundAt {
        match self.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(index) => FoundAt { index, exact: true },
            Err(index) => FoundAt { index, exact: false },
        }
    }
}
