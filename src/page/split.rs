//! Split policies (spec §4.D): how a full page's content is partitioned
//! between itself and a freshly allocated right sibling.

use crate::volume::PageId;
use super::Page;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
    /// Keeps the right page mostly full — good for monotonically
    /// decreasing insertion patterns.
    LeftBias,
    /// Keeps the left page mostly full — good for monotonically
    /// increasing insertion patterns (append-mostly workloads).
    RightBias,
    /// Balances utilization roughly 50/50 by content bytes.
    EvenBias,
    /// Like `EvenBias`, but leaves a small skew towards the left so a
    /// single-key right page (the degenerate case of a pure ascending
    /// sequence) doesn't recur on every subsequent insert.
    NiceBias,
    /// Packs as many whole entries as possible into the left page before
    /// moving the remainder right.
    PackBias,
}

fn fraction(policy: SplitPolicy) -> f64 {
    match policy {
        SplitPolicy::LeftBias => 0.1,
        SplitPolicy::RightBias => 0.9,
        SplitPolicy::EvenBias => 0.5,
        SplitPolicy::NiceBias => 0.55,
        SplitPolicy::PackBias => 0.95,
    }
}

fn choose_split_index(page: &Page, count: usize, policy: SplitPolicy) -> usize {
    if count <= 1 {
        return count;
    }
    let total: usize = (0..count).map(|i| page.entry_total_size(i)).sum();
    let target = (total as f64 * fraction(policy)) as usize;

    let mut acc = 0;
    for i in 0..count {
        acc += page.entry_total_size(i);
        if acc >= target {
            // Always leave at least one entry on each side.
            return (i + 1).clamp(1, count - 1);
        }
    }
    count - 1
}

/// Split `page` in place per `policy`, returning the new right-sibling
/// page. `right_page_id` is the address the caller already allocated for
/// it, used only to wire up `page`'s right-sibling pointer.
pub fn split(page: &mut Page, right_page_id: PageId, policy: SplitPolicy) -> Page {
    let old_right_sibling = page.right_sibling();
    let page_size = page.page_size();
    let count = page.key_block_count();
    let split_index = choose_split_index(page, count, policy);
    let is_leaf = page.is_leaf();

    let mut right = Page::new(page_size, page.page_type(), page.level());
    for i in split_index..count {
        let key = page.reconstruct_key(i);
        if is_leaf {
            let value = page.value_bytes(i).to_vec();
            right.insert_leaf(&key, &value);
        } else {
            let child = page.child_page_id(i);
            right.insert_internal(&key, child);
        }
    }
    right.set_right_sibling(old_right_sibling);

    page.remove_key_range(split_index, count);
    page.compact();
    page.set_right_sibling(right_page_id);

    right
}
