//! Forward iterator over the B+tree leaf chain.

use super::page::LeafPageView;
use super::types::{IndexKey, IndexValue};
use crate::pager::{Pager, ReadPageGuard};
use std::marker::PhantomData;
use strata_common::page::PageId;
use tracing::warn;

/// Forward scan yielding `(key, value)` pairs in comparator order.
///
/// Holds a read guard only while resident on a leaf; moving to the next
/// leaf releases the old guard before acquiring the next one. There is no
/// consistency guarantee against concurrent writers beyond per-page
/// read-latch atomicity.
pub struct TreeIterator<'a, K: IndexKey, V: IndexValue> {
    pager: &'a Pager,
    guard: Option<ReadPageGuard<'a>>,
    slot: usize,
    _marker: PhantomData<(K, V)>,
}

impl<'a, K: IndexKey, V: IndexValue> TreeIterator<'a, K, V> {
    /// An iterator positioned at `slot` of the latched leaf.
    pub(crate) fn new(pager: &'a Pager, guard: ReadPageGuard<'a>, slot: usize) -> Self {
        Self {
            pager,
            guard: Some(guard),
            slot,
            _marker: PhantomData,
        }
    }

    /// The exhausted iterator.
    pub(crate) fn end(pager: &'a Pager) -> Self {
        Self {
            pager,
            guard: None,
            slot: 0,
            _marker: PhantomData,
        }
    }

    /// Moves residence to the next leaf in the chain, releasing the current
    /// guard first. Ends the scan if the chain is exhausted or the fetch
    /// fails.
    fn advance_leaf(&mut self, next: PageId) {
        self.guard = None;
        self.slot = 0;
        if !next.is_valid() {
            return;
        }
        match self.pager.fetch_read(next) {
            Ok(guard) => self.guard = Some(guard),
            Err(e) => {
                warn!(page_id = %next, error = %e, "leaf scan aborted");
            }
        }
    }
}

impl<K: IndexKey, V: IndexValue> Iterator for TreeIterator<'_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            let guard = self.guard.as_ref()?;
            let leaf = LeafPageView::<K, V>::new(guard.data());
            let size = leaf.size() as usize;

            if self.slot >= size {
                // A concurrent remove can shrink the leaf under our slot.
                let next = leaf.next_page_id();
                self.advance_leaf(next);
                continue;
            }

            let item = (leaf.key_at(self.slot), leaf.value_at(self.slot));
            if self.slot + 1 < size {
                self.slot += 1;
            } else {
                let next = leaf.next_page_id();
                self.advance_leaf(next);
            }
            return Some(item);
        }
    }
}
