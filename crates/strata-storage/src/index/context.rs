//! Per-operation descent state for the B+tree.

use crate::pager::{ReadPageGuard, WritePageGuard};
use std::collections::VecDeque;
use strata_common::page::PageId;

/// State carried through one tree operation.
///
/// Writers hold the header guard while the root may still mutate, plus a
/// root-to-leaf chain of write guards in `write_set`; readers use
/// `read_set`. Dropping the context releases everything still held in LIFO
/// order: leaf first, then ancestors, then the header.
pub struct Context<'a> {
    /// Write guard on the header page, held only while the root may change.
    pub header: Option<WritePageGuard<'a>>,
    /// Root id observed after the header latch was taken.
    pub root_page_id: PageId,
    /// Root-to-leaf read guards (search only).
    pub read_set: VecDeque<ReadPageGuard<'a>>,
    /// Root-to-leaf write guards (insert/remove).
    pub write_set: VecDeque<WritePageGuard<'a>>,
}

impl<'a> Context<'a> {
    pub fn new() -> Self {
        Self {
            header: None,
            root_page_id: PageId::INVALID,
            read_set: VecDeque::new(),
            write_set: VecDeque::new(),
        }
    }

    /// Returns true if `page_id` is the root this operation captured.
    pub fn is_root_page(&self, page_id: PageId) -> bool {
        page_id == self.root_page_id
    }

    /// Releases every write guard except the tail, and the header guard.
    ///
    /// Called when the newly latched child is safe: no structural change can
    /// propagate above it, so its ancestors no longer need to be held.
    pub fn release_ancestors(&mut self) {
        while self.write_set.len() > 1 {
            self.write_set.pop_front();
        }
        self.header = None;
    }

    /// Returns the write guard at the back of the write set (the current
    /// descent tail; the leaf once descent completes).
    pub fn back_write_mut(&mut self) -> &mut WritePageGuard<'a> {
        self.write_set
            .back_mut()
            .expect("descent holds at least one write guard")
    }
}

impl Default for Context<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        // LIFO: leaf first, then ancestors, then the header.
        while self.write_set.pop_back().is_some() {}
        while self.read_set.pop_back().is_some() {}
        self.header = None;
    }
}
