//! Storage engine for StrataDB.
//!
//! This crate provides:
//! - Disk manager for page-level file I/O
//! - Pager composing the buffer pool with the disk manager, handing out
//!   RAII page guards with shared/exclusive latches
//! - B+ tree index implementation with latch-crabbing concurrency

mod disk;
mod index;
mod pager;

pub use disk::{DiskManager, DiskManagerConfig};
pub use index::{
    internal_capacity, leaf_capacity, natural_order, BPlusTree, BTreePageView, HeaderPageMut,
    HeaderPageView, IndexKey, IndexValue, InternalPageMut, InternalPageView, KeyComparator,
    LeafPageMut, LeafPageView, RecordId, TreeIterator,
};
pub use pager::{BasicPageGuard, Pager, ReadPageGuard, WritePageGuard};
