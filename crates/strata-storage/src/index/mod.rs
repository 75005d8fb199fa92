//! B+tree index.
//!
//! A disk-backed, concurrent B+tree mapping fixed-width comparable keys to
//! fixed-width values (typically record identifiers). All tree state lives
//! in buffer pool pages; the only mutable out-of-page state is the id of a
//! header page holding the root pointer.
//!
//! Concurrency follows the latch-crabbing protocol: a descent acquires the
//! child's latch before deciding whether its ancestors can be released, and
//! releases them the moment the child is proved safe for the operation.
//! Structural changes (split, merge, borrow, root mutation) propagate only
//! through ancestors whose latches were retained because safety could not
//! be proved.

mod context;
mod iterator;
mod page;
mod tree;
mod types;

pub use iterator::TreeIterator;
pub use page::{
    internal_capacity, leaf_capacity, BTreePageView, HeaderPageMut, HeaderPageView,
    InternalPageMut, InternalPageView, LeafPageMut, LeafPageView,
};
pub use tree::BPlusTree;
pub use types::{natural_order, IndexKey, IndexValue, KeyComparator, RecordId};
