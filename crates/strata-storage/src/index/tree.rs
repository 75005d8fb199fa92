//! Concurrent disk-backed B+tree index.
//!
//! The tree keeps no state outside buffer pool pages except its parameters
//! and the id of a single header page holding the root pointer. All
//! serialization is per-page latches plus the header latch; writers descend
//! with latch crabbing, releasing every ancestor as soon as the newly
//! latched child is proved safe for the operation.

use super::context::Context;
use super::iterator::TreeIterator;
use super::page::{
    internal_capacity, leaf_capacity, BTreePageView, HeaderPageMut, HeaderPageView,
    InternalPageMut, InternalPageView, LeafPageMut, LeafPageView,
};
use super::types::{IndexKey, IndexValue, KeyComparator};
use crate::pager::Pager;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;
use strata_common::page::PageId;
use strata_common::{Result, StrataError};
use tracing::debug;

/// The operation a descent is performed for; decides page safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Search,
    Insert,
    Remove,
}

/// A disk-backed B+tree mapping fixed-width keys to fixed-width values.
///
/// Keys are unique. Ordering comes from the supplied comparator, an opaque
/// strict total order.
pub struct BPlusTree<K: IndexKey, V: IndexValue> {
    index_name: String,
    header_page_id: PageId,
    pager: Arc<Pager>,
    comparator: KeyComparator<K>,
    leaf_max_size: u32,
    internal_max_size: u32,
    _marker: PhantomData<V>,
}

impl<K: IndexKey, V: IndexValue> BPlusTree<K, V> {
    /// Creates a tree over the given header page and initializes it empty.
    ///
    /// Both fan-outs must be at least 3 so the split/merge arithmetic holds,
    /// and must fit the page size for the chosen key/value encodings.
    pub fn new(
        index_name: impl Into<String>,
        header_page_id: PageId,
        pager: Arc<Pager>,
        comparator: KeyComparator<K>,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        if leaf_max_size < 3 || (leaf_max_size as usize) > leaf_capacity::<K, V>() {
            return Err(StrataError::InvalidParameter {
                name: "leaf_max_size".to_string(),
                value: leaf_max_size.to_string(),
            });
        }
        if internal_max_size < 3 || (internal_max_size as usize) > internal_capacity::<K>() {
            return Err(StrataError::InvalidParameter {
                name: "internal_max_size".to_string(),
                value: internal_max_size.to_string(),
            });
        }

        let tree = Self {
            index_name: index_name.into(),
            header_page_id,
            pager,
            comparator,
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        };

        let mut guard = tree.pager.fetch_write(header_page_id)?;
        HeaderPageMut::new(guard.data_mut()).set_root_page_id(PageId::INVALID);
        drop(guard);

        Ok(tree)
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.index_name
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        let guard = self.pager.fetch_read(self.header_page_id)?;
        Ok(!HeaderPageView::new(guard.data()).root_page_id().is_valid())
    }

    /// Returns the current root page id (`PageId::INVALID` when empty).
    pub fn root_page_id(&self) -> Result<PageId> {
        let guard = self.pager.fetch_read(self.header_page_id)?;
        Ok(HeaderPageView::new(guard.data()).root_page_id())
    }

    /// Compares two keys through the injected comparator.
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.comparator.as_ref())(a, b)
    }

    /// A page is safe for an operation when the operation cannot overflow
    /// (insert) or underflow (remove) it, so ancestors need not stay latched.
    fn is_safe_page(data: &[u8], op: Operation, is_root_page: bool) -> bool {
        let page = BTreePageView::new(data);
        match op {
            Operation::Search => true,
            Operation::Insert => {
                if page.is_leaf() {
                    page.size() + 1 < page.max_size()
                } else {
                    page.size() < page.max_size()
                }
            }
            Operation::Remove => {
                if is_root_page {
                    if page.is_leaf() {
                        page.size() > 1
                    } else {
                        page.size() > 2
                    }
                } else {
                    page.size() > page.min_size()
                }
            }
        }
    }

    /// Latch-crabbing descent from the guard already at the back of the
    /// context's set to the leaf covering `key`.
    ///
    /// Writers release all held ancestors (and the header) each time the
    /// newly latched child proves safe. Readers keep a tail-only read set.
    fn find_leaf<'p>(&'p self, ctx: &mut Context<'p>, key: &K, op: Operation) -> Result<()> {
        let pager = self.pager.as_ref();

        if op == Operation::Search {
            loop {
                let child_id = {
                    let back = ctx.read_set.back().expect("descent holds the tail guard");
                    if BTreePageView::new(back.data()).is_leaf() {
                        return Ok(());
                    }
                    let internal = InternalPageView::<K>::new(back.data());
                    internal.child_at(internal.route(key, &self.comparator))
                };
                let child_guard = pager.fetch_read(child_id)?;
                ctx.read_set.push_back(child_guard);
                // Tail-only: the parent can go as soon as the child is latched.
                while ctx.read_set.len() > 1 {
                    ctx.read_set.pop_front();
                }
            }
        }

        loop {
            let child_id = {
                let back = ctx.write_set.back().expect("descent holds the tail guard");
                if BTreePageView::new(back.data()).is_leaf() {
                    return Ok(());
                }
                let internal = InternalPageView::<K>::new(back.data());
                internal.child_at(internal.route(key, &self.comparator))
            };
            let child_guard = pager.fetch_write(child_id)?;
            let child_safe = Self::is_safe_page(child_guard.data(), op, false);
            ctx.write_set.push_back(child_guard);
            if child_safe {
                ctx.release_ancestors();
            }
        }
    }

    /// Point lookup. Appends the value to `result` and returns true iff the
    /// key exists.
    pub fn get(&self, key: &K, result: &mut Vec<V>) -> Result<bool> {
        let pager = self.pager.as_ref();

        let header_guard = pager.fetch_read(self.header_page_id)?;
        let root_id = HeaderPageView::new(header_guard.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(false);
        }

        let mut ctx = Context::new();
        ctx.root_page_id = root_id;
        ctx.read_set.push_back(pager.fetch_read(root_id)?);
        drop(header_guard);

        self.find_leaf(&mut ctx, key, Operation::Search)?;

        let leaf_guard = ctx.read_set.back().expect("descent ends at a leaf");
        let leaf = LeafPageView::<K, V>::new(leaf_guard.data());
        match leaf.lower_bound(key, &self.comparator) {
            Some(i) if self.compare(&leaf.key_at(i), key) == Ordering::Equal => {
                result.push(leaf.value_at(i));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Unique-key insertion. Returns false iff the key already exists.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        let pager = self.pager.as_ref();

        let mut header_guard = pager.fetch_write(self.header_page_id)?;
        let root_id = HeaderPageView::new(header_guard.data()).root_page_id();

        if !root_id.is_valid() {
            // Start a new tree: a single root leaf with one entry.
            let (mut root_guard, new_root_id) = pager.new_page()?;
            let mut leaf = LeafPageMut::<K, V>::new(root_guard.data_mut());
            leaf.init(self.leaf_max_size);
            leaf.set_size(1);
            leaf.set_at(0, key, value);
            drop(root_guard);
            HeaderPageMut::new(header_guard.data_mut()).set_root_page_id(new_root_id);
            debug!(index = %self.index_name, root = %new_root_id, "started new tree");
            return Ok(true);
        }

        let mut ctx = Context::new();
        ctx.root_page_id = root_id;
        ctx.header = Some(header_guard);
        ctx.write_set.push_back(pager.fetch_write(root_id)?);
        let root_data = ctx.write_set.back().expect("root latched").data();
        if Self::is_safe_page(root_data, Operation::Insert, true) {
            ctx.header = None;
        }

        self.find_leaf(&mut ctx, key, Operation::Insert)?;

        let lookup = {
            let leaf_guard = ctx.write_set.back().expect("descent ends at a leaf");
            let leaf = LeafPageView::<K, V>::new(leaf_guard.data());
            leaf.lower_bound(key, &self.comparator)
                .map(|i| (i, self.compare(&leaf.key_at(i), key) == Ordering::Equal))
        };
        if let Some((_, true)) = lookup {
            return Ok(false);
        }
        let insert_pos = match lookup {
            Some((i, _)) => i + 1,
            None => 0,
        };

        let needs_split = {
            let leaf_guard = ctx.back_write_mut();
            let mut leaf = LeafPageMut::<K, V>::new(leaf_guard.data_mut());
            leaf.increase_size(1);
            let new_size = leaf.size() as usize;
            for i in ((insert_pos + 1)..new_size).rev() {
                let k = leaf.key_at(i - 1);
                let v = leaf.value_at(i - 1);
                leaf.set_at(i, &k, &v);
            }
            leaf.set_at(insert_pos, key, value);
            leaf.size() >= leaf.max_size()
        };
        if !needs_split {
            return Ok(true);
        }

        // Leaf split: the new right sibling takes the upper half; the leaf
        // chain is patched right-first so the new leaf never links to itself.
        let (split_key, new_leaf_id) = {
            let (mut new_guard, new_leaf_id) = pager.new_page()?;
            let leaf_guard = ctx.back_write_mut();
            let mut leaf = LeafPageMut::<K, V>::new(leaf_guard.data_mut());
            let mut new_leaf = LeafPageMut::<K, V>::new(new_guard.data_mut());

            new_leaf.init(self.leaf_max_size);
            let min = leaf.min_size() as usize;
            let size = leaf.size() as usize;
            new_leaf.set_size((size - min) as u32);
            for i in min..size {
                let k = leaf.key_at(i);
                let v = leaf.value_at(i);
                new_leaf.set_at(i - min, &k, &v);
            }
            new_leaf.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(new_leaf_id);
            leaf.set_size(min as u32);

            (new_leaf.key_at(0), new_leaf_id)
        };
        debug!(index = %self.index_name, new_leaf = %new_leaf_id, "leaf split");

        let parent_index = ctx.write_set.len() as isize - 2;
        self.insert_into_parent(&mut ctx, split_key, new_leaf_id, parent_index)?;
        Ok(true)
    }

    /// Links a freshly split-off child into the ancestor at `index` within
    /// the write set, splitting recursively while ancestors overflow.
    ///
    /// `index < 0` means the split propagated past the old root: a new root
    /// is created and published through the still-held header guard.
    fn insert_into_parent<'p>(
        &'p self,
        ctx: &mut Context<'p>,
        key: K,
        new_child_id: PageId,
        index: isize,
    ) -> Result<()> {
        let pager = self.pager.as_ref();

        if index < 0 {
            let (mut root_guard, new_root_id) = pager.new_page()?;
            {
                let mut root = InternalPageMut::<K>::new(root_guard.data_mut());
                root.init(self.internal_max_size);
                root.set_size(2);
                let old_root_id = ctx
                    .write_set
                    .front()
                    .expect("old root still latched")
                    .page_id();
                root.set_child_at(0, old_root_id);
                root.set_key_at(1, &key);
                root.set_child_at(1, new_child_id);
            }
            drop(root_guard);

            let header_guard = ctx
                .header
                .as_mut()
                .expect("header latch is held whenever the root may split");
            HeaderPageMut::new(header_guard.data_mut()).set_root_page_id(new_root_id);
            debug!(index = %self.index_name, root = %new_root_id, "root split, new root installed");
            return Ok(());
        }

        let idx = index as usize;
        let split: Option<(K, PageId)> = {
            let parent_guard = ctx
                .write_set
                .get_mut(idx)
                .expect("ancestor guard retained by descent");

            let (size, max) = {
                let p = InternalPageView::<K>::new(parent_guard.data());
                (p.size() as usize, p.max_size() as usize)
            };

            if size < max {
                let pos = {
                    let p = InternalPageView::<K>::new(parent_guard.data());
                    p.route(&key, &self.comparator) + 1
                };
                let mut p = InternalPageMut::<K>::new(parent_guard.data_mut());
                p.increase_size(1);
                let new_size = p.size() as usize;
                for i in ((pos + 1)..new_size).rev() {
                    let k = p.key_at(i - 1);
                    let c = p.child_at(i - 1);
                    p.set_key_at(i, &k);
                    p.set_child_at(i, c);
                }
                p.set_key_at(pos, &key);
                p.set_child_at(pos, new_child_id);
                None
            } else {
                // Internal split. The logical slot sequence of length
                // max + 1 (the full page plus the new entry at `pos`) is
                // partitioned: the left node keeps min slots, the new right
                // node takes the rest. Slot 0 of the right node carries the
                // key that is pushed up to the grandparent.
                let (mut new_guard, new_page_id) = pager.new_page()?;
                let pos = {
                    let p = InternalPageView::<K>::new(parent_guard.data());
                    p.route(&key, &self.comparator) + 1
                };
                let min = {
                    let p = InternalPageView::<K>::new(parent_guard.data());
                    p.min_size() as usize
                };
                let np_size = max + 1 - min;

                let mut p = InternalPageMut::<K>::new(parent_guard.data_mut());
                let mut np = InternalPageMut::<K>::new(new_guard.data_mut());
                np.init(self.internal_max_size);
                np.set_size(np_size as u32);

                match pos.cmp(&min) {
                    Ordering::Less => {
                        // New entry lands in the left node; the slot at
                        // min-1 is promoted to the right node's slot 0.
                        for i in min..max {
                            let k = p.key_at(i);
                            let c = p.child_at(i);
                            np.set_key_at(i - min + 1, &k);
                            np.set_child_at(i - min + 1, c);
                        }
                        let k = p.key_at(min - 1);
                        let c = p.child_at(min - 1);
                        np.set_key_at(0, &k);
                        np.set_child_at(0, c);
                        for i in ((pos + 1)..min).rev() {
                            let k = p.key_at(i - 1);
                            let c = p.child_at(i - 1);
                            p.set_key_at(i, &k);
                            p.set_child_at(i, c);
                        }
                        p.set_key_at(pos, &key);
                        p.set_child_at(pos, new_child_id);
                    }
                    Ordering::Equal => {
                        // The new entry is itself the separator.
                        for i in min..max {
                            let k = p.key_at(i);
                            let c = p.child_at(i);
                            np.set_key_at(i - min + 1, &k);
                            np.set_child_at(i - min + 1, c);
                        }
                        np.set_key_at(0, &key);
                        np.set_child_at(0, new_child_id);
                    }
                    Ordering::Greater => {
                        // New entry lands inside the right node.
                        for i in min..max {
                            let k = p.key_at(i);
                            let c = p.child_at(i);
                            np.set_key_at(i - min, &k);
                            np.set_child_at(i - min, c);
                        }
                        let pos = pos - min;
                        for i in ((pos + 1)..np_size).rev() {
                            let k = np.key_at(i - 1);
                            let c = np.child_at(i - 1);
                            np.set_key_at(i, &k);
                            np.set_child_at(i, c);
                        }
                        np.set_key_at(pos, &key);
                        np.set_child_at(pos, new_child_id);
                    }
                }

                p.set_size(min as u32);
                Some((np.key_at(0), new_page_id))
            }
        };

        if let Some((push_key, new_page_id)) = split {
            debug!(index = %self.index_name, new_internal = %new_page_id, "internal split");
            self.insert_into_parent(ctx, push_key, new_page_id, index - 1)?;
        }
        Ok(())
    }

    /// Deletes `key`. Silently a no-op if the key is absent or the tree is
    /// empty.
    pub fn remove(&self, key: &K) -> Result<()> {
        let pager = self.pager.as_ref();

        let header_guard = pager.fetch_write(self.header_page_id)?;
        let root_id = HeaderPageView::new(header_guard.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(());
        }

        let mut ctx = Context::new();
        ctx.root_page_id = root_id;
        ctx.header = Some(header_guard);
        ctx.write_set.push_back(pager.fetch_write(root_id)?);
        let root_data = ctx.write_set.back().expect("root latched").data();
        if Self::is_safe_page(root_data, Operation::Remove, true) {
            ctx.header = None;
        }

        self.find_leaf(&mut ctx, key, Operation::Remove)?;

        let mut freed: Vec<PageId> = Vec::new();
        let leaf_page_id = ctx
            .write_set
            .back()
            .expect("descent ends at a leaf")
            .page_id();

        // Delete from the leaf.
        let (new_size, min_size) = {
            let leaf_guard = ctx.back_write_mut();
            let pos = {
                let leaf = LeafPageView::<K, V>::new(leaf_guard.data());
                match leaf.lower_bound(key, &self.comparator) {
                    Some(i) if self.compare(&leaf.key_at(i), key) == Ordering::Equal => i,
                    _ => return Ok(()),
                }
            };
            let mut leaf = LeafPageMut::<K, V>::new(leaf_guard.data_mut());
            let size = leaf.size() as usize;
            for i in (pos + 1)..size {
                let k = leaf.key_at(i);
                let v = leaf.value_at(i);
                leaf.set_at(i - 1, &k, &v);
            }
            leaf.set_size((size - 1) as u32);
            (leaf.size(), leaf.min_size())
        };
        if new_size >= min_size {
            return Ok(());
        }

        // Underflow at the root leaf: an empty tree reverts to the canonical
        // form; otherwise a small root leaf is legal.
        if ctx.is_root_page(leaf_page_id) {
            if new_size == 0 {
                let header_guard = ctx
                    .header
                    .as_mut()
                    .expect("header latch is held whenever the root may collapse");
                HeaderPageMut::new(header_guard.data_mut()).set_root_page_id(PageId::INVALID);
                freed.push(leaf_page_id);
                debug!(index = %self.index_name, "tree emptied, root cleared");
            }
            drop(ctx);
            for id in freed {
                pager.delete_page(id);
            }
            return Ok(());
        }

        // Resolve the underflow against a sibling: prefer the right sibling,
        // else use the left. Returns the parent slot to remove on merge.
        let removed_separator: Option<usize> = {
            let n = ctx.write_set.len();
            debug_assert!(n >= 2, "non-root underflow retains the parent");
            let slices = ctx.write_set.make_contiguous();
            let (front, back) = slices.split_at_mut(n - 1);
            let leaf_guard = &mut back[0];
            let parent_guard = front
                .last_mut()
                .expect("parent guard retained for unsafe leaf");

            let (idx, parent_size) = {
                let parent = InternalPageView::<K>::new(parent_guard.data());
                (
                    parent.route(key, &self.comparator),
                    parent.size() as usize,
                )
            };

            if idx < parent_size - 1 {
                let sibling_id =
                    InternalPageView::<K>::new(parent_guard.data()).child_at(idx + 1);
                let mut sibling_guard = pager.fetch_write(sibling_id)?;

                let mut leaf = LeafPageMut::<K, V>::new(leaf_guard.data_mut());
                let mut sib = LeafPageMut::<K, V>::new(sibling_guard.data_mut());
                let merge_size = leaf.size() + sib.size();

                if merge_size < leaf.max_size() {
                    // Merge the right sibling into this leaf.
                    let s = leaf.size() as usize;
                    leaf.set_size(merge_size);
                    for i in 0..sib.size() as usize {
                        let k = sib.key_at(i);
                        let v = sib.value_at(i);
                        leaf.set_at(s + i, &k, &v);
                    }
                    leaf.set_next_page_id(sib.next_page_id());
                    debug!(index = %self.index_name, absorbed = %sibling_id, "leaf merge");
                    freed.push(sibling_id);
                    Some(idx + 1)
                } else {
                    // Borrow the right sibling's first entry.
                    leaf.increase_size(1);
                    let last = leaf.size() as usize - 1;
                    let k = sib.key_at(0);
                    let v = sib.value_at(0);
                    leaf.set_at(last, &k, &v);
                    let ssize = sib.size() as usize;
                    for i in 0..(ssize - 1) {
                        let k = sib.key_at(i + 1);
                        let v = sib.value_at(i + 1);
                        sib.set_at(i, &k, &v);
                    }
                    sib.set_size((ssize - 1) as u32);
                    let new_sep = sib.key_at(0);
                    let mut parent = InternalPageMut::<K>::new(parent_guard.data_mut());
                    parent.set_key_at(idx + 1, &new_sep);
                    None
                }
            } else {
                let sibling_id =
                    InternalPageView::<K>::new(parent_guard.data()).child_at(idx - 1);
                let mut sibling_guard = pager.fetch_write(sibling_id)?;

                let mut leaf = LeafPageMut::<K, V>::new(leaf_guard.data_mut());
                let mut sib = LeafPageMut::<K, V>::new(sibling_guard.data_mut());
                let merge_size = leaf.size() + sib.size();

                if merge_size < sib.max_size() {
                    // Merge this leaf into the left sibling.
                    let s = sib.size() as usize;
                    sib.set_size(merge_size);
                    for i in 0..leaf.size() as usize {
                        let k = leaf.key_at(i);
                        let v = leaf.value_at(i);
                        sib.set_at(s + i, &k, &v);
                    }
                    sib.set_next_page_id(leaf.next_page_id());
                    debug!(index = %self.index_name, absorbed = %leaf_page_id, "leaf merge");
                    freed.push(leaf_page_id);
                    Some(idx)
                } else {
                    // Borrow the left sibling's last entry.
                    leaf.increase_size(1);
                    let size = leaf.size() as usize;
                    for i in (1..size).rev() {
                        let k = leaf.key_at(i - 1);
                        let v = leaf.value_at(i - 1);
                        leaf.set_at(i, &k, &v);
                    }
                    let ssize = sib.size() as usize;
                    let k = sib.key_at(ssize - 1);
                    let v = sib.value_at(ssize - 1);
                    leaf.set_at(0, &k, &v);
                    sib.set_size((ssize - 1) as u32);
                    let new_sep = leaf.key_at(0);
                    let mut parent = InternalPageMut::<K>::new(parent_guard.data_mut());
                    parent.set_key_at(idx, &new_sep);
                    None
                }
            }
        };

        if let Some(value_index) = removed_separator {
            let parent_pos = ctx.write_set.len() - 2;
            self.remove_from_parent(&mut ctx, value_index, parent_pos, &mut freed)?;
        }

        drop(ctx);
        for id in freed {
            pager.delete_page(id);
        }
        Ok(())
    }

    /// Removes the separator at `value_index` from the ancestor at `index`
    /// within the write set, resolving underflow by borrow or merge and
    /// recursing while merges propagate.
    fn remove_from_parent<'p>(
        &'p self,
        ctx: &mut Context<'p>,
        value_index: usize,
        index: usize,
        freed: &mut Vec<PageId>,
    ) -> Result<()> {
        let pager = self.pager.as_ref();
        let page_id = ctx.write_set[index].page_id();

        let (new_size, min_size) = {
            let guard = ctx
                .write_set
                .get_mut(index)
                .expect("ancestor guard retained by descent");
            let mut page = InternalPageMut::<K>::new(guard.data_mut());
            let size = page.size() as usize;
            for i in (value_index + 1)..size {
                let k = page.key_at(i);
                let c = page.child_at(i);
                page.set_key_at(i - 1, &k);
                page.set_child_at(i - 1, c);
            }
            page.set_size((size - 1) as u32);
            (page.size(), page.min_size())
        };
        if new_size >= min_size {
            return Ok(());
        }

        // Root collapse: a root internal down to one child hands the root
        // role to that child. Legal only under the still-held header latch.
        if ctx.is_root_page(page_id) {
            if new_size == 1 {
                let new_root = {
                    let guard = &ctx.write_set[index];
                    InternalPageView::<K>::new(guard.data()).child_at(0)
                };
                let header_guard = ctx
                    .header
                    .as_mut()
                    .expect("header latch is held whenever the root may collapse");
                HeaderPageMut::new(header_guard.data_mut()).set_root_page_id(new_root);
                freed.push(page_id);
                debug!(index = %self.index_name, root = %new_root, "root collapsed");
            }
            return Ok(());
        }

        let removed_separator: Option<usize> = {
            let slices = ctx.write_set.make_contiguous();
            let (front, back) = slices.split_at_mut(index);
            let page_guard = &mut back[0];
            let parent_guard = front
                .last_mut()
                .expect("parent guard retained for unsafe internal");

            let pos = InternalPageView::<K>::new(parent_guard.data())
                .value_index(page_id)
                .ok_or_else(|| {
                    StrataError::BTreeCorrupted("child missing from its parent".to_string())
                })?;
            let parent_size = InternalPageView::<K>::new(parent_guard.data()).size() as usize;

            if pos < parent_size - 1 {
                let sibling_id =
                    InternalPageView::<K>::new(parent_guard.data()).child_at(pos + 1);
                let mut sibling_guard = pager.fetch_write(sibling_id)?;

                let mut page = InternalPageMut::<K>::new(page_guard.data_mut());
                let mut sib = InternalPageMut::<K>::new(sibling_guard.data_mut());
                let merge_size = page.size() + sib.size();

                if merge_size <= page.max_size() {
                    // Merge the right sibling into this node. Its slot 0 key
                    // is maintained by splits, so the copy keeps routing
                    // intact.
                    let s = page.size() as usize;
                    page.set_size(merge_size);
                    for i in 0..sib.size() as usize {
                        let k = sib.key_at(i);
                        let c = sib.child_at(i);
                        page.set_key_at(s + i, &k);
                        page.set_child_at(s + i, c);
                    }
                    debug!(index = %self.index_name, absorbed = %sibling_id, "internal merge");
                    freed.push(sibling_id);
                    Some(pos + 1)
                } else {
                    // Borrow the right sibling's first slot.
                    page.increase_size(1);
                    let last = page.size() as usize - 1;
                    let k = sib.key_at(0);
                    let c = sib.child_at(0);
                    page.set_key_at(last, &k);
                    page.set_child_at(last, c);
                    let ssize = sib.size() as usize;
                    for i in 0..(ssize - 1) {
                        let k = sib.key_at(i + 1);
                        let c = sib.child_at(i + 1);
                        sib.set_key_at(i, &k);
                        sib.set_child_at(i, c);
                    }
                    sib.set_size((ssize - 1) as u32);
                    let new_sep = sib.key_at(0);
                    let mut parent = InternalPageMut::<K>::new(parent_guard.data_mut());
                    parent.set_key_at(pos + 1, &new_sep);
                    None
                }
            } else {
                let sibling_id =
                    InternalPageView::<K>::new(parent_guard.data()).child_at(pos - 1);
                let mut sibling_guard = pager.fetch_write(sibling_id)?;

                let mut page = InternalPageMut::<K>::new(page_guard.data_mut());
                let mut sib = InternalPageMut::<K>::new(sibling_guard.data_mut());
                let merge_size = page.size() + sib.size();

                if merge_size <= sib.max_size() {
                    // Merge this node into the left sibling.
                    let s = sib.size() as usize;
                    sib.set_size(merge_size);
                    for i in 0..page.size() as usize {
                        let k = page.key_at(i);
                        let c = page.child_at(i);
                        sib.set_key_at(s + i, &k);
                        sib.set_child_at(s + i, c);
                    }
                    debug!(index = %self.index_name, absorbed = %page_id, "internal merge");
                    freed.push(page_id);
                    Some(pos)
                } else {
                    // Borrow the left sibling's last slot.
                    page.increase_size(1);
                    let size = page.size() as usize;
                    for i in (1..size).rev() {
                        let k = page.key_at(i - 1);
                        let c = page.child_at(i - 1);
                        page.set_key_at(i, &k);
                        page.set_child_at(i, c);
                    }
                    let ssize = sib.size() as usize;
                    let k = sib.key_at(ssize - 1);
                    let c = sib.child_at(ssize - 1);
                    page.set_key_at(0, &k);
                    page.set_child_at(0, c);
                    sib.set_size((ssize - 1) as u32);
                    let new_sep = page.key_at(0);
                    let mut parent = InternalPageMut::<K>::new(parent_guard.data_mut());
                    parent.set_key_at(pos, &new_sep);
                    None
                }
            }
        };

        if let Some(vi) = removed_separator {
            self.remove_from_parent(ctx, vi, index - 1, freed)?;
        }
        Ok(())
    }

    /// Forward iterator from the leftmost entry.
    pub fn iter(&self) -> Result<TreeIterator<'_, K, V>> {
        let pager = self.pager.as_ref();

        let header_guard = pager.fetch_read(self.header_page_id)?;
        let root_id = HeaderPageView::new(header_guard.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(TreeIterator::end(pager));
        }
        let mut guard = pager.fetch_read(root_id)?;
        drop(header_guard);

        loop {
            let child_id = {
                if BTreePageView::new(guard.data()).is_leaf() {
                    break;
                }
                InternalPageView::<K>::new(guard.data()).child_at(0)
            };
            let child_guard = pager.fetch_read(child_id)?;
            guard = child_guard;
        }

        Ok(TreeIterator::new(pager, guard, 0))
    }

    /// Forward iterator positioned at the leaf lower bound of `key` (the
    /// largest slot whose key is not greater than it); the end iterator if
    /// the leaf that routing reaches holds no such slot.
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<'_, K, V>> {
        let pager = self.pager.as_ref();

        let header_guard = pager.fetch_read(self.header_page_id)?;
        let root_id = HeaderPageView::new(header_guard.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(TreeIterator::end(pager));
        }
        let mut guard = pager.fetch_read(root_id)?;
        drop(header_guard);

        loop {
            let child_id = {
                if BTreePageView::new(guard.data()).is_leaf() {
                    break;
                }
                let internal = InternalPageView::<K>::new(guard.data());
                internal.child_at(internal.route(key, &self.comparator))
            };
            let child_guard = pager.fetch_read(child_id)?;
            guard = child_guard;
        }

        let slot = LeafPageView::<K, V>::new(guard.data()).lower_bound(key, &self.comparator);
        match slot {
            Some(slot) => Ok(TreeIterator::new(pager, guard, slot)),
            None => Ok(TreeIterator::end(pager)),
        }
    }

    /// Walks the whole tree and checks its structural invariants: slot
    /// ordering, fan-out bounds, separator/routing agreement, uniform
    /// depth, and leaf-chain order. Intended for tests and debugging; uses
    /// latchless basic guards, so run it only on a quiescent tree.
    pub fn check_integrity(&self) -> Result<()> {
        let root_id = self.root_page_id()?;
        if !root_id.is_valid() {
            // Canonical empty form.
            return Ok(());
        }

        let summary = self.check_subtree(root_id, true)?;

        // Walk the leaf chain from the leftmost leaf: strictly ascending
        // keys, and exactly the entries/leaves the subtree walk saw.
        let mut leaf_id = {
            let mut page_id = root_id;
            loop {
                let guard = self.pager.fetch_basic(page_id)?;
                let data = guard.data();
                if BTreePageView::new(&data[..]).is_leaf() {
                    break page_id;
                }
                page_id = InternalPageView::<K>::new(&data[..]).child_at(0);
            }
        };

        let mut prev: Option<K> = None;
        let mut chained_entries = 0usize;
        let mut chained_leaves = 0usize;
        while leaf_id.is_valid() {
            let guard = self.pager.fetch_basic(leaf_id)?;
            let data = guard.data();
            let leaf = LeafPageView::<K, V>::new(&data[..]);
            for i in 0..leaf.size() as usize {
                let k = leaf.key_at(i);
                if let Some(p) = prev {
                    if self.compare(&p, &k) != Ordering::Less {
                        return Err(StrataError::BTreeCorrupted(format!(
                            "leaf chain keys not strictly ascending at page {leaf_id}"
                        )));
                    }
                }
                prev = Some(k);
                chained_entries += 1;
            }
            chained_leaves += 1;
            leaf_id = leaf.next_page_id();
        }

        if chained_entries != summary.entries || chained_leaves != summary.leaf_count {
            return Err(StrataError::BTreeCorrupted(format!(
                "leaf chain covers {chained_entries} entries in {chained_leaves} leaves, \
                 tree holds {} in {}",
                summary.entries, summary.leaf_count
            )));
        }
        Ok(())
    }

    fn check_subtree(&self, page_id: PageId, is_root: bool) -> Result<SubtreeSummary<K>> {
        let data = {
            let guard = self.pager.fetch_basic(page_id)?;
            guard.data()
        };
        let view = BTreePageView::new(&data[..]);
        let size = view.size() as usize;

        if size == 0 {
            return Err(StrataError::BTreeCorrupted(format!(
                "page {page_id} is empty"
            )));
        }
        if view.size() > view.max_size() {
            return Err(StrataError::BTreeCorrupted(format!(
                "page {page_id} exceeds max_size"
            )));
        }
        if !is_root && view.size() < view.min_size() {
            return Err(StrataError::BTreeCorrupted(format!(
                "page {page_id} below min_size"
            )));
        }

        if view.is_leaf() {
            let leaf = LeafPageView::<K, V>::new(&data[..]);
            for i in 1..size {
                if self.compare(&leaf.key_at(i - 1), &leaf.key_at(i)) != Ordering::Less {
                    return Err(StrataError::BTreeCorrupted(format!(
                        "leaf {page_id} keys not strictly ascending"
                    )));
                }
            }
            return Ok(SubtreeSummary {
                min: leaf.key_at(0),
                max: leaf.key_at(size - 1),
                depth: 1,
                leaf_count: 1,
                entries: size,
            });
        }

        if is_root && size < 2 {
            return Err(StrataError::BTreeCorrupted(format!(
                "root internal {page_id} has fewer than two children"
            )));
        }

        let node = InternalPageView::<K>::new(&data[..]);
        let mut children = Vec::with_capacity(size);
        for i in 0..size {
            children.push(self.check_subtree(node.child_at(i), false)?);
        }

        let depth = children[0].depth;
        for (i, child) in children.iter().enumerate() {
            if child.depth != depth {
                return Err(StrataError::BTreeCorrupted(format!(
                    "uneven depth below internal {page_id}"
                )));
            }
            if i >= 1 {
                // The separator bounds the child ranges: at most the right
                // child's minimum (a merge may leave it as a stale fence
                // key) and strictly above everything in the left subtree.
                let sep = node.key_at(i);
                if self.compare(&sep, &child.min) == Ordering::Greater {
                    return Err(StrataError::BTreeCorrupted(format!(
                        "separator {i} of internal {page_id} exceeds its child's minimum"
                    )));
                }
                if self.compare(&children[i - 1].max, &sep) != Ordering::Less {
                    return Err(StrataError::BTreeCorrupted(format!(
                        "separator {i} of internal {page_id} not above the left subtree"
                    )));
                }
            }
        }

        Ok(SubtreeSummary {
            min: children[0].min,
            max: children[size - 1].max,
            depth: depth + 1,
            leaf_count: children.iter().map(|c| c.leaf_count).sum(),
            entries: children.iter().map(|c| c.entries).sum(),
        })
    }
}

struct SubtreeSummary<K> {
    min: K,
    max: K,
    depth: usize,
    leaf_count: usize,
    entries: usize,
}
