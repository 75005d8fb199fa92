//! Page table mapping cached page IDs to buffer frames.

use crate::frame::FrameId;
use parking_lot::RwLock;
use std::collections::HashMap;
use strata_common::page::PageId;

/// Number of shards. Power of two so shard selection is a mask.
const SHARD_COUNT: usize = 16;

/// Sharded map from `PageId` to the frame caching that page.
///
/// Lookups take one shard read lock; inserts and removals take one shard
/// write lock. Sharding keeps fetches on unrelated pages from contending,
/// which is all the buffer pool needs: the miss path is already serialized
/// above this table by the pager.
pub struct PageTable {
    shards: Box<[RwLock<HashMap<u64, FrameId>>]>,
}

impl PageTable {
    /// Creates a page table sized for the given number of frames.
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity / SHARD_COUNT).max(8);
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::with_capacity(per_shard)))
            .collect();
        Self { shards }
    }

    /// Picks the shard for a packed page id.
    ///
    /// Fibonacci hashing on the packed id; sequential page numbers land in
    /// different shards.
    #[inline(always)]
    fn shard_for(&self, key: u64) -> &RwLock<HashMap<u64, FrameId>> {
        let h = key.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.shards[(h >> 60) as usize & (SHARD_COUNT - 1)]
    }

    /// Looks up a page ID and returns its frame ID if present.
    #[inline]
    pub fn get(&self, page_id: PageId) -> Option<FrameId> {
        let key = page_id.as_u64();
        self.shard_for(key).read().get(&key).copied()
    }

    /// Inserts or updates a page ID to frame ID mapping.
    pub fn insert(&self, page_id: PageId, frame_id: FrameId) {
        let key = page_id.as_u64();
        self.shard_for(key).write().insert(key, frame_id);
    }

    /// Removes a page ID mapping. Returns the frame ID if it was present.
    pub fn remove(&self, page_id: PageId) -> Option<FrameId> {
        let key = page_id.as_u64();
        self.shard_for(key).write().remove(&key)
    }

    /// Returns true if the page ID is in the table.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.get(page_id).is_some()
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Iterates over all entries, calling the provided function for each.
    /// Returns early if the function returns false.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(PageId, FrameId) -> bool,
    {
        for shard in self.shards.iter() {
            let guard = shard.read();
            for (&key, &frame_id) in guard.iter() {
                if !f(PageId::from_u64(key), frame_id) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get() {
        let table = PageTable::new(100);
        let page_id = PageId::new(0, 42);
        let frame_id = FrameId(7);

        table.insert(page_id, frame_id);
        assert_eq!(table.get(page_id), Some(frame_id));
        assert!(table.contains(page_id));
    }

    #[test]
    fn test_get_missing() {
        let table = PageTable::new(100);
        assert_eq!(table.get(PageId::new(0, 42)), None);
        assert!(!table.contains(PageId::new(0, 42)));
    }

    #[test]
    fn test_remove() {
        let table = PageTable::new(100);
        let page_id = PageId::new(0, 42);
        let frame_id = FrameId(7);

        table.insert(page_id, frame_id);
        assert_eq!(table.remove(page_id), Some(frame_id));
        assert_eq!(table.get(page_id), None);
        assert_eq!(table.remove(page_id), None);
    }

    #[test]
    fn test_distinct_file_ids_are_distinct_keys() {
        let table = PageTable::new(100);

        table.insert(PageId::new(0, 42), FrameId(1));
        table.insert(PageId::new(1, 42), FrameId(2));

        assert_eq!(table.get(PageId::new(0, 42)), Some(FrameId(1)));
        assert_eq!(table.get(PageId::new(1, 42)), Some(FrameId(2)));
    }

    #[test]
    fn test_len() {
        let table = PageTable::new(100);

        assert_eq!(table.len(), 0);
        assert!(table.is_empty());

        table.insert(PageId::new(0, 1), FrameId(1));
        table.insert(PageId::new(0, 2), FrameId(2));
        table.insert(PageId::new(1, 1), FrameId(3));

        assert_eq!(table.len(), 3);
        assert!(!table.is_empty());
    }

    #[test]
    fn test_update_existing() {
        let table = PageTable::new(100);
        let page_id = PageId::new(0, 42);

        table.insert(page_id, FrameId(1));
        assert_eq!(table.get(page_id), Some(FrameId(1)));

        table.insert(page_id, FrameId(2));
        assert_eq!(table.get(page_id), Some(FrameId(2)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_sequential_pages_all_resolve() {
        // Sequential page numbers scatter across shards; every one must
        // still round-trip.
        let table = PageTable::new(256);

        for i in 0..256u32 {
            table.insert(PageId::new(0, i), FrameId(i));
        }
        assert_eq!(table.len(), 256);
        for i in 0..256u32 {
            assert_eq!(table.get(PageId::new(0, i)), Some(FrameId(i)));
        }
    }

    #[test]
    fn test_for_each_visits_all() {
        let table = PageTable::new(100);
        table.insert(PageId::new(0, 1), FrameId(1));
        table.insert(PageId::new(2, 9), FrameId(2));

        let mut seen = Vec::new();
        table.for_each(|pid, fid| {
            seen.push((pid, fid));
            true
        });
        seen.sort_by_key(|(pid, _)| pid.as_u64());
        assert_eq!(
            seen,
            vec![
                (PageId::new(0, 1), FrameId(1)),
                (PageId::new(2, 9), FrameId(2)),
            ]
        );
    }

    #[test]
    fn test_for_each_early_exit() {
        let table = PageTable::new(100);
        for i in 0..10u32 {
            table.insert(PageId::new(0, i), FrameId(i));
        }

        let mut visited = 0;
        table.for_each(|_, _| {
            visited += 1;
            visited < 3
        });
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_concurrent_disjoint_inserts() {
        let table = PageTable::new(1024);

        std::thread::scope(|scope| {
            for t in 0..4u32 {
                let table = &table;
                scope.spawn(move || {
                    for i in 0..256u32 {
                        let page_num = t * 256 + i;
                        table.insert(PageId::new(0, page_num), FrameId(page_num));
                    }
                });
            }
        });

        assert_eq!(table.len(), 1024);
        for page_num in 0..1024u32 {
            assert_eq!(
                table.get(PageId::new(0, page_num)),
                Some(FrameId(page_num))
            );
        }
    }
}
