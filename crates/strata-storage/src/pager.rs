//! Pager: buffer pool + disk manager composition with latch guards.
//!
//! All page I/O is routed through the buffer pool for caching. The pager
//! hands out RAII guards that pin the page and hold its reader-writer latch
//! for the whole guard lifetime; dropping a guard releases the latch and the
//! pin on every exit path.

use crate::disk::{DiskManager, DiskManagerConfig};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use strata_buffer::{BufferFrame, BufferPool, BufferPoolConfig, BufferPoolStats};
use strata_common::page::{PageId, PAGE_SIZE};
use strata_common::{Result, StorageConfig, StrataError};
use tracing::trace;

/// Pager over a single data file.
///
/// Composes the buffer pool with the disk manager: cache misses read the
/// page from disk, dirty eviction victims are written back before the
/// freshly loaded page is handed out.
pub struct Pager {
    /// Disk manager for page I/O.
    disk: Arc<DiskManager>,
    /// Buffer pool for page caching.
    pool: Arc<BufferPool>,
    /// File that `new_page` allocates from.
    file_id: u32,
    /// Serializes cache-miss loads so a page is read from disk once.
    miss_lock: Mutex<()>,
}

impl Pager {
    /// Creates a new pager.
    pub fn new(disk: Arc<DiskManager>, pool: Arc<BufferPool>, file_id: u32) -> Self {
        Self {
            disk,
            pool,
            file_id,
            miss_lock: Mutex::new(()),
        }
    }

    /// Builds a pager (disk manager + buffer pool) from a storage config.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let disk = Arc::new(DiskManager::new(DiskManagerConfig {
            data_dir: config.data_dir.clone(),
            fsync_enabled: config.fsync_enabled,
        })?);
        let pool = Arc::new(BufferPool::new(BufferPoolConfig {
            num_frames: config.buffer_pool_pages,
        }));
        Ok(Self::new(disk, pool, 0))
    }

    /// Returns the pinned frame for a page, loading it from disk on a miss.
    fn frame_for(&self, page_id: PageId) -> Result<&BufferFrame> {
        if let Some(frame) = self.pool.fetch_page(page_id) {
            return Ok(frame);
        }

        let _miss = self.miss_lock.lock();
        // Another thread may have loaded the page while we waited.
        if let Some(frame) = self.pool.fetch_page(page_id) {
            return Ok(frame);
        }

        trace!(page_id = %page_id, "page cache miss");
        let bytes = self.disk.read_page(page_id)?;
        let (frame, evicted) = self.pool.load_page(page_id, &bytes)?;
        if let Some(ev) = evicted {
            self.disk.write_page(ev.page_id, &ev.data)?;
        }
        Ok(frame)
    }

    /// Fetches a page with a shared latch.
    pub fn fetch_read(&self, page_id: PageId) -> Result<ReadPageGuard<'_>> {
        let frame = self.frame_for(page_id)?;
        let data = frame.latch_read();
        Ok(ReadPageGuard {
            page_id,
            frame,
            data: Some(data),
        })
    }

    /// Fetches a page with an exclusive latch.
    pub fn fetch_write(&self, page_id: PageId) -> Result<WritePageGuard<'_>> {
        let frame = self.frame_for(page_id)?;
        let data = frame.latch_write();
        Ok(WritePageGuard {
            page_id,
            frame,
            data: Some(data),
        })
    }

    /// Fetches a page without a latch (pin only). Debug/verifier use: reads
    /// are copies and carry no consistency guarantee against writers.
    pub fn fetch_basic(&self, page_id: PageId) -> Result<BasicPageGuard<'_>> {
        let frame = self.frame_for(page_id)?;
        Ok(BasicPageGuard { page_id, frame })
    }

    /// Allocates and pins a fresh zeroed page under an exclusive latch.
    ///
    /// The caller initializes its contents.
    pub fn new_page(&self) -> Result<(WritePageGuard<'_>, PageId)> {
        let page_id = self.disk.allocate_page(self.file_id)?;

        let _miss = self.miss_lock.lock();
        let (frame, evicted) = self.pool.new_page(page_id)?;
        if let Some(ev) = evicted {
            self.disk.write_page(ev.page_id, &ev.data)?;
        }
        let data = frame.latch_write();

        Ok((
            WritePageGuard {
                page_id,
                frame,
                data: Some(data),
            },
            page_id,
        ))
    }

    /// Frees a page: drops it from the pool and returns its number to the
    /// disk free list for reuse.
    ///
    /// Returns false if the page is still pinned (it is then left alone and
    /// its disk space is not reclaimed).
    pub fn delete_page(&self, page_id: PageId) -> bool {
        if self.pool.contains(page_id) && !self.pool.delete_page(page_id) {
            return false;
        }
        self.disk.deallocate_page(page_id).is_ok()
    }

    /// Writes every dirty cached page back to disk.
    pub fn flush_all(&self) -> Result<usize> {
        let disk = &self.disk;
        self.pool.flush_all(|page_id, data| {
            let bytes: &[u8; PAGE_SIZE] = data
                .try_into()
                .map_err(|_| StrataError::Internal("flush buffer size mismatch".to_string()))?;
            disk.write_page(page_id, bytes)
        })
    }

    /// Returns buffer pool statistics.
    pub fn pool_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }
}

/// RAII guard holding a shared latch and a pin on one page.
///
/// Unpinning goes through the frame directly: the held pin keeps the frame
/// from being reassigned, so no page-table lookup is needed (or safe) at
/// release time.
pub struct ReadPageGuard<'a> {
    page_id: PageId,
    frame: &'a BufferFrame,
    data: Option<RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>>,
}

impl ReadPageGuard<'_> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        // Invariant: `data` is Some until drop.
        self.data.as_deref().expect("latch released")
    }
}

impl Drop for ReadPageGuard<'_> {
    fn drop(&mut self) {
        self.data.take();
        self.frame.unpin();
    }
}

/// RAII guard holding an exclusive latch and a pin on one page.
///
/// The page is marked dirty when the guard drops.
pub struct WritePageGuard<'a> {
    page_id: PageId,
    frame: &'a BufferFrame,
    data: Option<RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>>,
}

impl WritePageGuard<'_> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        self.data.as_deref().expect("latch released")
    }

    /// Returns mutable page data.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.data.as_deref_mut().expect("latch released")
    }
}

impl Drop for WritePageGuard<'_> {
    fn drop(&mut self) {
        self.data.take();
        self.frame.set_dirty(true);
        self.frame.unpin();
    }
}

/// RAII guard holding only a pin (no latch).
pub struct BasicPageGuard<'a> {
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl BasicPageGuard<'_> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Copies the current page contents out (takes the shared latch briefly).
    pub fn data(&self) -> Box<[u8; PAGE_SIZE]> {
        let mut out = Box::new([0u8; PAGE_SIZE]);
        self.frame.copy_to(&mut out[..]);
        out
    }
}

impl Drop for BasicPageGuard<'_> {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}
