//! Buffer frame management.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::page::{PageId, PAGE_SIZE};

/// Pin count occupies the low 32 bits of the frame state word.
const PIN_MASK: u64 = 0xFFFF_FFFF;
/// Page modified since its last write-back.
const DIRTY_FLAG: u64 = 1 << 32;

/// Unique identifier for a frame in the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A frame in the buffer pool holding a single page.
///
/// The `RwLock` around the page data doubles as the page latch: a read
/// guard on it is a shared latch, a write guard an exclusive latch. Guards
/// handed out by the pager hold it for their whole lifetime.
///
/// Bookkeeping lives in one atomic state word (pin count in the low bits,
/// dirty flag above) so a pin/unpin or dirty transition is a single
/// read-modify-write. Recency tracking for eviction belongs to the
/// replacer, not the frame.
pub struct BufferFrame {
    /// Frame identifier.
    frame_id: FrameId,
    /// Packed id of the resident page; `PageId::INVALID` when empty.
    page_id: AtomicU64,
    /// Pin count and dirty flag, packed.
    state: AtomicU64,
    /// Page bytes behind the page latch.
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl BufferFrame {
    /// Creates a new empty buffer frame.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicU64::new(PageId::INVALID.as_u64()),
            state: AtomicU64::new(0),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    /// Returns the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page ID currently stored in this frame.
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        let id = PageId::from_u64(self.page_id.load(Ordering::Acquire));
        id.is_valid().then_some(id)
    }

    /// Sets the page ID for this frame.
    #[inline]
    pub fn set_page_id(&self, page_id: Option<PageId>) {
        let id = page_id.unwrap_or(PageId::INVALID);
        self.page_id.store(id.as_u64(), Ordering::Release);
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        (self.state.load(Ordering::Acquire) & PIN_MASK) as u32
    }

    /// Increments the pin count. Returns the previous pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        let prev = self.state.fetch_add(1, Ordering::AcqRel);
        (prev & PIN_MASK) as u32
    }

    /// Decrements the pin count, saturating at zero.
    ///
    /// Returns the new pin count.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                if s & PIN_MASK == 0 {
                    None
                } else {
                    Some(s - 1)
                }
            });
        match prev {
            Ok(s) => (s & PIN_MASK) as u32 - 1,
            Err(_) => 0,
        }
    }

    /// Returns true if this frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Returns true if this frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.state.load(Ordering::Acquire) & DIRTY_FLAG != 0
    }

    /// Marks or clears the dirty flag.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        if dirty {
            self.state.fetch_or(DIRTY_FLAG, Ordering::AcqRel);
        } else {
            self.state.fetch_and(!DIRTY_FLAG, Ordering::AcqRel);
        }
    }

    /// Returns true if this frame is empty (no page loaded).
    #[inline]
    pub fn is_empty(&self) -> bool {
        !PageId::from_u64(self.page_id.load(Ordering::Acquire)).is_valid()
    }

    /// Acquires the page latch in shared mode.
    #[inline]
    pub fn latch_read(&self) -> RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.read()
    }

    /// Acquires the page latch in exclusive mode.
    #[inline]
    pub fn latch_write(&self) -> RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.write()
    }

    /// Copies data into the frame (takes the exclusive latch briefly).
    #[inline]
    pub fn copy_from(&self, src: &[u8]) {
        let mut data = self.data.write();
        let len = src.len().min(PAGE_SIZE);
        data[..len].copy_from_slice(&src[..len]);
    }

    /// Copies data out of the frame (takes the shared latch briefly).
    #[inline]
    pub fn copy_to(&self, dst: &mut [u8]) {
        let data = self.data.read();
        let len = dst.len().min(PAGE_SIZE);
        dst[..len].copy_from_slice(&data[..len]);
    }

    /// Resets the frame to empty state.
    #[inline]
    pub fn reset(&self) {
        self.page_id
            .store(PageId::INVALID.as_u64(), Ordering::Release);
        self.state.store(0, Ordering::Release);
        let mut data = self.data.write();
        data.fill(0);
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .finish()
    }
}
