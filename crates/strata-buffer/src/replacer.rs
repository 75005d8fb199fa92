//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Trait for page replacement algorithms.
///
/// Eviction candidacy is decided by the caller through the `can_evict`
/// predicate (the pool checks pin counts directly), so the replacer only
/// tracks which frames hold pages and their recency state.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Registers a frame as holding a page (a candidate for future eviction).
    fn track(&self, frame_id: FrameId);

    /// Selects a victim frame for eviction among tracked frames for which
    /// `can_evict` returns true.
    ///
    /// Returns None if no tracked frame is evictable.
    fn evict(&self, can_evict: &dyn Fn(FrameId) -> bool) -> Option<FrameId>;

    /// Removes a frame from the replacer.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of tracked frames.
    fn size(&self) -> usize;
}

/// Clock replacement algorithm implementation.
///
/// Uses atomic reference bits for lock-free access recording. Only takes the
/// mutex for tracked-set modifications and victim selection.
pub struct ClockReplacer {
    /// Number of frames.
    num_frames: usize,
    /// Reference bits for each frame (atomic for lock-free access).
    reference_bits: Vec<AtomicBool>,
    /// Internal state protected by mutex (tracked set and clock hand).
    inner: Mutex<ClockReplacerInner>,
}

struct ClockReplacerInner {
    /// Set of frames currently holding pages.
    tracked: HashSet<FrameId>,
    /// Current clock hand position.
    clock_hand: usize,
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        let reference_bits: Vec<AtomicBool> =
            (0..num_frames).map(|_| AtomicBool::new(false)).collect();

        Self {
            num_frames,
            reference_bits,
            inner: Mutex::new(ClockReplacerInner {
                tracked: HashSet::new(),
                clock_hand: 0,
            }),
        }
    }

    /// Returns the total capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.num_frames
    }
}

impl Replacer for ClockReplacer {
    #[inline]
    fn record_access(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.num_frames {
            // Lock-free atomic write
            self.reference_bits[idx].store(true, Ordering::Relaxed);
        }
    }

    #[inline]
    fn track(&self, frame_id: FrameId) {
        if (frame_id.0 as usize) >= self.num_frames {
            return;
        }
        self.inner.lock().tracked.insert(frame_id);
    }

    fn evict(&self, can_evict: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        if inner.tracked.is_empty() {
            return None;
        }

        let num_frames = self.num_frames;

        // Make at most 2 full rotations to find a victim
        for _ in 0..(2 * num_frames) {
            let hand = inner.clock_hand;
            let frame_id = FrameId(hand as u32);

            if inner.tracked.contains(&frame_id) && can_evict(frame_id) {
                if !self.reference_bits[hand].load(Ordering::Relaxed) {
                    // Found victim: evictable and reference bit is 0
                    inner.tracked.remove(&frame_id);
                    inner.clock_hand = (hand + 1) % num_frames;
                    return Some(frame_id);
                }
                // Clear reference bit and continue
                self.reference_bits[hand].store(false, Ordering::Relaxed);
            }

            inner.clock_hand = (hand + 1) % num_frames;
        }

        // If we still haven't found one, pick any evictable tracked frame
        let victim = inner.tracked.iter().copied().find(|&fid| can_evict(fid));
        if let Some(frame_id) = victim {
            inner.tracked.remove(&frame_id);
            return Some(frame_id);
        }

        None
    }

    fn remove(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.num_frames {
            self.inner.lock().tracked.remove(&frame_id);
            self.reference_bits[idx].store(false, Ordering::Relaxed);
        }
    }

    fn size(&self) -> usize {
        self.inner.lock().tracked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evict_all(_: FrameId) -> bool {
        true
    }

    #[test]
    fn test_clock_replacer_new() {
        let replacer = ClockReplacer::new(10);
        assert_eq!(replacer.capacity(), 10);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_clock_replacer_track() {
        let replacer = ClockReplacer::new(10);

        replacer.track(FrameId(0));
        replacer.track(FrameId(1));
        replacer.track(FrameId(2));

        assert_eq!(replacer.size(), 3);

        replacer.remove(FrameId(1));
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_clock_replacer_evict_empty() {
        let replacer = ClockReplacer::new(10);
        assert!(replacer.evict(&evict_all).is_none());
    }

    #[test]
    fn test_clock_replacer_evict_single() {
        let replacer = ClockReplacer::new(10);

        replacer.track(FrameId(5));
        assert_eq!(replacer.size(), 1);

        let victim = replacer.evict(&evict_all);
        assert_eq!(victim, Some(FrameId(5)));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_clock_replacer_evict_with_reference_bits() {
        let replacer = ClockReplacer::new(10);

        replacer.track(FrameId(0));
        replacer.track(FrameId(1));
        replacer.track(FrameId(2));

        // Set reference bits on frames 0 and 1
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));

        // Frame 2 should be evicted first (no reference bit)
        let victim = replacer.evict(&evict_all);
        assert_eq!(victim, Some(FrameId(2)));
    }

    #[test]
    fn test_clock_replacer_evict_all_referenced() {
        let replacer = ClockReplacer::new(3);

        replacer.track(FrameId(0));
        replacer.track(FrameId(1));
        replacer.track(FrameId(2));

        // Reference all frames
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.record_access(FrameId(2));

        // Should still be able to evict (after clearing reference bits)
        let victim = replacer.evict(&evict_all);
        assert!(victim.is_some());
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_clock_replacer_respects_predicate() {
        let replacer = ClockReplacer::new(10);

        replacer.track(FrameId(0));
        replacer.track(FrameId(1));

        // Frame 0 is "pinned"
        let victim = replacer.evict(&|fid| fid != FrameId(0));
        assert_eq!(victim, Some(FrameId(1)));

        // Only the pinned frame remains
        let victim = replacer.evict(&|fid| fid != FrameId(0));
        assert!(victim.is_none());
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_clock_replacer_remove() {
        let replacer = ClockReplacer::new(10);

        replacer.track(FrameId(0));
        replacer.track(FrameId(1));
        assert_eq!(replacer.size(), 2);

        replacer.remove(FrameId(0));
        assert_eq!(replacer.size(), 1);

        let victim = replacer.evict(&evict_all);
        assert_eq!(victim, Some(FrameId(1)));
    }

    #[test]
    fn test_clock_replacer_record_access_second_chance() {
        let replacer = ClockReplacer::new(10);

        replacer.track(FrameId(0));
        replacer.track(FrameId(1));

        // Access frame 0, giving it a second chance
        replacer.record_access(FrameId(0));

        // Frame 1 should be evicted (frame 0 has reference bit set)
        let victim = replacer.evict(&evict_all);
        assert_eq!(victim, Some(FrameId(1)));
    }

    #[test]
    fn test_clock_replacer_out_of_bounds() {
        let replacer = ClockReplacer::new(5);

        // These should not panic
        replacer.track(FrameId(100));
        replacer.record_access(FrameId(100));
        replacer.remove(FrameId(100));

        assert_eq!(replacer.size(), 0);
    }
}
