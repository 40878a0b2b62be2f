//! Process-wide free-list of frame objects
//!
//! Producers acquire a [`FrameObject`] per incoming frame and the render
//! tick hands it back once uploaded. The free-list lock only guards pointer
//! moves; frame data is never copied while it is held.

use crate::frame::{FrameObject, FrameState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Default upper bound on recycled objects kept in the free-list
pub const DEFAULT_MAX_FREE: usize = 16;

/// Default upper bound on frame objects alive at once
pub const DEFAULT_MAX_LIVE: usize = 64;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate-or-reuse pool of frame objects
pub struct FramePool {
    id: u64,
    free: Mutex<Vec<FrameObject>>,
    max_free: usize,
    max_live: usize,

    // Mutated under the free-list lock, read lock-free by stats()
    live: AtomicUsize,
    next_serial: AtomicU64,

    recycled: AtomicU64,
    discarded: AtomicU64,
    exhausted: AtomicU64,
}

impl FramePool {
    /// Create an empty pool
    ///
    /// # Arguments
    /// * `max_free` - Objects retained for reuse; extra releases are freed
    /// * `max_live` - Objects alive at once; `acquire` returns `None` beyond it
    pub fn new(max_free: usize, max_live: usize) -> Self {
        let max_live = max_live.max(1);
        FramePool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            free: Mutex::new(Vec::with_capacity(max_free.min(max_live))),
            max_free: max_free.min(max_live),
            max_live,
            live: AtomicUsize::new(0),
            next_serial: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    /// Pop a recycled object or construct a new one.
    ///
    /// Never blocks beyond the free-list lock. Returns `None` when
    /// `max_live` objects already exist.
    pub fn acquire(&self) -> Option<FrameObject> {
        let mut free = self.free.lock();
        if let Some(mut frame) = free.pop() {
            drop(free);
            debug_assert_eq!(frame.state(), FrameState::Free);
            frame.set_state(FrameState::Acquired);
            return Some(frame);
        }

        if self.live.load(Ordering::Relaxed) >= self.max_live {
            drop(free);
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            log::trace!("frame pool {} exhausted", self.id);
            return None;
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        drop(free);

        Some(FrameObject::new(serial, self.id))
    }

    /// Return an object to the free-list. `None` is a no-op.
    pub fn release(&self, frame: impl Into<Option<FrameObject>>) {
        let Some(mut frame) = frame.into() else {
            return;
        };

        if frame.pool_id() != self.id {
            log::error!(
                "frame {} released to pool {} but belongs to pool {}",
                frame.serial(),
                self.id,
                frame.pool_id()
            );
            debug_assert!(false, "frame released to the wrong pool");
            return;
        }
        debug_assert_ne!(frame.state(), FrameState::Free, "double release");

        frame.set_state(FrameState::Free);
        frame.desc_mut().clear_damage();

        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(frame);
            drop(free);
            self.recycled.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.live.fetch_sub(1, Ordering::Relaxed);
        drop(free);

        // Over the retention bound: buffers are freed outside the lock
        drop(frame);
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Free every retained object. Returns how many were dropped.
    pub fn trim(&self) -> usize {
        let drained: Vec<FrameObject> = {
            let mut free = self.free.lock();
            self.live.fetch_sub(free.len(), Ordering::Relaxed);
            std::mem::take(&mut *free)
        };
        let count = drained.len();
        self.discarded.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Get pool statistics
    pub fn stats(&self) -> FramePoolStats {
        let (free, live) = {
            let free = self.free.lock();
            (free.len(), self.live.load(Ordering::Relaxed))
        };

        FramePoolStats {
            created: self.next_serial.load(Ordering::Relaxed),
            live,
            free,
            outstanding: live - free,
            recycled: self.recycled.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    pub fn max_live(&self) -> usize {
        self.max_live
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FREE, DEFAULT_MAX_LIVE)
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        let outstanding = self.stats().outstanding;
        if outstanding > 0 {
            log::debug!(
                "frame pool {} dropped with {} objects still outstanding",
                self.id,
                outstanding
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePoolStats {
    /// Objects ever constructed
    pub created: u64,
    /// Objects currently alive (free + outstanding)
    pub live: usize,
    /// Objects in the free-list
    pub free: usize,
    /// Objects held by producers, pending slots or the render tick
    pub outstanding: usize,
    pub recycled: u64,
    pub discarded: u64,
    /// Acquires refused because `max_live` was reached
    pub exhausted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameView;

    #[test]
    fn test_frame_pool_acquire_release() {
        let pool = FramePool::new(4, 8);

        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.free, 0);

        let frame1 = pool.acquire().unwrap();
        assert_eq!(pool.stats().outstanding, 1);

        let frame2 = pool.acquire().unwrap();
        assert_eq!(pool.stats().outstanding, 2);
        assert_ne!(frame1.serial(), frame2.serial());

        pool.release(frame1);
        assert_eq!(pool.stats().outstanding, 1);
        assert_eq!(pool.stats().free, 1);

        pool.release(frame2);
        assert_eq!(pool.stats().outstanding, 0);
        assert_eq!(pool.stats().created, 2);
    }

    #[test]
    fn test_frame_pool_reuses_released_object() {
        let pool = FramePool::default();

        let data = vec![9u8; 16 * 16 * 4];
        let mut frame = pool.acquire().unwrap();
        frame.copy_from(&FrameView::argb(16, 16, &data, 64)).unwrap();
        let serial = frame.serial();
        pool.release(frame);

        let again = pool.acquire().unwrap();
        assert_eq!(again.serial(), serial);
        assert_eq!(again.state(), FrameState::Acquired);
        // Buffers survive recycling
        assert!(again.desc().capacity() >= 16 * 16 * 4);
    }

    #[test]
    fn test_frame_pool_exhaustion() {
        let pool = FramePool::new(2, 2);

        let f1 = pool.acquire().unwrap();
        let _f2 = pool.acquire().unwrap();
        assert!(pool.acquire().is_none(), "Pool should be exhausted");
        assert_eq!(pool.stats().exhausted, 1);

        pool.release(f1);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn test_release_none_is_noop() {
        let pool = FramePool::default();
        pool.release(None);
        assert_eq!(pool.stats().free, 0);
    }

    #[test]
    fn test_free_list_is_bounded() {
        let pool = FramePool::new(2, 8);
        let frames: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();

        for frame in frames {
            pool.release(frame);
        }

        let stats = pool.stats();
        assert_eq!(stats.free, 2);
        assert_eq!(stats.live, 2);
        assert_eq!(stats.discarded, 3);
    }

    #[test]
    fn test_conservation_under_threads() {
        let pool = FramePool::new(8, 64);

        crossbeam::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    for _ in 0..500 {
                        if let Some(frame) = pool.acquire() {
                            pool.release(frame);
                        }
                    }
                });
            }
        })
        .unwrap();

        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.live, stats.free);
        assert_eq!(
            stats.created,
            stats.live as u64 + stats.discarded,
            "every constructed object is free or was discarded"
        );
    }

    #[test]
    fn test_trim() {
        let pool = FramePool::new(4, 4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.trim(), 2);
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "wrong pool")]
    fn test_foreign_release_asserts() {
        let a = FramePool::default();
        let b = FramePool::default();
        b.release(a.acquire().unwrap());
    }
}
