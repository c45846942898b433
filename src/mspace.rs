//! Buffer pool management: free list, live list, full list.
//!
//! A `MemorySpace` owns every buffer it hands out. Buffers move
//! free → acquired (live) → retired (full) → drained → free, and are on at
//! most one list at any instant. The free list is bounded by a cache-count
//! target; buffers beyond it are dropped on release so peak memory stays
//! bounded after a burst.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferContext, WriterId};

/// How `acquire` scans the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalPolicy {
    /// Scan head to tail, first fit.
    Sequential,
    /// Alternate scan direction per call, spreading contention off the head.
    Alternating,
    /// Pop the head unconditionally; only valid for pools where cross-thread
    /// contention for one buffer cannot occur.
    ThreadExclusive,
}

pub struct MemorySpace {
    min_element_size: usize,
    cache_count: usize,
    policy: RetrievalPolicy,
    context: BufferContext,
    free: Mutex<VecDeque<Arc<Buffer>>>,
    live: Mutex<Vec<Arc<Buffer>>>,
    full: Mutex<VecDeque<Arc<Buffer>>>,
    scan_reverse: AtomicBool,
}

impl MemorySpace {
    pub fn new(
        min_element_size: usize,
        cache_count: usize,
        policy: RetrievalPolicy,
        context: BufferContext,
    ) -> Self {
        debug_assert!(min_element_size > 0);
        Self {
            min_element_size,
            cache_count,
            policy,
            context,
            free: Mutex::new(VecDeque::new()),
            live: Mutex::new(Vec::new()),
            full: Mutex::new(VecDeque::new()),
            scan_reverse: AtomicBool::new(false),
        }
    }

    pub fn min_element_size(&self) -> usize {
        self.min_element_size
    }

    /// Round a request up to the pool's allocation granularity: the smallest
    /// power-of-two multiple of the minimum element size that fits it.
    pub fn aligned_size(&self, size: usize) -> usize {
        let mut capacity = self.min_element_size;
        while capacity < size {
            capacity *= 2;
        }
        capacity
    }

    /// Heap-allocate a fresh buffer. `None` means allocation failure, which
    /// callers handle by degrading (data loss), never by aborting.
    pub fn allocate(&self, size: usize) -> Option<Arc<Buffer>> {
        Buffer::try_alloc(self.aligned_size(size), self.context)
    }

    /// Acquire a buffer with at least `size` free bytes for `id`, pulling
    /// from the free list or allocating. The buffer lands on the live list.
    pub fn acquire(&self, id: WriterId, size: usize) -> Option<Arc<Buffer>> {
        if let Some(buf) = self.pop_free(id, size) {
            self.live.lock().push(Arc::clone(&buf));
            return Some(buf);
        }
        let buf = self.allocate(size)?;
        let acquired = buf.try_acquire(id);
        debug_assert!(acquired, "fresh buffer already owned");
        self.live.lock().push(Arc::clone(&buf));
        Some(buf)
    }

    fn pop_free(&self, id: WriterId, size: usize) -> Option<Arc<Buffer>> {
        let mut free = self.free.lock();
        match self.policy {
            RetrievalPolicy::ThreadExclusive => {
                // The caller serializes access to this pool, so the head is
                // never contended; still CAS the identity to keep the
                // ownership invariant checkable.
                let buf = free.pop_front()?;
                if buf.capacity() >= size && buf.try_acquire(id) {
                    Some(buf)
                } else {
                    free.push_front(buf);
                    None
                }
            }
            RetrievalPolicy::Sequential => Self::scan(&mut free, id, size, false),
            RetrievalPolicy::Alternating => {
                let reverse = self.scan_reverse.fetch_xor(true, Ordering::Relaxed);
                Self::scan(&mut free, id, size, reverse)
            }
        }
    }

    fn scan(
        free: &mut VecDeque<Arc<Buffer>>,
        id: WriterId,
        size: usize,
        reverse: bool,
    ) -> Option<Arc<Buffer>> {
        let len = free.len();
        for i in 0..len {
            let index = if reverse { len - 1 - i } else { i };
            let candidate = &free[index];
            if candidate.capacity() >= size && candidate.try_acquire(id) {
                return free.remove(index);
            }
        }
        None
    }

    /// Return a buffer to the pool. Transient buffers are dropped
    /// immediately; pooled buffers are reinitialized and cached up to the
    /// cache-count target, then dropped.
    pub fn release(&self, buf: &Arc<Buffer>) {
        self.remove_live(buf);
        if buf.is_transient() {
            return;
        }
        if !buf.is_free() {
            buf.release();
        }
        buf.reinitialize();
        let mut free = self.free.lock();
        debug_assert!(
            !free.iter().any(|b| Arc::ptr_eq(b, buf)),
            "buffer already on free list"
        );
        if free.len() < self.cache_count {
            free.push_back(Arc::clone(buf));
        }
    }

    /// Track an externally-allocated buffer (a transient) on the live list
    /// so flush passes can see it until it retires.
    pub fn adopt(&self, buf: &Arc<Buffer>) {
        self.live.lock().push(Arc::clone(buf));
    }

    fn remove_live(&self, buf: &Arc<Buffer>) {
        let mut live = self.live.lock();
        if let Some(at) = live.iter().position(|b| Arc::ptr_eq(b, buf)) {
            live.swap_remove(at);
        }
    }

    /// Retire a buffer onto the full list, pending drain by the recorder.
    pub fn register_full(&self, buf: &Arc<Buffer>) {
        buf.set_retired();
        self.remove_live(buf);
        let mut full = self.full.lock();
        debug_assert!(
            !full.iter().any(|b| Arc::ptr_eq(b, buf)),
            "buffer already on full list"
        );
        full.push_back(Arc::clone(buf));
    }

    /// Oldest retired buffer, if any.
    pub fn pop_full(&self) -> Option<Arc<Buffer>> {
        self.full.lock().pop_front()
    }

    pub fn full_count(&self) -> usize {
        self.full.lock().len()
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Drain every retired buffer through `f` in retirement order.
    pub fn drain_full(&self, mut f: impl FnMut(&Arc<Buffer>)) {
        while let Some(buf) = self.pop_full() {
            f(&buf);
        }
    }

    /// Visit live buffers; `f` returns `false` to excise the buffer during
    /// the same pass (the write-then-release composite used on rotation).
    pub fn for_each_live(&self, mut f: impl FnMut(&Arc<Buffer>) -> bool) {
        let snapshot: Vec<Arc<Buffer>> = self.live.lock().clone();
        for buf in snapshot {
            if !f(&buf) {
                self.remove_live(&buf);
            }
        }
    }
}

impl std::fmt::Debug for MemorySpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySpace")
            .field("min_element_size", &self.min_element_size)
            .field("cache_count", &self.cache_count)
            .field("policy", &self.policy)
            .field("free", &self.free_count())
            .field("live", &self.live_count())
            .field("full", &self.full_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(policy: RetrievalPolicy) -> MemorySpace {
        MemorySpace::new(256, 4, policy, BufferContext::Global)
    }

    #[test]
    fn test_aligned_size_rounds_to_pow2_multiples() {
        let m = space(RetrievalPolicy::Sequential);
        assert_eq!(m.aligned_size(1), 256);
        assert_eq!(m.aligned_size(256), 256);
        assert_eq!(m.aligned_size(257), 512);
        assert_eq!(m.aligned_size(700), 1024);
    }

    #[test]
    fn test_acquire_release_reuses_buffers() {
        let m = space(RetrievalPolicy::Sequential);
        let id = WriterId::new(1);
        let a = m.acquire(id, 100).unwrap();
        assert_eq!(m.live_count(), 1);
        m.release(&a);
        assert_eq!(m.free_count(), 1);
        let b = m.acquire(id, 100).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(m.free_count(), 0);
    }

    #[test]
    fn test_free_list_bounded_by_cache_count() {
        let m = space(RetrievalPolicy::Sequential);
        let id = WriterId::new(1);
        let bufs: Vec<_> = (0..10).map(|_| m.acquire(id, 64).unwrap()).collect();
        for b in &bufs {
            m.release(b);
        }
        assert_eq!(m.free_count(), 4);
        assert_eq!(m.live_count(), 0);
    }

    #[test]
    fn test_transient_buffers_never_pooled() {
        let m = space(RetrievalPolicy::Sequential);
        let id = WriterId::new(1);
        let buf = m.acquire(id, 64).unwrap();
        buf.set_transient();
        m.release(&buf);
        assert_eq!(m.free_count(), 0);
    }

    #[test]
    fn test_sequential_scan_skips_undersized() {
        let m = space(RetrievalPolicy::Sequential);
        let id = WriterId::new(1);
        let small = m.acquire(id, 64).unwrap();
        let large = m.acquire(id, 1000).unwrap();
        m.release(&small);
        m.release(&large);
        let got = m.acquire(id, 1000).unwrap();
        assert!(Arc::ptr_eq(&got, &large));
        // The small buffer is still cached.
        assert_eq!(m.free_count(), 1);
    }

    #[test]
    fn test_full_list_drains_in_order() {
        let m = space(RetrievalPolicy::Sequential);
        let id = WriterId::new(1);
        let a = m.acquire(id, 64).unwrap();
        let b = m.acquire(id, 64).unwrap();
        m.register_full(&a);
        m.register_full(&b);
        assert!(a.is_retired());
        assert_eq!(m.full_count(), 2);
        let mut drained = Vec::new();
        m.drain_full(|buf| drained.push(Arc::clone(buf)));
        assert_eq!(drained.len(), 2);
        assert!(Arc::ptr_eq(&drained[0], &a));
        assert!(Arc::ptr_eq(&drained[1], &b));
        assert_eq!(m.live_count(), 0);
    }

    #[test]
    fn test_live_iteration_excises() {
        let m = space(RetrievalPolicy::Sequential);
        let id = WriterId::new(1);
        let _a = m.acquire(id, 64).unwrap();
        let _b = m.acquire(id, 64).unwrap();
        m.for_each_live(|_| false);
        assert_eq!(m.live_count(), 0);
    }

    #[test]
    fn test_concurrent_acquire_no_shared_ownership() {
        let m = Arc::new(space(RetrievalPolicy::Alternating));
        // Seed a few free buffers so threads contend on reuse.
        let seed_id = WriterId::new(99);
        let seeded: Vec<_> = (0..3).map(|_| m.acquire(seed_id, 64).unwrap()).collect();
        for b in &seeded {
            m.release(b);
        }
        std::thread::scope(|s| {
            for t in 1..=6u64 {
                let m = Arc::clone(&m);
                s.spawn(move || {
                    let id = WriterId::new(t);
                    for _ in 0..200 {
                        if let Some(buf) = m.acquire(id, 64) {
                            assert!(buf.acquired_by(id));
                            m.release(&buf);
                        }
                    }
                });
            }
        });
        assert_eq!(m.live_count(), 0);
    }
}
