//! Fixed-capacity event buffer with single-owner write discipline.
//!
//! ## Cursor layout
//! ```text
//!   0 ............ top ............ pos ............ capacity
//!   |  flushed     |  committed     |  in-flight / free
//! ```
//!
//! `pos` is the committed write cursor: it only advances once a record is
//! fully written, so `[top, pos)` always holds a whole number of complete
//! records. `top` is the flushed cursor advanced by whoever drains the
//! buffer. Writers publish with a release store on `pos`; the drain side
//! reads `pos` with acquire, which also publishes the payload bytes below it.
//!
//! Ownership is a CAS on `identity` (0 = free). At most one writer holds a
//! buffer at a time; the drain side never takes ownership, it synchronizes
//! through `pos`/`top` alone. `top` doubles as a critical-section word: a
//! drainer or compactor swaps in a sentinel while it works on the flushed
//! boundary so two of them cannot race on the same shared buffer.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// Identity token of a writer thread. Zero is reserved for "unowned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriterId(u64);

impl WriterId {
    pub fn new(token: u64) -> Self {
        debug_assert_ne!(token, 0, "writer identity 0 is reserved");
        Self(token)
    }

    /// Identity of the calling thread.
    pub fn current() -> Self {
        Self::new(crate::clock::current_thread_token())
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Which pool a buffer belongs to, selecting its release policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferContext {
    Global,
    ThreadLocal,
    CheckpointGlobal,
    CheckpointThreadLocal,
    CheckpointVirtualThread,
}

const FLAG_RETIRED: u8 = 1 << 0;
const FLAG_TRANSIENT: u8 = 1 << 1;
const FLAG_LEASE: u8 = 1 << 2;

/// `top` value marking an in-progress critical section on the flushed
/// boundary.
const TOP_CRITICAL: usize = usize::MAX;

pub struct Buffer {
    identity: CachePadded<AtomicU64>,
    pos: AtomicUsize,
    top: AtomicUsize,
    flags: AtomicU8,
    context: BufferContext,
    data: Box<[UnsafeCell<u8>]>,
}

// SAFETY: payload bytes are only written by the thread holding `identity`
// and only below `pos` after a release store publishes them; concurrent
// readers stay within `[top, pos)` loaded with acquire ordering.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("pos", &self.pos())
            .field("top", &self.stable_top())
            .field("context", &self.context)
            .finish()
    }
}

impl Buffer {
    /// Allocate a buffer, returning `None` if the heap reservation fails.
    /// Allocation failure here is recoverable by design: callers degrade to
    /// data loss, never abort.
    pub fn try_alloc(capacity: usize, context: BufferContext) -> Option<Arc<Buffer>> {
        let mut cells: Vec<UnsafeCell<u8>> = Vec::new();
        cells.try_reserve_exact(capacity).ok()?;
        cells.extend((0..capacity).map(|_| UnsafeCell::new(0)));
        Some(Arc::new(Buffer {
            identity: CachePadded::new(AtomicU64::new(0)),
            pos: AtomicUsize::new(0),
            top: AtomicUsize::new(0),
            flags: AtomicU8::new(0),
            context,
            data: cells.into_boxed_slice(),
        }))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn context(&self) -> BufferContext {
        self.context
    }

    // --- ownership -------------------------------------------------------

    /// Non-blocking ownership attempt. Fails if another writer holds the
    /// buffer.
    #[inline]
    pub fn try_acquire(&self, id: WriterId) -> bool {
        self.identity
            .compare_exchange(0, id.as_u64(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Spin until ownership is acquired. Only used on paths where the
    /// current holder is known to release promptly.
    pub fn acquire(&self, id: WriterId) {
        while !self.try_acquire(id) {
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub fn identity(&self) -> u64 {
        self.identity.load(Ordering::Acquire)
    }

    #[inline]
    pub fn acquired_by(&self, id: WriterId) -> bool {
        self.identity() == id.as_u64()
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.identity() == 0
    }

    /// Drop ownership. The buffer must be drained (or the caller must have
    /// arranged for someone else to drain it); releasing a buffer with live
    /// in-flight bytes is a programming error.
    pub fn release(&self) {
        debug_assert_ne!(self.identity(), 0, "releasing an unowned buffer");
        self.identity.store(0, Ordering::Release);
    }

    // --- cursors ---------------------------------------------------------

    /// Committed write position.
    #[inline]
    pub fn pos(&self) -> usize {
        self.pos.load(Ordering::Acquire)
    }

    /// Publish a new committed position. Owner-only; every byte below `new`
    /// must already be written.
    #[inline]
    pub(crate) fn set_pos(&self, new: usize) {
        debug_assert!(new <= self.capacity());
        self.pos.store(new, Ordering::Release);
    }

    /// Flushed position, waiting out any in-progress critical section.
    pub fn stable_top(&self) -> usize {
        loop {
            let top = self.top.load(Ordering::Acquire);
            if top != TOP_CRITICAL {
                return top;
            }
            std::hint::spin_loop();
        }
    }

    /// Enter the critical section on the flushed boundary, returning the
    /// stable value. Must be paired with [`Buffer::release_top`].
    pub(crate) fn acquire_critical_top(&self) -> usize {
        loop {
            let top = self.top.swap(TOP_CRITICAL, Ordering::AcqRel);
            if top != TOP_CRITICAL {
                return top;
            }
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub(crate) fn release_top(&self, new: usize) {
        debug_assert!(new != TOP_CRITICAL);
        self.top.store(new, Ordering::Release);
    }

    /// Committed-but-unflushed byte count.
    #[inline]
    pub fn unflushed_size(&self) -> usize {
        self.pos().saturating_sub(self.stable_top())
    }

    /// Bytes available beyond the committed position.
    #[inline]
    pub fn free_size(&self) -> usize {
        self.capacity() - self.pos()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.unflushed_size() == 0
    }

    // --- flags -----------------------------------------------------------

    #[inline]
    fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    #[inline]
    fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn set_retired(&self) {
        self.set_flag(FLAG_RETIRED);
    }

    pub fn is_retired(&self) -> bool {
        self.has_flag(FLAG_RETIRED)
    }

    pub fn set_transient(&self) {
        self.set_flag(FLAG_TRANSIENT);
    }

    pub fn is_transient(&self) -> bool {
        self.has_flag(FLAG_TRANSIENT)
    }

    pub fn set_lease(&self) {
        self.set_flag(FLAG_LEASE);
    }

    pub fn is_lease(&self) -> bool {
        self.has_flag(FLAG_LEASE)
    }

    // --- content ---------------------------------------------------------

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        // UnsafeCell<u8> is repr(transparent), so the slice base doubles as
        // the payload base.
        self.data.as_ptr() as *mut u8
    }

    /// Write bytes into the in-flight region.
    ///
    /// # Safety
    /// Caller must hold `identity` and `offset + bytes.len()` must not
    /// exceed capacity. The range must be at or above `pos`.
    pub(crate) unsafe fn write_unbuffered(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.capacity());
        debug_assert!(offset >= self.pos());
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_ptr().add(offset), bytes.len());
    }

    /// Back-patch a reserved slot inside the in-flight record (size fields
    /// are written after the body is known).
    ///
    /// # Safety
    /// Same contract as [`Buffer::write_unbuffered`]; the caller tracks the
    /// slot offset, which always sits at or above `pos` until the record
    /// commits.
    pub(crate) unsafe fn patch_unbuffered(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.capacity());
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_ptr().add(offset), bytes.len());
    }

    /// Copy `len` in-flight bytes starting at `offset` into a vector.
    ///
    /// # Safety
    /// Caller must hold `identity`; the range must lie within
    /// `[pos, capacity)` and contain bytes it previously staged.
    pub(crate) unsafe fn read_in_flight(&self, offset: usize, len: usize) -> Vec<u8> {
        debug_assert!(offset >= self.pos());
        debug_assert!(offset + len <= self.capacity());
        let mut out = vec![0u8; len];
        std::ptr::copy_nonoverlapping(self.data_ptr().add(offset), out.as_mut_ptr(), len);
        out
    }

    /// Run `f` over the committed range and mark it flushed. The critical
    /// section on `top` keeps a concurrent discard or compaction off the
    /// same boundary.
    pub fn flush_with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let top = self.acquire_critical_top();
        let pos = self.pos();
        debug_assert!(top <= pos);
        // SAFETY: bytes in [top, pos) were published by the owner's release
        // store on `pos`; the critical section keeps `top` stable.
        let slice = unsafe { std::slice::from_raw_parts(self.data_ptr().add(top), pos - top) };
        let result = f(slice);
        self.release_top(pos);
        result
    }

    /// Run `f` over the committed range without consuming it.
    pub fn peek_committed<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let top = self.acquire_critical_top();
        let pos = self.pos();
        // SAFETY: as in `flush_with`.
        let slice = unsafe { std::slice::from_raw_parts(self.data_ptr().add(top), pos - top) };
        let result = f(slice);
        self.release_top(top);
        result
    }

    /// Drop the committed range, returning how many bytes were lost.
    pub fn discard(&self) -> usize {
        let top = self.acquire_critical_top();
        let pos = self.pos();
        self.release_top(pos);
        pos - top
    }

    /// Copy `size` in-flight bytes (starting at `pos`) into `dst`'s
    /// in-flight region. Used when escalating a write to a larger buffer:
    /// the partially-written record follows the writer, the committed range
    /// stays behind.
    pub(crate) fn move_into(&self, dst: &Buffer, size: usize) {
        let src_pos = self.pos();
        let dst_pos = dst.pos();
        debug_assert!(src_pos + size <= self.capacity());
        debug_assert!(dst_pos + size <= dst.capacity());
        let top = self.acquire_critical_top();
        // SAFETY: the source range is in-flight and only touched by the
        // owner (us); the destination range is in-flight in a buffer we also
        // own. Ranges live in distinct allocations.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data_ptr().add(src_pos),
                dst.data_ptr().add(dst_pos),
                size,
            );
        }
        self.release_top(top);
    }

    /// Slide `[top, pos + in_flight)` down to offset zero, reclaiming the
    /// flushed prefix. Returns the number of bytes reclaimed. Owner-only.
    pub(crate) fn compact(&self, in_flight: usize) -> usize {
        let top = self.acquire_critical_top();
        let pos = self.pos();
        if top == 0 {
            self.release_top(0);
            return 0;
        }
        let live = pos - top + in_flight;
        // SAFETY: the live range is owned by us and stays in bounds; the
        // regions may overlap, so use the overlapping copy.
        unsafe {
            std::ptr::copy(self.data_ptr().add(top), self.data_ptr(), live);
        }
        self.set_pos(pos - top);
        self.release_top(0);
        top
    }

    /// Reset cursors and flags for reuse from a free list. The buffer must
    /// be unowned and drained.
    pub(crate) fn reinitialize(&self) {
        debug_assert_eq!(self.identity(), 0, "reinitializing an owned buffer");
        debug_assert_eq!(self.unflushed_size(), 0, "reinitializing a live buffer");
        self.pos.store(0, Ordering::Release);
        self.top.store(0, Ordering::Release);
        self.flags.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn writer(token: u64) -> WriterId {
        WriterId::new(token)
    }

    fn owned_buffer(capacity: usize, id: WriterId) -> Arc<Buffer> {
        let buf = Buffer::try_alloc(capacity, BufferContext::ThreadLocal).unwrap();
        assert!(buf.try_acquire(id));
        buf
    }

    /// Commit `bytes` as a single already-framed record.
    fn commit(buf: &Buffer, bytes: &[u8]) {
        let pos = buf.pos();
        unsafe { buf.write_unbuffered(pos, bytes) };
        buf.set_pos(pos + bytes.len());
    }

    #[test]
    fn test_acquire_release_cycle() {
        let id = writer(7);
        let buf = Buffer::try_alloc(64, BufferContext::Global).unwrap();
        assert!(buf.is_free());
        assert!(buf.try_acquire(id));
        assert!(buf.acquired_by(id));
        assert!(!buf.try_acquire(writer(8)));
        buf.release();
        assert!(buf.is_free());
        assert!(buf.try_acquire(writer(8)));
    }

    #[test]
    fn test_no_double_ownership_under_race() {
        let buf = Buffer::try_alloc(64, BufferContext::Global).unwrap();
        let wins = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|s| {
            for t in 1..=8u64 {
                let buf = Arc::clone(&buf);
                let wins = Arc::clone(&wins);
                s.spawn(move || {
                    for _ in 0..1000 {
                        if buf.try_acquire(writer(t)) {
                            assert!(buf.acquired_by(writer(t)));
                            wins.fetch_add(1, Ordering::Relaxed);
                            buf.release();
                        }
                    }
                });
            }
        });
        assert!(wins.load(Ordering::Relaxed) > 0);
        assert!(buf.is_free());
    }

    #[test]
    fn test_cursor_invariant_holds() {
        let id = writer(1);
        let buf = owned_buffer(128, id);
        commit(&buf, &[1, 2, 3, 4]);
        commit(&buf, &[5, 6]);
        assert_eq!(buf.pos(), 6);
        assert_eq!(buf.stable_top(), 0);
        assert_eq!(buf.unflushed_size(), 6);
        assert_eq!(buf.free_size(), 122);
        buf.flush_with(|bytes| assert_eq!(bytes, &[1, 2, 3, 4, 5, 6]));
        assert_eq!(buf.unflushed_size(), 0);
        assert!(buf.stable_top() <= buf.pos());
    }

    #[test]
    fn test_discard_reports_exact_loss() {
        let id = writer(1);
        let buf = owned_buffer(64, id);
        commit(&buf, &[0u8; 17]);
        assert_eq!(buf.discard(), 17);
        assert_eq!(buf.unflushed_size(), 0);
        assert_eq!(buf.discard(), 0);
    }

    #[test]
    fn test_move_into_carries_in_flight_bytes() {
        let id = writer(1);
        let src = owned_buffer(64, id);
        let dst = owned_buffer(128, id);
        commit(&src, b"committed");
        // Stage in-flight bytes beyond pos without committing them.
        unsafe { src.write_unbuffered(src.pos(), b"partial") };
        src.move_into(&dst, 7);
        unsafe { dst.write_unbuffered(dst.pos() + 7, b"!") };
        dst.set_pos(8);
        dst.flush_with(|bytes| assert_eq!(bytes, b"partial!"));
        // The committed range stayed behind.
        src.flush_with(|bytes| assert_eq!(bytes, b"committed"));
    }

    #[test]
    fn test_compact_reclaims_flushed_prefix() {
        let id = writer(1);
        let buf = owned_buffer(32, id);
        commit(&buf, &[9u8; 10]);
        buf.flush_with(|_| ());
        commit(&buf, b"keep");
        unsafe { buf.write_unbuffered(buf.pos(), b"fly") };
        let reclaimed = buf.compact(3);
        assert_eq!(reclaimed, 10);
        assert_eq!(buf.stable_top(), 0);
        assert_eq!(buf.pos(), 4);
        buf.peek_committed(|bytes| assert_eq!(bytes, b"keep"));
        // In-flight bytes moved with the live range.
        buf.set_pos(7);
        buf.flush_with(|bytes| assert_eq!(bytes, b"keepfly"));
    }

    #[test]
    fn test_reinitialize_resets_state() {
        let id = writer(1);
        let buf = owned_buffer(32, id);
        commit(&buf, &[1, 2, 3]);
        buf.discard();
        buf.set_lease();
        buf.release();
        buf.reinitialize();
        assert_eq!(buf.pos(), 0);
        assert_eq!(buf.stable_top(), 0);
        assert!(!buf.is_lease());
    }

    #[test]
    fn test_concurrent_flush_and_commit() {
        let id = writer(1);
        let buf = owned_buffer(4096, id);
        let total_flushed = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|s| {
            let reader = Arc::clone(&buf);
            let flushed = Arc::clone(&total_flushed);
            s.spawn(move || {
                for _ in 0..200 {
                    reader.flush_with(|bytes| {
                        // Committed range must always decode as whole records
                        // of the fixed test size.
                        assert_eq!(bytes.len() % 8, 0);
                        flushed.fetch_add(bytes.len(), Ordering::Relaxed);
                    });
                    std::hint::spin_loop();
                }
            });
            let writer_buf = Arc::clone(&buf);
            s.spawn(move || {
                for i in 0..400u64 {
                    if writer_buf.free_size() < 8 {
                        break;
                    }
                    commit(&writer_buf, &i.to_be_bytes());
                }
            });
        });
        buf.flush_with(|bytes| {
            total_flushed.fetch_add(bytes.len(), Ordering::Relaxed);
        });
        assert_eq!(total_flushed.load(Ordering::Relaxed), buf.pos());
    }
}
