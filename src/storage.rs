//! Event buffer storage: thread-local pools, the shared global pool, and the
//! escalation ladder between them.
//!
//! Per-thread interaction with a buffer runs EMPTY → WRITING → FULL →
//! flushed back to EMPTY. When a record outgrows the thread's dedicated
//! buffer the write escalates: the dedicated buffer is drained into a buffer
//! leased from the global pool (or, under pressure, a one-shot transient
//! allocation), the partially-written record follows, and the writer carries
//! on — no bytes written so far are ever lost to an escalation.
//!
//! Nothing on the recording path blocks on memory: every acquisition failure
//! degrades to data-loss accounting. The only lock a producer may contend on
//! is the discard valve, and that one is try-lock by design — losing the
//! race means someone else is already shedding load.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::buffer::{Buffer, BufferContext, WriterId};
use crate::chunk::ChunkWriter;
use crate::mspace::{MemorySpace, RetrievalPolicy};
use crate::options::RecorderOptions;
use crate::stats::RecorderStats;

pub struct Storage {
    thread_local: MemorySpace,
    global: MemorySpace,
    /// Writer token → dedicated thread-local buffer.
    registry: Mutex<FxHashMap<u64, Arc<Buffer>>>,
    discard_lock: Mutex<()>,
    discard_threshold: usize,
    lease_retries: usize,
    thread_buffer_size: usize,
    stats: Arc<RecorderStats>,
}

impl Storage {
    pub fn new(options: &RecorderOptions, stats: Arc<RecorderStats>) -> Self {
        Self {
            thread_local: MemorySpace::new(
                options.thread_buffer_size,
                options.thread_cache_count,
                RetrievalPolicy::ThreadExclusive,
                BufferContext::ThreadLocal,
            ),
            global: MemorySpace::new(
                options.global_buffer_size,
                options.global_cache_count,
                RetrievalPolicy::Alternating,
                BufferContext::Global,
            ),
            registry: Mutex::new(FxHashMap::default()),
            discard_lock: Mutex::new(()),
            discard_threshold: options.full_list_discard_threshold,
            lease_retries: options.lease_retries,
            thread_buffer_size: options.thread_buffer_size,
            stats,
        }
    }

    pub fn stats(&self) -> &RecorderStats {
        &self.stats
    }

    /// Get-or-install the calling writer's dedicated buffer. `None` only on
    /// allocation exhaustion; the caller degrades to data loss.
    pub fn acquire_thread_local(&self, id: WriterId) -> Option<Arc<Buffer>> {
        if let Some(buf) = self.registry.lock().get(&id.as_u64()) {
            debug_assert!(buf.acquired_by(id));
            return Some(Arc::clone(buf));
        }
        let Some(buf) = self.thread_local.acquire(id, self.thread_buffer_size) else {
            warn!(writer = id.as_u64(), "thread buffer allocation failed");
            return None;
        };
        self.registry.lock().insert(id.as_u64(), Arc::clone(&buf));
        Some(buf)
    }

    /// Make room for `requested` more bytes while `used` in-flight bytes sit
    /// beyond `cur`'s committed position.
    ///
    /// Returns the buffer to continue writing into: `cur` itself after
    /// compaction when the request fits, otherwise a larger lease or
    /// transient buffer that has received both the committed range and the
    /// in-flight bytes. `None` means allocation exhaustion; the in-flight
    /// record is abandoned by the caller.
    pub fn flush(
        &self,
        cur: &Arc<Buffer>,
        used: usize,
        requested: usize,
        id: WriterId,
    ) -> Option<Arc<Buffer>> {
        debug_assert!(cur.acquired_by(id));
        if cur.context() == BufferContext::ThreadLocal
            && used + requested <= cur.free_size() + cur.stable_top()
        {
            cur.compact(used);
            return Some(Arc::clone(cur));
        }
        let need = cur.unflushed_size() + used + requested;
        let large = self.acquire_large(id, need)?;
        // Committed range first, then the partially-written record; the
        // shelved buffer ends up drained and stays registered as the
        // writer's dedicated buffer.
        cur.flush_with(|bytes| {
            // SAFETY: we own `large` and the range is within its capacity
            // (`need` was the acquisition size).
            unsafe { large.write_unbuffered(large.pos(), bytes) };
            large.set_pos(large.pos() + bytes.len());
        });
        cur.move_into(&large, used);
        if cur.context() != BufferContext::ThreadLocal {
            // A lease that itself overflowed: it is drained now, hand it
            // back before the writer forgets it.
            self.global.release(cur);
        }
        Some(large)
    }

    fn acquire_large(&self, id: WriterId, need: usize) -> Option<Arc<Buffer>> {
        for _ in 0..self.lease_retries.max(1) {
            if let Some(lease) = self.global.acquire(id, need) {
                lease.set_lease();
                self.stats.add_lease();
                return Some(lease);
            }
        }
        let transient = self.global.allocate(need)?;
        transient.set_transient();
        let acquired = transient.try_acquire(id);
        debug_assert!(acquired);
        self.global.adopt(&transient);
        self.stats.add_transient();
        debug!(writer = id.as_u64(), need, "escalated to transient buffer");
        Some(transient)
    }

    /// Hand back a lease or transient buffer once the oversized record has
    /// committed. Content that fits the writer's dedicated buffer moves
    /// back; content that does not is retired onto the full list for the
    /// recorder to drain.
    pub fn release_large(&self, large: &Arc<Buffer>, id: WriterId) {
        debug_assert!(large.is_lease() || large.is_transient());
        debug_assert!(large.acquired_by(id));
        let unflushed = large.unflushed_size();
        if unflushed > 0 {
            let dedicated = self.registry.lock().get(&id.as_u64()).cloned();
            match dedicated {
                Some(home) if home.free_size() >= unflushed => {
                    large.flush_with(|bytes| {
                        // SAFETY: `home` is owned by the same writer and the
                        // fit was checked above.
                        unsafe { home.write_unbuffered(home.pos(), bytes) };
                        home.set_pos(home.pos() + bytes.len());
                    });
                }
                _ => {
                    self.global.register_full(large);
                    large.release();
                    return;
                }
            }
        }
        self.global.release(large);
    }

    /// Retire a writer's dedicated buffer, preserving any unflushed content
    /// on the full list. Called when a thread stops recording.
    pub fn release_thread(&self, id: WriterId) {
        let Some(buf) = self.registry.lock().remove(&id.as_u64()) else {
            return;
        };
        if buf.unflushed_size() > 0 {
            self.thread_local.register_full(&buf);
            buf.release();
        } else {
            self.thread_local.release(&buf);
        }
    }

    /// Full buffers pending drain across both pools.
    pub fn full_count(&self) -> usize {
        self.global.full_count() + self.thread_local.full_count()
    }

    /// True once the full list is deep enough that the backpressure valve
    /// should open.
    pub fn should_discard(&self) -> bool {
        self.full_count() > self.discard_threshold
    }

    /// Backpressure valve: discard oldest full buffers until below the
    /// threshold. Try-lock — a producer that loses the race just proceeds.
    pub fn discard_oldest(&self) {
        let Some(_guard) = self.discard_lock.try_lock() else {
            return;
        };
        while self.full_count() > self.discard_threshold {
            let Some(buf) = self
                .global
                .pop_full()
                .or_else(|| self.thread_local.pop_full())
            else {
                break;
            };
            let lost = buf.discard();
            self.stats.add_discarded_buffer(lost as u64);
            self.owner_of(&buf).release(&buf);
        }
    }

    fn owner_of(&self, buf: &Arc<Buffer>) -> &MemorySpace {
        match buf.context() {
            BufferContext::ThreadLocal => &self.thread_local,
            _ => &self.global,
        }
    }

    /// Mid-chunk flush: drain retired buffers and the live lists into the
    /// chunk, preserving buffer ownership and pool membership.
    pub fn write(&self, chunk: &mut ChunkWriter) -> io::Result<u64> {
        self.write_pass(chunk, false)
    }

    /// Rotation-time drain: in addition to flushing, scavenge dedicated
    /// buffers whose writers are gone so pool growth stays bounded.
    pub fn write_at_safepoint(&self, chunk: &mut ChunkWriter) -> io::Result<u64> {
        self.write_pass(chunk, true)
    }

    fn write_pass(&self, chunk: &mut ChunkWriter, scavenge: bool) -> io::Result<u64> {
        let mut written = 0u64;
        let mut result = Ok(());

        for space in [&self.global, &self.thread_local] {
            space.drain_full(|buf| {
                if result.is_ok() {
                    result = buf.flush_with(|bytes| {
                        written += bytes.len() as u64;
                        chunk.append_record_bytes(bytes)
                    });
                } else {
                    // The chunk already failed; content cannot be retried
                    // without unbounding memory, so it becomes counted loss.
                    self.stats.add_discarded_buffer(buf.discard() as u64);
                }
                space.release(buf);
            });
            space.for_each_live(|buf| {
                if result.is_ok() && !buf.is_empty() {
                    result = buf.flush_with(|bytes| {
                        written += bytes.len() as u64;
                        chunk.append_record_bytes(bytes)
                    });
                }
                if scavenge && buf.is_free() {
                    if !buf.is_empty() {
                        self.stats.add_discarded_buffer(buf.discard() as u64);
                    }
                    space.release(buf);
                    return false;
                }
                true
            });
        }
        if scavenge {
            self.registry.lock().retain(|_, buf| !buf.is_free());
        }
        result.map(|_| written)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("thread_local", &self.thread_local)
            .field("global", &self.global)
            .field("full_count", &self.full_count())
            .finish()
    }
}
