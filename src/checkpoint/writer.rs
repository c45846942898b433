//! Checkpoint (constant-pool) event construction.
//!
//! A writer stages one checkpoint record — header, then pool sections — and
//! commits it into a checkpoint buffer as a unit. The record carries a
//! zeroed backward-delta slot that the chunk writer patches when the record
//! reaches the file, and padded count slots patched here as sections close.
//!
//! State machine: Open (header staged) → Writing (`write_type` per pool,
//! entries counted) → Closed (slots patched, record committed) or Rewound
//! (no sections written → nothing emitted). A writer constructed without a
//! backing buffer is *invalid*: every write is a no-op and close emits
//! nothing, because checkpoint data is best-effort metadata.

use std::sync::Arc;

use crate::buffer::{Buffer, WriterId};
use crate::chunk::format::{self, padded_u32, PADDED_U32_SIZE};
use crate::clock;
use crate::mspace::MemorySpace;
use crate::stats::RecorderStats;

use super::blob::{BlobChain, CheckpointBlob, WrittenSet};

/// Offset + section count pair capturing a writer's position, for blob
/// extraction. Only valid at section boundaries.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointContext {
    offset: usize,
    pool_count: u32,
}

pub struct CheckpointWriter<'a> {
    mspace: &'a MemorySpace,
    stats: &'a RecorderStats,
    target: Option<Arc<Buffer>>,
    id: WriterId,
    record: Vec<u8>,
    pool_count: u32,
    count_slot: usize,
    entry_slot: Option<usize>,
    entry_count: u32,
    /// One-shot writers retire their buffer at commit instead of leaving it
    /// installed for reuse.
    one_shot: bool,
}

impl<'a> CheckpointWriter<'a> {
    pub(super) fn new(
        mspace: &'a MemorySpace,
        stats: &'a RecorderStats,
        target: Option<Arc<Buffer>>,
        id: WriterId,
        kind: u64,
    ) -> Self {
        Self::with_mode(mspace, stats, target, id, kind, false)
    }

    pub(super) fn one_shot(
        mspace: &'a MemorySpace,
        stats: &'a RecorderStats,
        target: Option<Arc<Buffer>>,
        id: WriterId,
        kind: u64,
    ) -> Self {
        Self::with_mode(mspace, stats, target, id, kind, true)
    }

    fn with_mode(
        mspace: &'a MemorySpace,
        stats: &'a RecorderStats,
        target: Option<Arc<Buffer>>,
        id: WriterId,
        kind: u64,
        one_shot: bool,
    ) -> Self {
        let mut record = Vec::new();
        record.extend_from_slice(&[0; PADDED_U32_SIZE]);
        format::put_var_u64(&mut record, format::EVENT_CHECKPOINT);
        format::put_var_u64(&mut record, clock::ticks_now());
        format::put_var_u64(&mut record, 0); // duration
        record.extend_from_slice(&padded_u32(0)); // delta, patched by the chunk writer
        format::put_var_u64(&mut record, kind);
        let count_slot = record.len();
        record.extend_from_slice(&padded_u32(0));
        Self {
            mspace,
            stats,
            target,
            id,
            record,
            pool_count: 0,
            count_slot,
            entry_slot: None,
            entry_count: 0,
            one_shot,
        }
    }

    /// False when no backing buffer could be acquired; all operations are
    /// silent no-ops in that case.
    pub fn is_valid(&self) -> bool {
        self.target.is_some()
    }

    /// Open a pool section. Entries written next belong to `pool_type`
    /// until the next `write_type` or close.
    pub fn write_type(&mut self, pool_type: u64) {
        if !self.is_valid() {
            return;
        }
        self.close_section();
        format::put_var_u64(&mut self.record, pool_type);
        self.entry_slot = Some(self.record.len());
        self.record.extend_from_slice(&padded_u32(0));
        self.pool_count += 1;
    }

    fn close_section(&mut self) {
        if let Some(slot) = self.entry_slot.take() {
            self.record[slot..slot + PADDED_U32_SIZE]
                .copy_from_slice(&padded_u32(self.entry_count));
            self.entry_count = 0;
        }
    }

    /// Count one entry in the open section.
    pub fn increment(&mut self) {
        self.entry_count += 1;
    }

    pub fn write_u64(&mut self, value: u64) {
        if self.is_valid() {
            format::put_var_u64(&mut self.record, value);
        }
    }

    pub fn write_i64(&mut self, value: i64) {
        if self.is_valid() {
            format::put_var_i64(&mut self.record, value);
        }
    }

    pub fn write_string(&mut self, value: &str) {
        if self.is_valid() {
            format::put_string(&mut self.record, value);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.is_valid() {
            self.record.extend_from_slice(bytes);
        }
    }

    // --- blob extraction and composition ---------------------------------

    /// Current position, for later [`copy_since`](Self::copy_since) or
    /// [`move_since`](Self::move_since). Must be taken at a section
    /// boundary.
    pub fn context(&self) -> CheckpointContext {
        CheckpointContext {
            offset: self.record.len(),
            pool_count: self.pool_count,
        }
    }

    /// Rewind to a previously captured context, dropping everything staged
    /// after it.
    pub fn set_context(&mut self, ctx: CheckpointContext) {
        debug_assert!(ctx.offset <= self.record.len());
        self.close_section();
        self.record.truncate(ctx.offset);
        self.pool_count = ctx.pool_count;
        self.entry_slot = None;
        self.entry_count = 0;
    }

    /// Snapshot the sections staged since `ctx` into a blob, leaving the
    /// writer's content in place.
    pub fn copy_since(&mut self, ctx: CheckpointContext) -> Option<BlobChain> {
        if !self.is_valid() || self.record.len() <= ctx.offset {
            return None;
        }
        self.close_section();
        let bytes = self.record[ctx.offset..].to_vec();
        Some(CheckpointBlob::new(bytes, self.pool_count - ctx.pool_count))
    }

    /// Cut the sections staged since `ctx` out into a blob, rewinding the
    /// writer to `ctx`.
    pub fn move_since(&mut self, ctx: CheckpointContext) -> Option<BlobChain> {
        let blob = self.copy_since(ctx)?;
        self.set_context(ctx);
        Some(blob)
    }

    /// Re-emit every blob in the chain into this record.
    pub fn write_blobs(&mut self, chain: &BlobChain) {
        if !self.is_valid() {
            return;
        }
        self.close_section();
        chain.for_each(|blob| {
            self.record.extend_from_slice(blob.bytes());
            self.pool_count += blob.pool_count();
        });
    }

    /// Emit each blob in the chain at most once per pass, as tracked by
    /// `written`. A chain shared by several checkpoint writers in one
    /// rotation is physically emitted by whichever writer reaches it first.
    pub fn exclusive_write_blobs(&mut self, chain: &BlobChain, written: &mut WrittenSet) {
        if !self.is_valid() {
            return;
        }
        self.close_section();
        chain.for_each(|blob| {
            if written.first_emission(blob.id()) {
                self.record.extend_from_slice(blob.bytes());
                self.pool_count += blob.pool_count();
            }
        });
    }

    /// Patch the header slots and commit the record into the backing
    /// buffer. Returns the committed size; 0 means nothing was emitted
    /// (invalid writer, empty record, or exhaustion — the latter counted as
    /// loss).
    pub fn commit(mut self) -> usize {
        let Some(target) = self.target.take() else {
            return 0;
        };
        if self.pool_count == 0 {
            if self.one_shot {
                self.mspace.release(&target);
            }
            return 0;
        }
        self.close_section();
        self.record[self.count_slot..self.count_slot + PADDED_U32_SIZE]
            .copy_from_slice(&padded_u32(self.pool_count));
        let size = self.record.len();
        self.record[..PADDED_U32_SIZE].copy_from_slice(&padded_u32(size as u32));

        if target.free_size() >= size {
            Self::commit_into(&target, &self.record);
            if self.one_shot {
                self.mspace.register_full(&target);
                target.release();
            }
            return size;
        }
        // The backing buffer is out of room: retire the record into a
        // one-shot buffer on the full list instead.
        if self.one_shot {
            self.mspace.release(&target);
        }
        match self.mspace.acquire(self.id, size) {
            Some(overflow) => {
                Self::commit_into(&overflow, &self.record);
                self.mspace.register_full(&overflow);
                overflow.release();
                size
            }
            None => {
                self.stats.add_lost(size as u64);
                0
            }
        }
    }

    fn commit_into(target: &Arc<Buffer>, record: &[u8]) {
        let pos = target.pos();
        // SAFETY: the caller owns `target` and the fit was checked.
        unsafe { target.write_unbuffered(pos, record) };
        target.set_pos(pos + record.len());
    }
}
