//! Stack trace deduplication.
//!
//! The stack-walking collaborator hands over raw frames; this repository
//! content-hashes them and hands back a small trace id. Identical stacks
//! recorded any number of times in one epoch share one id and one physical
//! checkpoint entry.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

use crate::checkpoint::CheckpointWriter;
use crate::chunk::format::POOL_STACK_TRACE;
use crate::epoch::EpochState;

use super::table::EpochRepository;

/// Frames deeper than this are cut off and the trace marked truncated.
pub const MAX_FRAMES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Interpreted = 0,
    Jit = 1,
    Inlined = 2,
    Native = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackFrame {
    pub method_id: u64,
    pub line: u32,
    pub bci: u32,
    pub kind: FrameKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StackTrace {
    frames: Vec<StackFrame>,
    truncated: bool,
}

pub struct StackTraceRepository {
    traces: EpochRepository<StackTrace>,
}

impl StackTraceRepository {
    pub fn new(max_entries: usize) -> Self {
        Self {
            traces: EpochRepository::new(max_entries),
        }
    }

    /// Deduplicating insert into the current epoch. Returns the trace id,
    /// or 0 when the trace could not be recorded — callers omit the field.
    pub fn record(&self, epoch: &EpochState, frames: &[StackFrame]) -> u64 {
        if frames.is_empty() {
            return 0;
        }
        let truncated = frames.len() > MAX_FRAMES;
        let frames = &frames[..frames.len().min(MAX_FRAMES)];
        let mut hasher = FxHasher::default();
        frames.hash(&mut hasher);
        truncated.hash(&mut hasher);
        let hash = hasher.finish();
        self.traces.record_with(
            epoch,
            hash,
            |trace| trace.truncated == truncated && trace.frames == frames,
            || StackTrace {
                frames: frames.to_vec(),
                truncated,
            },
        )
    }

    /// Serialize one side as a checkpoint pool section. `clear` excises the
    /// side in the same pass (rotation); without it the side keeps its
    /// entries and only unserialized ones are emitted (mid-chunk flush).
    pub fn write(
        &self,
        side: usize,
        generation: u16,
        clear: bool,
        writer: &mut CheckpointWriter<'_>,
    ) -> usize {
        let rewind = writer.context();
        writer.write_type(POOL_STACK_TRACE);
        let emitted =
            self.traces
                .write_side(side, generation, clear, writer, |id, trace, writer| {
                    writer.write_u64(id);
                    writer.write_u64(u64::from(trace.truncated));
                    writer.write_u64(trace.frames.len() as u64);
                    for frame in &trace.frames {
                        writer.write_u64(frame.method_id);
                        writer.write_u64(u64::from(frame.line));
                        writer.write_u64(u64::from(frame.bci));
                        writer.write_u64(frame.kind as u64);
                    }
                });
        if emitted == 0 {
            writer.set_context(rewind);
        }
        emitted
    }

    pub fn on_rotation(&self, epoch: &EpochState) {
        self.traces.on_rotation(epoch);
    }

    pub fn live_count(&self, epoch: &EpochState) -> usize {
        self.traces.live_count(epoch)
    }
}
