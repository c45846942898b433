//! Recorder configuration.
//!
//! All numeric thresholds here are tuned defaults, not correctness
//! constraints; the storage and table code must behave (possibly slowly, or
//! with more data loss) under any positive values.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RecorderError, Result};

/// Configuration for a [`FlightRecorder`](crate::recorder::FlightRecorder).
#[derive(Debug, Clone)]
pub struct RecorderOptions {
    /// Directory that receives chunk files.
    pub chunk_dir: PathBuf,
    /// Rotate to a new chunk when the current one exceeds this size.
    pub max_chunk_size: u64,
    /// Capacity of each thread-dedicated event buffer.
    pub thread_buffer_size: usize,
    /// Capacity of each buffer in the shared global pool.
    pub global_buffer_size: usize,
    /// Number of global buffers kept cached on the free list.
    pub global_cache_count: usize,
    /// Number of thread-local buffers kept cached on the free list.
    pub thread_cache_count: usize,
    /// Discard oldest full buffers once the full list grows past this.
    pub full_list_discard_threshold: usize,
    /// Capacity of each checkpoint (constant-pool) buffer.
    pub checkpoint_buffer_size: usize,
    /// How often the recorder thread drains full buffers.
    pub flush_interval: Duration,
    /// Capacity of the signal-safe CPU sample queue. Rounded up to a power
    /// of two.
    pub sample_queue_capacity: usize,
    /// Upper bound on live entries per constant-pool table side.
    pub table_max_entries: usize,
    /// Retries against the global pool before falling back to a transient
    /// buffer.
    pub lease_retries: usize,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            chunk_dir: PathBuf::from("recording"),
            max_chunk_size: 12 * 1024 * 1024,
            thread_buffer_size: 8 * 1024,
            global_buffer_size: 64 * 1024,
            global_cache_count: 20,
            thread_cache_count: 8,
            full_list_discard_threshold: 32,
            checkpoint_buffer_size: 16 * 1024,
            flush_interval: Duration::from_millis(250),
            sample_queue_capacity: 256,
            table_max_entries: 64 * 1024,
            lease_retries: 3,
        }
    }
}

impl RecorderOptions {
    pub fn new(chunk_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunk_dir: chunk_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_max_chunk_size(mut self, bytes: u64) -> Self {
        self.max_chunk_size = bytes;
        self
    }

    pub fn with_thread_buffer_size(mut self, bytes: usize) -> Self {
        self.thread_buffer_size = bytes;
        self
    }

    pub fn with_global_buffer_size(mut self, bytes: usize) -> Self {
        self.global_buffer_size = bytes;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.thread_buffer_size == 0 {
            return Err(RecorderError::InvalidOption("thread_buffer_size is zero"));
        }
        if self.global_buffer_size < self.thread_buffer_size {
            return Err(RecorderError::InvalidOption(
                "global_buffer_size smaller than thread_buffer_size",
            ));
        }
        if self.checkpoint_buffer_size == 0 {
            return Err(RecorderError::InvalidOption(
                "checkpoint_buffer_size is zero",
            ));
        }
        if self.max_chunk_size == 0 {
            return Err(RecorderError::InvalidOption("max_chunk_size is zero"));
        }
        if self.max_chunk_size > crate::chunk::writer::MAX_CHUNK_SPAN {
            return Err(RecorderError::InvalidOption(
                "max_chunk_size exceeds the checkpoint back-reference span",
            ));
        }
        Ok(())
    }
}
