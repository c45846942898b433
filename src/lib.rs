#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod checkpoint;
pub mod chunk;
pub mod clock;
pub mod epoch;
pub mod error;
pub mod event_writer;
pub mod mspace;
pub mod options;
pub mod postbox;
pub mod recorder;
pub mod repository;
pub mod sample_queue;
pub mod stats;
pub mod storage;

pub use buffer::{Buffer, BufferContext, WriterId};
pub use checkpoint::{BlobChain, CheckpointBlob, CheckpointManager, CheckpointWriter, WrittenSet};
pub use chunk::{ChunkReader, ChunkRecord, ChunkRepository, ChunkSummary, ChunkWriter};
pub use epoch::{EpochPair, EpochState};
pub use error::{RecorderError, Result};
pub use event_writer::{EventWriter, InFlightEvent};
pub use mspace::{MemorySpace, RetrievalPolicy};
pub use options::RecorderOptions;
pub use postbox::{PostBox, RecorderMessage};
pub use recorder::{FlightRecorder, RecorderHandle};
pub use repository::{
    ContextRepository, FrameKind, StackFrame, StackTraceRepository, SymbolRepository,
};
pub use sample_queue::{CpuSample, SampleQueue, MAX_SAMPLE_FRAMES};
pub use stats::{RecorderStats, StatsSnapshot};
pub use storage::Storage;
