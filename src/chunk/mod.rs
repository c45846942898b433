//! On-disk chunk format: codec, writer, reader, file-set management.

pub mod format;
pub mod reader;
pub mod repository;
pub mod writer;

pub use format::ChunkHeader;
pub use reader::{ChunkReader, ChunkRecord, ChunkSummary, PoolEntry};
pub use repository::ChunkRepository;
pub use writer::ChunkWriter;
