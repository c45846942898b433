//! Control-path errors.
//!
//! Only configuration-time and chunk I/O failures surface as errors; routine
//! buffer exhaustion on the recording paths degrades to data-loss accounting
//! and never reaches callers.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("cannot create chunk directory {path}: {source}")]
    ChunkDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("chunk I/O failed: {0}")]
    ChunkIo(#[from] std::io::Error),

    #[error("invalid recorder option: {0}")]
    InvalidOption(&'static str),

    #[error("recorder is already shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, RecorderError>;
