//! Chunk file set management.
//!
//! Owns the recording directory and the currently-open chunk. Files are
//! named `chunk.<index>.frc`, oldest first; rotation closes the current
//! chunk (patching its header) and opens the next with a fresh index.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::writer::ChunkWriter;
use crate::error::{RecorderError, Result};

pub const CHUNK_EXTENSION: &str = "frc";

pub struct ChunkRepository {
    dir: PathBuf,
    next_index: u32,
    writer: Option<ChunkWriter>,
}

impl ChunkRepository {
    /// Create the repository directory if needed. Failure here is a
    /// configuration-time error surfaced to the caller.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| RecorderError::ChunkDirectory {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            next_index: 0,
            writer: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn chunk_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("chunk.{index}.{CHUNK_EXTENSION}"))
    }

    /// Open the next chunk. Any chunk still open is closed first.
    pub fn open_next(&mut self, generation: u8) -> io::Result<&mut ChunkWriter> {
        if let Some(open) = self.writer.take() {
            let path = open.path().to_path_buf();
            match open.close() {
                Ok(size) => debug!(chunk = %path.display(), size, "chunk closed"),
                Err(error) => warn!(chunk = %path.display(), %error, "chunk close failed"),
            }
        }
        let path = self.chunk_path(self.next_index);
        self.next_index += 1;
        let writer = ChunkWriter::open(&path, generation)?;
        debug!(chunk = %path.display(), "chunk opened");
        self.writer = Some(writer);
        Ok(self.writer.as_mut().expect("chunk writer just installed"))
    }

    pub fn current(&mut self) -> Option<&mut ChunkWriter> {
        self.writer.as_mut()
    }

    pub fn has_open_chunk(&self) -> bool {
        self.writer.is_some()
    }

    /// Close and finalize the current chunk, if any.
    pub fn close_current(&mut self) -> io::Result<Option<u64>> {
        match self.writer.take() {
            Some(writer) => writer.close().map(Some),
            None => Ok(None),
        }
    }

    /// Best-effort close for the fatal-error path: no finalization beyond
    /// patching the header, final bit left unset.
    pub fn emergency_close(&mut self) -> io::Result<Option<u64>> {
        match self.writer.take() {
            Some(writer) => writer.emergency_close().map(Some),
            None => Ok(None),
        }
    }

    /// Existing chunk files, oldest first.
    pub fn chunk_paths(&self) -> io::Result<Vec<PathBuf>> {
        let mut indexed: Vec<(u32, PathBuf)> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                let index: u32 = name
                    .strip_prefix("chunk.")?
                    .strip_suffix(&format!(".{CHUNK_EXTENSION}"))?
                    .parse()
                    .ok()?;
                Some((index, path))
            })
            .collect();
        indexed.sort_by_key(|(index, _)| *index);
        Ok(indexed.into_iter().map(|(_, path)| path).collect())
    }
}
