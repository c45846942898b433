//! Constant-pool ("checkpoint") buffer management.
//!
//! Checkpoint data lives in its own epoch-paired memory spaces, separate
//! from event buffers: writers stage records against the *current* epoch's
//! side while a rotation drains the *previous* side, so a thread never
//! writes into a buffer mid-drain. Thread-local checkpoint buffers are keyed
//! per epoch per thread (with a separate key space for virtual threads);
//! global checkpoint writers take a one-shot buffer from the current side.
//!
//! The manager also caches blob chains at most once per epoch per key, so
//! composite metadata (type sets, symbol groups) has a single physical
//! representation however many checkpoint events reference it.

pub mod blob;
pub mod writer;

pub use blob::{BlobChain, CheckpointBlob, WrittenSet};
pub use writer::{CheckpointContext, CheckpointWriter};

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::buffer::{Buffer, BufferContext, WriterId};
use crate::chunk::ChunkWriter;
use crate::epoch::{EpochPair, EpochState};
use crate::mspace::{MemorySpace, RetrievalPolicy};
use crate::stats::RecorderStats;

type ThreadBufferMap = Mutex<FxHashMap<(u64, bool), Arc<Buffer>>>;

pub struct CheckpointManager {
    mspaces: EpochPair<MemorySpace>,
    thread_buffers: EpochPair<ThreadBufferMap>,
    blob_cache: Mutex<FxHashMap<u64, (u16, BlobChain)>>,
    buffer_size: usize,
    stats: Arc<RecorderStats>,
}

impl CheckpointManager {
    pub fn new(buffer_size: usize, cache_count: usize, stats: Arc<RecorderStats>) -> Self {
        Self {
            mspaces: EpochPair::with(|| {
                MemorySpace::new(
                    buffer_size,
                    cache_count,
                    RetrievalPolicy::Sequential,
                    BufferContext::CheckpointGlobal,
                )
            }),
            thread_buffers: EpochPair::with(|| Mutex::new(FxHashMap::default())),
            blob_cache: Mutex::new(FxHashMap::default()),
            buffer_size,
            stats,
        }
    }

    /// Checkpoint writer backed by the calling thread's current-epoch
    /// buffer. An invalid (bufferless) writer is returned on exhaustion —
    /// its writes are silent no-ops.
    pub fn writer_for_thread(
        &self,
        epoch: &EpochState,
        id: WriterId,
        vthread: bool,
        kind: u64,
    ) -> CheckpointWriter<'_> {
        let (side, target) = self.thread_buffer(epoch, id, vthread);
        CheckpointWriter::new(self.mspaces.side(side), &self.stats, target, id, kind)
    }

    /// Checkpoint writer backed by a one-shot buffer from the current
    /// epoch's global pool.
    pub fn global_writer(
        &self,
        epoch: &EpochState,
        id: WriterId,
        kind: u64,
    ) -> CheckpointWriter<'_> {
        let side = epoch.current_index();
        let mspace = self.mspaces.side(side);
        let target = mspace.acquire(id, self.buffer_size);
        CheckpointWriter::one_shot(mspace, &self.stats, target, id, kind)
    }

    /// One-shot writer against the *previous* epoch's pool, used by the
    /// rotation drain to serialize what the closing epoch never emitted.
    pub fn previous_epoch_writer(
        &self,
        epoch: &EpochState,
        id: WriterId,
        kind: u64,
    ) -> CheckpointWriter<'_> {
        let side = epoch.previous_index();
        let mspace = self.mspaces.side(side);
        let target = mspace.acquire(id, self.buffer_size);
        CheckpointWriter::one_shot(mspace, &self.stats, target, id, kind)
    }

    fn thread_buffer(
        &self,
        epoch: &EpochState,
        id: WriterId,
        vthread: bool,
    ) -> (usize, Option<Arc<Buffer>>) {
        // Pick the side, lock its map, then confirm the epoch did not shift
        // underneath us; a shift between the read and the lock would land
        // this writer in the side a rotation is draining.
        loop {
            let side = epoch.current_index();
            let mut map = self.thread_buffers.side(side).lock();
            if epoch.current_index() != side {
                continue;
            }
            let key = (id.as_u64(), vthread);
            if let Some(buf) = map.get(&key) {
                return (side, Some(Arc::clone(buf)));
            }
            let acquired = self.mspaces.side(side).acquire(id, self.buffer_size);
            if let Some(buf) = &acquired {
                map.insert(key, Arc::clone(buf));
            }
            return (side, acquired);
        }
    }

    // --- blob cache ------------------------------------------------------

    /// Cached chain for `key`, if one was installed under the live
    /// generation.
    pub fn cached_blob(&self, key: u64, generation: u16) -> Option<BlobChain> {
        let cache = self.blob_cache.lock();
        match cache.get(&key) {
            Some((tagged, chain)) if *tagged == generation => Some(Arc::clone(chain)),
            _ => None,
        }
    }

    /// Install the physical representation for `key` this epoch, replacing
    /// any stale one.
    pub fn install_blob(&self, key: u64, generation: u16, chain: BlobChain) {
        self.blob_cache.lock().insert(key, (generation, chain));
    }

    // --- drain -----------------------------------------------------------

    /// Mid-chunk flush: drain the current side into the chunk, keeping
    /// thread buffers installed.
    pub fn write(&self, epoch: &EpochState, chunk: &mut ChunkWriter) -> io::Result<u64> {
        self.drain_side(epoch.current_index(), chunk, false)
    }

    /// Rotation drain of the now-previous side: every buffer is flushed,
    /// released, and its thread-map entry dropped.
    pub fn write_previous_epoch(
        &self,
        epoch: &EpochState,
        chunk: &mut ChunkWriter,
    ) -> io::Result<u64> {
        self.drain_side(epoch.previous_index(), chunk, true)
    }

    fn drain_side(&self, side: usize, chunk: &mut ChunkWriter, clear: bool) -> io::Result<u64> {
        let mspace = self.mspaces.side(side);
        let mut written = 0u64;
        let mut result = Ok(());

        mspace.drain_full(|buf| {
            if result.is_ok() {
                result = buf.flush_with(|bytes| {
                    written += bytes.len() as u64;
                    chunk.append_checkpoint_records(bytes)
                });
            } else {
                self.stats.add_discarded_buffer(buf.discard() as u64);
            }
            mspace.release(buf);
        });
        mspace.for_each_live(|buf| {
            if result.is_ok() && !buf.is_empty() {
                result = buf.flush_with(|bytes| {
                    written += bytes.len() as u64;
                    chunk.append_checkpoint_records(bytes)
                });
            }
            if clear {
                if !buf.is_empty() {
                    self.stats.add_discarded_buffer(buf.discard() as u64);
                }
                mspace.release(buf);
                return false;
            }
            true
        });
        if clear {
            self.thread_buffers.side(side).lock().clear();
        }
        result.map(|_| written)
    }

    /// Best-effort drain for the fatal-error path: skips anything that
    /// would contend.
    pub fn emergency_write(&self, epoch: &EpochState, chunk: &mut ChunkWriter) -> io::Result<u64> {
        // Only the current side can hold undrained data outside a rotation.
        self.drain_side(epoch.current_index(), chunk, false)
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::format::{self, CHECKPOINT_THREADS, POOL_SYMBOL};
    use crate::chunk::reader::{ChunkReader, ChunkRecord, PoolEntry};
    use tempfile::TempDir;

    fn manager() -> CheckpointManager {
        CheckpointManager::new(4096, 4, Arc::new(RecorderStats::new()))
    }

    fn write_symbols(manager: &CheckpointManager, epoch: &EpochState, id: WriterId) {
        let mut writer = manager.writer_for_thread(epoch, id, false, CHECKPOINT_THREADS);
        assert!(writer.is_valid());
        writer.write_type(POOL_SYMBOL);
        writer.write_u64(1);
        writer.write_string("main");
        writer.increment();
        assert!(writer.commit() > 0);
    }

    #[test]
    fn test_thread_buffer_installed_per_epoch() {
        let manager = manager();
        let epoch = EpochState::new();
        let id = WriterId::new(1);
        write_symbols(&manager, &epoch, id);
        write_symbols(&manager, &epoch, id);
        // Same thread, same epoch: one buffer, two records.
        assert_eq!(manager.mspaces.side(epoch.current_index()).live_count(), 1);

        epoch.begin_shift();
        epoch.end_shift();
        write_symbols(&manager, &epoch, id);
        // The new epoch's side got its own buffer.
        assert_eq!(manager.mspaces.side(epoch.current_index()).live_count(), 1);
    }

    #[test]
    fn test_vthread_buffers_are_separate() {
        let manager = manager();
        let epoch = EpochState::new();
        let id = WriterId::new(1);
        let (_, a) = manager.thread_buffer(&epoch, id, false);
        let (_, b) = manager.thread_buffer(&epoch, id, true);
        assert!(!Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    #[test]
    fn test_rotation_drain_reaches_the_chunk() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let epoch = EpochState::new();
        write_symbols(&manager, &epoch, WriterId::new(1));

        epoch.begin_shift();
        epoch.end_shift();
        let path = dir.path().join("chunk.0.frc");
        let mut chunk = ChunkWriter::open(&path, 1).unwrap();
        let written = manager.write_previous_epoch(&epoch, &mut chunk).unwrap();
        assert!(written > 0);
        chunk.close().unwrap();

        let mut reader = ChunkReader::open(&path).unwrap();
        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 1);
        match &records[0] {
            ChunkRecord::Checkpoint(cp) => {
                assert_eq!(cp.kind, CHECKPOINT_THREADS);
                assert_eq!(cp.pools.len(), 1);
                assert_eq!(
                    cp.pools[0].entries[0],
                    PoolEntry::Symbol {
                        id: 1,
                        value: "main".into()
                    }
                );
            }
            other => panic!("expected checkpoint, got {other:?}"),
        }
        // The drained side is empty and its thread map cleared.
        assert_eq!(manager.mspaces.side(epoch.previous_index()).live_count(), 0);
        assert!(manager
            .thread_buffers
            .side(epoch.previous_index())
            .lock()
            .is_empty());
    }

    #[test]
    fn test_flush_drain_preserves_thread_buffers() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let epoch = EpochState::new();
        let id = WriterId::new(1);
        write_symbols(&manager, &epoch, id);

        let mut chunk = ChunkWriter::open(dir.path().join("chunk.0.frc"), 1).unwrap();
        let written = manager.write(&epoch, &mut chunk).unwrap();
        assert!(written > 0);
        // Flushing twice writes nothing new but keeps the installation.
        assert_eq!(manager.write(&epoch, &mut chunk).unwrap(), 0);
        assert!(!manager
            .thread_buffers
            .side(epoch.current_index())
            .lock()
            .is_empty());
    }

    #[test]
    fn test_blob_cache_is_epoch_scoped() {
        let manager = manager();
        let chain = CheckpointBlob::new(vec![1, 2, 3], 1);
        manager.install_blob(7, 1, Arc::clone(&chain));
        assert!(manager.cached_blob(7, 1).is_some());
        assert!(manager.cached_blob(7, 2).is_none());
        assert!(manager.cached_blob(8, 1).is_none());
    }

    #[test]
    fn test_global_writer_takes_one_shot_buffer() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let epoch = EpochState::new();
        let id = WriterId::new(2);
        let mut writer = manager.global_writer(&epoch, id, format::CHECKPOINT_STATICS);
        writer.write_type(POOL_SYMBOL);
        writer.write_u64(9);
        writer.write_string("global");
        writer.increment();
        assert!(writer.commit() > 0);

        let path = dir.path().join("chunk.0.frc");
        let mut chunk = ChunkWriter::open(&path, 1).unwrap();
        manager.write(&epoch, &mut chunk).unwrap();
        chunk.close().unwrap();
        let mut reader = ChunkReader::open(&path).unwrap();
        reader.read_all().unwrap();
        assert_eq!(reader.symbols.get(&9).map(String::as_str), Some("global"));
    }
}
