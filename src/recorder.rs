//! Recorder lifecycle and the background drain thread.
//!
//! [`FlightRecorder`] is the process-wide context object: it owns storage,
//! checkpoint manager, repositories, the chunk file set and the dedicated
//! recorder thread. There are no ambient singletons — tests construct as
//! many independent recorders as they like.
//!
//! The recorder thread parks on the [`PostBox`] between periodic flush
//! passes. A flush pass drains full buffers, live buffers, the CPU sample
//! queue and any new constant-pool entries into the open chunk, preserving
//! all repository state. A rotation additionally shifts the epoch, drains
//! the now-previous side with write-and-clear semantics, finalizes the
//! chunk and opens the next one. Producers never participate in either —
//! they only post messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffer::WriterId;
use crate::checkpoint::CheckpointManager;
use crate::chunk::format::{
    self, CHECKPOINT_FLUSH, CHECKPOINT_THREADS, EVENT_CPU_SAMPLE, EVENT_DATA_LOSS,
    POOL_EXECUTION_CONTEXT,
};
use crate::chunk::{ChunkRepository, ChunkWriter};
use crate::epoch::EpochState;
use crate::error::Result;
use crate::event_writer::EventWriter;
use crate::options::RecorderOptions;
use crate::postbox::{PostBox, RecorderMessage};
use crate::repository::{ContextRepository, StackFrame, StackTraceRepository, SymbolRepository};
use crate::sample_queue::{CpuSample, SampleQueue};
use crate::stats::{RecorderStats, StatsSnapshot};
use crate::storage::Storage;

/// Runtime-adjustable settings, swapped atomically so the recorder thread
/// picks up changes without coordination.
#[derive(Debug, Clone)]
struct Settings {
    flush_interval: Duration,
    max_chunk_size: u64,
}

pub(crate) struct RecorderInner {
    enabled: AtomicBool,
    epoch: EpochState,
    storage: Storage,
    checkpoints: CheckpointManager,
    stack_traces: StackTraceRepository,
    symbols: SymbolRepository,
    contexts: ContextRepository,
    samples: SampleQueue,
    chunks: Mutex<ChunkRepository>,
    postbox: PostBox,
    settings: ArcSwap<Settings>,
    stats: Arc<RecorderStats>,
    /// Serializes rotation against the emergency dump (which only
    /// try-locks).
    rotation_lock: Mutex<()>,
}

impl RecorderInner {
    fn flush_pass(&self) {
        let mut chunks = self.chunks.lock();
        let Some(chunk) = chunks.current() else {
            return;
        };
        self.pump_samples(chunk);
        if let Err(error) = self.storage.write(chunk) {
            warn!(%error, "event buffer flush failed; continuing in memory");
            return;
        }
        self.flush_constant_pools(chunk);
        if let Err(error) = chunk.flush_header() {
            warn!(%error, "chunk header flush failed");
        }
    }

    /// Emit repository entries not yet serialized this epoch, then drain the
    /// current side's checkpoint buffers. State is preserved (no clear):
    /// this is the mid-chunk pass.
    fn flush_constant_pools(&self, chunk: &mut ChunkWriter) {
        let generation = self.epoch.generation();
        let side = self.epoch.current_index();
        let mut writer =
            self.checkpoints
                .global_writer(&self.epoch, WriterId::current(), CHECKPOINT_FLUSH);
        // An invalid writer would tag entries as serialized without ever
        // emitting them; skip and let a later pass retry.
        if writer.is_valid() {
            self.symbols.write(side, generation, false, &mut writer);
            self.stack_traces.write(side, generation, false, &mut writer);
            self.contexts.write(side, generation, false, &mut writer);
            writer.commit();
        }
        if let Err(error) = self.checkpoints.write(&self.epoch, chunk) {
            warn!(%error, "checkpoint flush failed");
        }
    }

    /// Full rotation: drain everything belonging to the closing epoch into
    /// the closing chunk, shift, then open the next chunk.
    ///
    /// The epoch shift itself must be fenced by the embedder's safepoint
    /// collaborator; this method assumes no writer is mid-operation across
    /// the `begin_shift`/`end_shift` window.
    fn rotate(&self, reopen: bool) {
        let _guard = self.rotation_lock.lock();
        let mut chunks = self.chunks.lock();
        let Some(chunk) = chunks.current() else {
            return;
        };

        self.pump_samples(chunk);
        if let Err(error) = self.storage.write_at_safepoint(chunk) {
            warn!(%error, "event drain failed during rotation");
        }

        let closing_generation = self.epoch.generation();
        let closing_side = self.epoch.current_index();
        self.epoch.begin_shift();
        self.epoch.end_shift();

        // Serialize what the closing epoch never got to emit, with clear:
        // the drained side starts the next epoch empty.
        let mut writer = self.checkpoints.previous_epoch_writer(
            &self.epoch,
            WriterId::current(),
            CHECKPOINT_FLUSH,
        );
        if writer.is_valid() {
            self.symbols
                .write(closing_side, closing_generation, true, &mut writer);
            self.stack_traces
                .write(closing_side, closing_generation, true, &mut writer);
            self.contexts
                .write(closing_side, closing_generation, true, &mut writer);
            writer.commit();
        }
        if let Err(error) = self.checkpoints.write_previous_epoch(&self.epoch, chunk) {
            warn!(%error, "checkpoint drain failed during rotation");
        }

        self.stack_traces.on_rotation(&self.epoch);
        self.symbols.on_rotation(&self.epoch);
        self.contexts.on_rotation(&self.epoch);

        self.emit_data_loss(chunk);
        let _ = chunk.append_metadata(1, &builtin_metadata());
        match chunks.close_current() {
            Ok(Some(size)) => info!(size, "chunk rotated"),
            Ok(None) => {}
            Err(error) => warn!(%error, "chunk close failed"),
        }
        if reopen {
            if let Err(error) = chunks.open_next(self.epoch.generation() as u8) {
                warn!(%error, "could not open next chunk; recording to memory only");
            }
        }
    }

    fn pump_samples(&self, chunk: &mut ChunkWriter) {
        self.stats.add_sample_drops(self.samples.take_dropped());
        self.samples.drain(|sample| {
            let mut payload = Vec::with_capacity(16 + sample.callchain().len() * 9);
            format::put_var_u64(&mut payload, sample.thread_token);
            format::put_var_u64(&mut payload, sample.ticks);
            format::put_var_u64(&mut payload, sample.callchain().len() as u64);
            for &address in sample.callchain() {
                format::put_var_u64(&mut payload, address);
            }
            if let Err(error) = chunk.append_event(EVENT_CPU_SAMPLE, &payload) {
                warn!(%error, "cpu sample write failed");
            }
        });
    }

    fn emit_data_loss(&self, chunk: &mut ChunkWriter) {
        let snapshot = self.stats.snapshot();
        if snapshot.lost_bytes == 0 && snapshot.sample_drops == 0 {
            return;
        }
        let mut payload = Vec::with_capacity(24);
        format::put_var_u64(&mut payload, snapshot.lost_bytes);
        format::put_var_u64(&mut payload, snapshot.lost_records);
        format::put_var_u64(&mut payload, snapshot.sample_drops);
        let _ = chunk.append_event(EVENT_DATA_LOSS, &payload);
    }

    /// Best-effort dump for the fatal-error collaborator: try-locks only,
    /// skips whatever would contend, leaves a truncated-but-valid chunk.
    fn emergency_dump(&self) {
        let Some(_guard) = self.rotation_lock.try_lock() else {
            return;
        };
        let Some(mut chunks) = self.chunks.try_lock() else {
            return;
        };
        if let Some(chunk) = chunks.current() {
            self.pump_samples(chunk);
            let _ = self.storage.write(chunk);
            let mut writer = self.checkpoints.global_writer(
                &self.epoch,
                WriterId::current(),
                CHECKPOINT_FLUSH,
            );
            if writer.is_valid() {
                let generation = self.epoch.generation();
                let side = self.epoch.current_index();
                self.symbols.write(side, generation, false, &mut writer);
                self.stack_traces.write(side, generation, false, &mut writer);
                self.contexts.write(side, generation, false, &mut writer);
                writer.commit();
            }
            let _ = self.checkpoints.emergency_write(&self.epoch, chunk);
            self.emit_data_loss(chunk);
        }
        let _ = chunks.emergency_close();
    }

    fn recorder_loop(self: &Arc<Self>) {
        loop {
            let settings = self.settings.load();
            let messages = self.postbox.collect(settings.flush_interval);
            let mut shutdown = false;
            let mut rotate = false;
            for message in messages {
                match message {
                    RecorderMessage::Start => self.enabled.store(true, Ordering::Release),
                    RecorderMessage::Stop => self.enabled.store(false, Ordering::Release),
                    RecorderMessage::Rotate => rotate = true,
                    RecorderMessage::FullBuffer => {
                        if self.storage.should_discard() {
                            self.storage.discard_oldest();
                        }
                    }
                    RecorderMessage::Shutdown => shutdown = true,
                }
            }
            if shutdown {
                self.enabled.store(false, Ordering::Release);
                self.rotate(false);
                debug!("recorder thread exiting");
                return;
            }
            let over_budget = self
                .chunks
                .lock()
                .current()
                .is_some_and(|chunk| chunk.size() >= settings.max_chunk_size);
            if rotate || over_budget {
                self.rotate(true);
            } else {
                self.flush_pass();
            }
        }
    }
}

/// Embedded continuous recorder. Construct with [`FlightRecorder::start`];
/// dropping it shuts the recorder thread down and finalizes the last chunk.
pub struct FlightRecorder {
    inner: Arc<RecorderInner>,
    thread: Option<JoinHandle<()>>,
}

impl FlightRecorder {
    pub fn start(options: RecorderOptions) -> Result<Self> {
        options.validate()?;
        let stats = Arc::new(RecorderStats::new());
        let epoch = EpochState::new();
        let mut chunks = ChunkRepository::new(&options.chunk_dir)?;
        chunks.open_next(epoch.generation() as u8)?;

        let inner = Arc::new(RecorderInner {
            enabled: AtomicBool::new(true),
            storage: Storage::new(&options, Arc::clone(&stats)),
            checkpoints: CheckpointManager::new(
                options.checkpoint_buffer_size,
                options.global_cache_count,
                Arc::clone(&stats),
            ),
            stack_traces: StackTraceRepository::new(options.table_max_entries),
            symbols: SymbolRepository::new(options.table_max_entries),
            contexts: ContextRepository::new(options.table_max_entries),
            samples: SampleQueue::with_capacity(options.sample_queue_capacity),
            chunks: Mutex::new(chunks),
            postbox: PostBox::new(),
            settings: ArcSwap::from_pointee(Settings {
                flush_interval: options.flush_interval,
                max_chunk_size: options.max_chunk_size,
            }),
            stats,
            rotation_lock: Mutex::new(()),
            epoch,
        });

        let thread = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("flightrec-recorder".into())
                .spawn(move || inner.recorder_loop())
                .map_err(crate::error::RecorderError::ChunkIo)?
        };
        info!("flight recorder started");
        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> RecorderHandle {
        RecorderHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for FlightRecorder {
    fn drop(&mut self) {
        self.inner.postbox.post(RecorderMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Cheap, cloneable handle for producers and control paths.
#[derive(Clone)]
pub struct RecorderHandle {
    inner: Arc<RecorderInner>,
}

impl RecorderHandle {
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self) {
        self.inner.postbox.post(RecorderMessage::Start);
    }

    pub fn disable(&self) {
        self.inner.postbox.post(RecorderMessage::Stop);
    }

    /// Request a chunk rotation; completes asynchronously on the recorder
    /// thread.
    pub fn rotate(&self) {
        self.inner.postbox.post(RecorderMessage::Rotate);
    }

    /// Hint that full buffers are pending, waking the recorder early.
    pub fn notify_full_buffer(&self) {
        self.inner.postbox.post(RecorderMessage::FullBuffer);
    }

    /// Event writer bound to the calling thread.
    pub fn event_writer(&self) -> EventWriter<'_> {
        EventWriter::new(&self.inner.storage)
    }

    /// Deduplicating stack-trace attribution; 0 means "omit the field".
    pub fn record_stack_trace(&self, frames: &[StackFrame]) -> u64 {
        if !self.is_enabled() {
            return 0;
        }
        self.inner.stack_traces.record(&self.inner.epoch, frames)
    }

    pub fn intern_symbol(&self, symbol: &str) -> u64 {
        self.inner.symbols.intern(&self.inner.epoch, symbol)
    }

    /// Register the calling thread under `name`, writing its context entry
    /// through the thread's checkpoint buffer. Returns the context id.
    pub fn register_thread(&self, name: &str, vthread: bool) -> u64 {
        let inner = &self.inner;
        let name_symbol = inner.symbols.intern(&inner.epoch, name);
        let context_id = inner.contexts.intern(&inner.epoch, 0, name_symbol);
        let mut writer = inner.checkpoints.writer_for_thread(
            &inner.epoch,
            WriterId::current(),
            vthread,
            CHECKPOINT_THREADS,
        );
        writer.write_type(POOL_EXECUTION_CONTEXT);
        writer.write_u64(context_id);
        writer.write_u64(0);
        writer.write_u64(name_symbol);
        writer.increment();
        writer.commit();
        context_id
    }

    /// Producer side of the CPU sample queue; async-signal-safe.
    pub fn push_cpu_sample(&self, sample: &CpuSample) -> bool {
        self.inner.samples.try_push(sample)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Swap the flush interval and chunk budget without stopping anything.
    pub fn reconfigure(&self, flush_interval: Duration, max_chunk_size: u64) {
        self.inner.settings.store(Arc::new(Settings {
            flush_interval,
            max_chunk_size,
        }));
    }

    /// Best-effort crash dump; safe to call from a fatal-error handler.
    pub fn emergency_dump(&self) {
        self.inner.emergency_dump();
    }

    /// Chunk files written so far, oldest first.
    pub fn chunk_paths(&self) -> std::io::Result<Vec<std::path::PathBuf>> {
        self.inner.chunks.lock().chunk_paths()
    }
}

/// Self-describing payload for the per-chunk metadata event: the built-in
/// event-type table a reader needs before scanning the body.
fn builtin_metadata() -> Vec<u8> {
    let builtin: &[(u64, &str)] = &[
        (format::EVENT_METADATA, "Metadata"),
        (format::EVENT_CHECKPOINT, "Checkpoint"),
        (EVENT_DATA_LOSS, "DataLoss"),
        (EVENT_CPU_SAMPLE, "CpuTimeSample"),
    ];
    let mut payload = Vec::new();
    format::put_var_u64(&mut payload, builtin.len() as u64);
    for (id, name) in builtin {
        format::put_var_u64(&mut payload, *id);
        format::put_string(&mut payload, name);
    }
    payload
}
