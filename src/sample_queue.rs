//! Signal-safe single-producer/single-consumer sample queue.
//!
//! The producer side runs inside a signal handler: fixed preallocated
//! slots, two atomic cursors, no locks, no allocation. A full queue drops
//! the sample and counts it — the handler can never wait. The consumer
//! (the recorder thread) drains with ordinary loads/stores plus the same
//! acquire/release pairing the kernel-style head/tail protocol uses.
//!
//! Strictly one producer and one consumer at a time; the queue does not
//! defend against concurrent producers.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Deepest callchain a sample can carry; fixed so slots preallocate.
pub const MAX_SAMPLE_FRAMES: usize = 64;

/// One CPU-time sample captured in signal context.
#[derive(Debug, Clone, Copy)]
pub struct CpuSample {
    /// OS thread token of the sampled thread.
    pub thread_token: u64,
    pub ticks: u64,
    pub frame_count: u32,
    /// Raw instruction addresses, leaf first; symbolized later.
    pub frames: [u64; MAX_SAMPLE_FRAMES],
}

impl CpuSample {
    pub fn new(thread_token: u64, ticks: u64, frames: &[u64]) -> Self {
        let mut sample = CpuSample {
            thread_token,
            ticks,
            frame_count: frames.len().min(MAX_SAMPLE_FRAMES) as u32,
            frames: [0; MAX_SAMPLE_FRAMES],
        };
        sample.frames[..sample.frame_count as usize]
            .copy_from_slice(&frames[..sample.frame_count as usize]);
        sample
    }

    pub fn callchain(&self) -> &[u64] {
        &self.frames[..self.frame_count as usize]
    }
}

pub struct SampleQueue {
    slots: Box<[UnsafeCell<CpuSample>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    dropped: AtomicU64,
}

// SAFETY: slot i is written by the producer only while i is outside the
// [head, tail) window and published by the release store on `tail`; the
// consumer reads it only after an acquire load observes the new tail.
unsafe impl Send for SampleQueue {}
unsafe impl Sync for SampleQueue {}

impl SampleQueue {
    /// Capacity is rounded up to a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let empty = CpuSample::new(0, 0, &[]);
        let slots: Vec<UnsafeCell<CpuSample>> =
            (0..capacity).map(|_| UnsafeCell::new(empty)).collect();
        Self {
            slots: slots.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Producer side; async-signal-safe. Returns false (and counts the
    /// drop) when the queue is full.
    pub fn try_push(&self, sample: &CpuSample) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.slots.len() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let slot = &self.slots[tail & self.mask()];
        // SAFETY: single producer; the slot is outside the live window
        // until the release store below publishes it.
        unsafe { *slot.get() = *sample };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side.
    pub fn try_pop(&self) -> Option<CpuSample> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = &self.slots[head & self.mask()];
        // SAFETY: single consumer; the acquire load on `tail` published
        // this slot's contents.
        let sample = unsafe { *slot.get() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(sample)
    }

    /// Drain everything currently visible through `f`.
    pub fn drain(&self, mut f: impl FnMut(CpuSample)) -> usize {
        let mut count = 0;
        while let Some(sample) = self.try_pop() {
            f(sample);
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples dropped on overflow since the last call; resets the counter.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}
