//! Double-epoch generation tracking.
//!
//! A single atomic generation counter partitions every two-sided structure
//! (checkpoint buffer maps, constant-pool tables) into a *current* side that
//! writers touch and a *previous* side that a rotation drains. The counter
//! shifts only between [`EpochState::begin_shift`] / [`EpochState::end_shift`],
//! which the embedder calls at a global safepoint.
//!
//! Generation 0 is reserved as "never tagged": entries stamp the generation
//! they were serialized under, and comparison against the live generation
//! replaces any reset sweep. On overflow the counter wraps back to 1.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

pub const NEVER_TAGGED: u16 = 0;

#[derive(Debug)]
pub struct EpochState {
    generation: AtomicU16,
    shifting: AtomicBool,
}

impl Default for EpochState {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochState {
    pub fn new() -> Self {
        Self {
            generation: AtomicU16::new(1),
            shifting: AtomicBool::new(false),
        }
    }

    /// Current generation tag. Never returns [`NEVER_TAGGED`].
    #[inline]
    pub fn generation(&self) -> u16 {
        self.generation.load(Ordering::Acquire)
    }

    /// Index (0 or 1) of the side writers should use.
    #[inline]
    pub fn current_index(&self) -> usize {
        (self.generation() & 1) as usize
    }

    /// Index of the side a rotation drains.
    #[inline]
    pub fn previous_index(&self) -> usize {
        self.current_index() ^ 1
    }

    /// Flip the epoch. Must only run between safepoint begin/end; concurrent
    /// shifts are a protocol violation.
    pub fn begin_shift(&self) {
        let was = self.shifting.swap(true, Ordering::AcqRel);
        debug_assert!(!was, "nested epoch shift");
        let next = match self.generation().wrapping_add(1) {
            NEVER_TAGGED => 1,
            g => g,
        };
        self.generation.store(next, Ordering::Release);
    }

    pub fn end_shift(&self) {
        let was = self.shifting.swap(false, Ordering::AcqRel);
        debug_assert!(was, "end_shift without begin_shift");
    }

    #[inline]
    pub fn is_shifting(&self) -> bool {
        self.shifting.load(Ordering::Acquire)
    }
}

/// Two physical instances of a structure, resolved off the shared epoch bit.
///
/// Keeps the "pick side by generation" logic in one place instead of at every
/// call site.
#[derive(Debug, Default)]
pub struct EpochPair<T> {
    sides: [T; 2],
}

impl<T> EpochPair<T> {
    pub fn new(a: T, b: T) -> Self {
        Self { sides: [a, b] }
    }

    pub fn with(mut init: impl FnMut() -> T) -> Self {
        Self {
            sides: [init(), init()],
        }
    }

    #[inline]
    pub fn current(&self, epoch: &EpochState) -> &T {
        &self.sides[epoch.current_index()]
    }

    #[inline]
    pub fn previous(&self, epoch: &EpochState) -> &T {
        &self.sides[epoch.previous_index()]
    }

    #[inline]
    pub fn side(&self, index: usize) -> &T {
        &self.sides[index]
    }

    pub fn both(&self) -> &[T; 2] {
        &self.sides
    }
}
