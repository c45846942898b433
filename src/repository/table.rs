//! Content-addressed id tables, epoch-partitioned.
//!
//! Each table maps a content hash to a small monotonic id (0 is reserved as
//! "could not attribute"). Identical content inserted twice in one epoch
//! collapses to one entry and one id. Serialization state is a generation
//! tag per entry, so "already emitted this epoch" needs no reset sweep.
//!
//! Capacity grows only at rotation boundaries: inserts flag the need, and
//! `on_rotation` doubles the drained side's bucket array before it goes back
//! into service. Tables are never resized while a side is live.

use parking_lot::Mutex;

use crate::checkpoint::CheckpointWriter;
use crate::epoch::{EpochPair, EpochState, NEVER_TAGGED};

const INITIAL_BUCKETS: usize = 64;
const MAX_CHAIN: usize = 6;
/// Load factor numerator/denominator: resize once len > buckets * 3/4.
const LOAD_NUM: usize = 3;
const LOAD_DEN: usize = 4;

struct Node<T> {
    hash: u64,
    id: u64,
    serialized_gen: u16,
    value: T,
    next: Option<Box<Node<T>>>,
}

pub struct IdTable<T> {
    buckets: Vec<Option<Box<Node<T>>>>,
    len: usize,
    max_entries: usize,
    needs_resize: bool,
}

impl<T> IdTable<T> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buckets: (0..INITIAL_BUCKETS).map(|_| None).collect(),
            len: 0,
            max_entries,
            needs_resize: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Find the id for content matching `hash`+`eq`, inserting a new entry
    /// via `make` on miss. `alloc_id` runs only on an actual insert; the id
    /// space is shared across the epoch pair so ids never collide within a
    /// chunk. Returns 0 when the table is at capacity.
    pub fn lookup_or_insert(
        &mut self,
        hash: u64,
        eq: impl Fn(&T) -> bool,
        make: impl FnOnce() -> T,
        alloc_id: impl FnOnce() -> u64,
    ) -> u64 {
        let bucket = self.bucket_of(hash);
        let mut chain_len = 0;
        let mut cursor = self.buckets[bucket].as_deref();
        while let Some(node) = cursor {
            if node.hash == hash && eq(&node.value) {
                return node.id;
            }
            chain_len += 1;
            cursor = node.next.as_deref();
        }
        if self.len >= self.max_entries {
            return 0;
        }
        let id = alloc_id();
        let node = Box::new(Node {
            hash,
            id,
            serialized_gen: NEVER_TAGGED,
            value: make(),
            next: self.buckets[bucket].take(),
        });
        self.buckets[bucket] = Some(node);
        self.len += 1;
        if chain_len + 1 > MAX_CHAIN || self.len * LOAD_DEN > self.buckets.len() * LOAD_NUM {
            self.needs_resize = true;
        }
        id
    }

    /// Emit entries not yet serialized under `generation` through
    /// `serialize`, tagging them as they go. With `clear`, every entry is
    /// excised in the same pass — the write-and-clear rotation drain.
    /// Returns the number of entries emitted.
    pub fn write(
        &mut self,
        generation: u16,
        clear: bool,
        mut serialize: impl FnMut(u64, &T),
    ) -> usize {
        let mut emitted = 0;
        for bucket in &mut self.buckets {
            if clear {
                let mut cursor = bucket.take();
                while let Some(mut node) = cursor {
                    cursor = node.next.take();
                    if node.serialized_gen != generation {
                        serialize(node.id, &node.value);
                        emitted += 1;
                    }
                }
            } else {
                let mut cursor = bucket.as_deref_mut();
                while let Some(node) = cursor {
                    if node.serialized_gen != generation {
                        serialize(node.id, &node.value);
                        node.serialized_gen = generation;
                        emitted += 1;
                    }
                    cursor = node.next.as_deref_mut();
                }
            }
        }
        if clear {
            self.len = 0;
        }
        emitted
    }

    /// Deferred resize, run only at a rotation boundary while this side is
    /// out of service.
    pub fn on_rotation(&mut self) {
        if !self.needs_resize {
            return;
        }
        self.needs_resize = false;
        let new_size = self.buckets.len() * 2;
        let mut old = std::mem::replace(&mut self.buckets, (0..new_size).map(|_| None).collect());
        for bucket in &mut old {
            let mut cursor = bucket.take();
            while let Some(mut node) = cursor {
                cursor = node.next.take();
                let at = self.bucket_of(node.hash);
                node.next = self.buckets[at].take();
                self.buckets[at] = Some(node);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Epoch pair of id tables with the shared side-selection discipline and a
/// single id counter spanning both sides.
pub struct EpochRepository<T> {
    tables: EpochPair<Mutex<IdTable<T>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl<T> EpochRepository<T> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            tables: EpochPair::with(|| Mutex::new(IdTable::new(max_entries))),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Run `f` against the current epoch's table. The side is re-checked
    /// under the lock so an insert can never land in a side that a rotation
    /// has started draining.
    pub fn with_current<R>(&self, epoch: &EpochState, f: impl FnOnce(&mut IdTable<T>) -> R) -> R {
        loop {
            let side = epoch.current_index();
            let mut table = self.tables.side(side).lock();
            if epoch.current_index() != side {
                continue;
            }
            return f(&mut table);
        }
    }

    pub fn with_side<R>(&self, side: usize, f: impl FnOnce(&mut IdTable<T>) -> R) -> R {
        f(&mut self.tables.side(side).lock())
    }

    /// Deduplicating insert into the current epoch. Returns 0 on capacity
    /// exhaustion; callers omit the attribution rather than fail.
    pub fn record_with(
        &self,
        epoch: &EpochState,
        hash: u64,
        eq: impl Fn(&T) -> bool,
        make: impl FnOnce() -> T,
    ) -> u64 {
        self.with_current(epoch, |table| {
            table.lookup_or_insert(hash, eq, make, || {
                self.next_id
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            })
        })
    }

    /// Serialize one side into an open checkpoint writer section.
    pub fn write_side(
        &self,
        side: usize,
        generation: u16,
        clear: bool,
        writer: &mut CheckpointWriter<'_>,
        mut serialize: impl FnMut(u64, &T, &mut CheckpointWriter<'_>),
    ) -> usize {
        self.with_side(side, |table| {
            table.write(generation, clear, |id, value| {
                serialize(id, value, writer);
                writer.increment();
            })
        })
    }

    /// Resize the drained (previous) side if inserts flagged the need.
    pub fn on_rotation(&self, epoch: &EpochState) {
        self.with_side(epoch.previous_index(), IdTable::on_rotation);
    }

    pub fn live_count(&self, epoch: &EpochState) -> usize {
        self.with_current(epoch, |table| table.len())
    }
}
