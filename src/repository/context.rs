//! Execution context interning.
//!
//! Contexts form parent chains (thread group trees, carrier/virtual thread
//! pairs) referenced from thread-scoped events. An entry is a parent id
//! plus an interned name symbol; parent id 0 means root.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

use crate::checkpoint::CheckpointWriter;
use crate::chunk::format::POOL_EXECUTION_CONTEXT;
use crate::epoch::EpochState;

use super::table::EpochRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ExecutionContext {
    parent_id: u64,
    name_symbol: u64,
}

pub struct ContextRepository {
    contexts: EpochRepository<ExecutionContext>,
}

impl ContextRepository {
    pub fn new(max_entries: usize) -> Self {
        Self {
            contexts: EpochRepository::new(max_entries),
        }
    }

    /// Intern a context node in the current epoch. `parent_id` is a
    /// previously interned context (0 for roots); `name_symbol` an interned
    /// symbol id. Returns 0 on exhaustion.
    pub fn intern(&self, epoch: &EpochState, parent_id: u64, name_symbol: u64) -> u64 {
        let value = ExecutionContext {
            parent_id,
            name_symbol,
        };
        let mut hasher = FxHasher::default();
        value.hash(&mut hasher);
        let hash = hasher.finish();
        self.contexts
            .record_with(epoch, hash, |existing| *existing == value, || value)
    }

    pub fn write(
        &self,
        side: usize,
        generation: u16,
        clear: bool,
        writer: &mut CheckpointWriter<'_>,
    ) -> usize {
        let rewind = writer.context();
        writer.write_type(POOL_EXECUTION_CONTEXT);
        let emitted =
            self.contexts
                .write_side(side, generation, clear, writer, |id, ctx, writer| {
                    writer.write_u64(id);
                    writer.write_u64(ctx.parent_id);
                    writer.write_u64(ctx.name_symbol);
                });
        if emitted == 0 {
            writer.set_context(rewind);
        }
        emitted
    }

    pub fn on_rotation(&self, epoch: &EpochState) {
        self.contexts.on_rotation(epoch);
    }

    pub fn live_count(&self, epoch: &EpochState) -> usize {
        self.contexts.live_count(epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_chains_intern_per_node() {
        let epoch = EpochState::new();
        let repo = ContextRepository::new(100);
        let root = repo.intern(&epoch, 0, 1);
        let child = repo.intern(&epoch, root, 2);
        let again = repo.intern(&epoch, root, 2);
        assert_ne!(root, 0);
        assert_ne!(child, root);
        assert_eq!(child, again);
        assert_eq!(repo.live_count(&epoch), 2);
    }
}
