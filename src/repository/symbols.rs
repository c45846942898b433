//! Symbol interning.
//!
//! Class, method and thread names arrive as opaque strings from the
//! metadata collaborator and leave as small ids referenced by event fields
//! and other constant pools.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

use crate::checkpoint::CheckpointWriter;
use crate::chunk::format::POOL_SYMBOL;
use crate::epoch::EpochState;

use super::table::EpochRepository;

pub struct SymbolRepository {
    symbols: EpochRepository<Box<str>>,
}

impl SymbolRepository {
    pub fn new(max_entries: usize) -> Self {
        Self {
            symbols: EpochRepository::new(max_entries),
        }
    }

    /// Intern a symbol in the current epoch. Returns its id, or 0 on
    /// exhaustion.
    pub fn intern(&self, epoch: &EpochState, symbol: &str) -> u64 {
        let mut hasher = FxHasher::default();
        symbol.hash(&mut hasher);
        let hash = hasher.finish();
        self.symbols.record_with(
            epoch,
            hash,
            |existing| existing.as_ref() == symbol,
            || symbol.into(),
        )
    }

    pub fn write(
        &self,
        side: usize,
        generation: u16,
        clear: bool,
        writer: &mut CheckpointWriter<'_>,
    ) -> usize {
        let rewind = writer.context();
        writer.write_type(POOL_SYMBOL);
        let emitted = self
            .symbols
            .write_side(side, generation, clear, writer, |id, symbol, writer| {
                writer.write_u64(id);
                writer.write_string(symbol);
            });
        if emitted == 0 {
            writer.set_context(rewind);
        }
        emitted
    }

    pub fn on_rotation(&self, epoch: &EpochState) {
        self.symbols.on_rotation(epoch);
    }

    pub fn live_count(&self, epoch: &EpochState) -> usize {
        self.symbols.live_count(epoch)
    }
}
