//! Chunk parsing for analysis and tests.
//!
//! The reader accumulates constant-pool definitions as a side effect of
//! reading checkpoint events, so by the time the caller has walked the
//! record stream it can resolve symbol/stack-trace/context ids the same way
//! a post-processing tool would.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;

use serde::Serialize;

use super::format::{self, ChunkHeader, Decoder, HEADER_SIZE, PADDED_U32_SIZE};

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkRecord {
    Event {
        type_id: u64,
        start_ticks: u64,
        payload: Vec<u8>,
    },
    Checkpoint(CheckpointEvent),
    Metadata {
        start_ticks: u64,
        metadata_id: u64,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointEvent {
    pub start_ticks: u64,
    /// Backward delta to the previous checkpoint's file offset; 0 for the
    /// first checkpoint in the chunk.
    pub delta_to_previous: i64,
    pub kind: u64,
    pub pools: Vec<PoolSection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolSection {
    pub pool_type: u64,
    pub entries: Vec<PoolEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoolEntry {
    Symbol {
        id: u64,
        value: String,
    },
    StackTrace {
        id: u64,
        truncated: bool,
        frames: Vec<(u64, u32, u32, u8)>,
    },
    ExecutionContext {
        id: u64,
        parent_id: u64,
        name_symbol: u64,
    },
    /// Entry of a pool type this reader does not know; kept raw.
    Opaque {
        id: u64,
        bytes: Vec<u8>,
    },
}

impl PoolEntry {
    pub fn id(&self) -> u64 {
        match self {
            PoolEntry::Symbol { id, .. }
            | PoolEntry::StackTrace { id, .. }
            | PoolEntry::ExecutionContext { id, .. }
            | PoolEntry::Opaque { id, .. } => *id,
        }
    }
}

pub struct ChunkReader {
    header: ChunkHeader,
    data: Vec<u8>,
    at: usize,
    /// Symbol id → string, accumulated from checkpoint events.
    pub symbols: HashMap<u64, String>,
    /// Stack trace id → frames.
    pub stack_traces: HashMap<u64, Vec<(u64, u32, u32, u8)>>,
    /// Execution context id → (parent id, name symbol id).
    pub contexts: HashMap<u64, (u64, u64)>,
}

impl ChunkReader {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let header = ChunkHeader::read_from(&mut &data[..])?;
        Ok(Self {
            header,
            data,
            at: HEADER_SIZE,
            symbols: HashMap::new(),
            stack_traces: HashMap::new(),
            contexts: HashMap::new(),
        })
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    /// Read the next record, accumulating constant-pool definitions.
    /// Returns `Ok(None)` at the end of the chunk.
    pub fn read_record(&mut self) -> io::Result<Option<ChunkRecord>> {
        let end = if self.header.chunk_size != 0 {
            (self.header.chunk_size as usize).min(self.data.len())
        } else {
            self.data.len()
        };
        if self.at >= end {
            return Ok(None);
        }
        let mut dec = Decoder::new(&self.data[self.at..end]);
        let size = dec.padded_u32()? as usize;
        if size < PADDED_U32_SIZE || self.at + size > end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated record",
            ));
        }
        let record = Self::decode_record(&self.data[self.at..self.at + size])?;
        self.at += size;
        self.accumulate(&record);
        Ok(Some(record))
    }

    fn decode_record(record: &[u8]) -> io::Result<ChunkRecord> {
        let mut dec = Decoder::new(record);
        let size = dec.padded_u32()? as usize;
        debug_assert_eq!(size, record.len());
        let type_id = dec.var_u64()?;
        let start_ticks = dec.var_u64()?;
        match type_id {
            format::EVENT_CHECKPOINT => {
                dec.var_u64()?; // duration
                let delta_to_previous = format::unzigzag(u64::from(dec.padded_u32()?));
                let kind = dec.var_u64()?;
                let pool_count = dec.padded_u32()?;
                let mut pools = Vec::with_capacity(pool_count as usize);
                for _ in 0..pool_count {
                    pools.push(Self::decode_pool(&mut dec)?);
                }
                Ok(ChunkRecord::Checkpoint(CheckpointEvent {
                    start_ticks,
                    delta_to_previous,
                    kind,
                    pools,
                }))
            }
            format::EVENT_METADATA => {
                dec.var_u64()?; // duration
                let metadata_id = dec.var_u64()?;
                let payload = dec.bytes(dec.remaining())?.to_vec();
                Ok(ChunkRecord::Metadata {
                    start_ticks,
                    metadata_id,
                    payload,
                })
            }
            _ => Ok(ChunkRecord::Event {
                type_id,
                start_ticks,
                payload: dec.bytes(dec.remaining())?.to_vec(),
            }),
        }
    }

    fn decode_pool(dec: &mut Decoder<'_>) -> io::Result<PoolSection> {
        let pool_type = dec.var_u64()?;
        let entry_count = dec.padded_u32()?;
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let entry = match pool_type {
                format::POOL_SYMBOL => PoolEntry::Symbol {
                    id: dec.var_u64()?,
                    value: dec.string()?,
                },
                format::POOL_STACK_TRACE => {
                    let id = dec.var_u64()?;
                    let truncated = dec.var_u64()? != 0;
                    let frame_count = dec.var_u64()? as usize;
                    let mut frames = Vec::with_capacity(frame_count);
                    for _ in 0..frame_count {
                        frames.push((
                            dec.var_u64()?,
                            dec.var_u64()? as u32,
                            dec.var_u64()? as u32,
                            dec.var_u64()? as u8,
                        ));
                    }
                    PoolEntry::StackTrace {
                        id,
                        truncated,
                        frames,
                    }
                }
                format::POOL_EXECUTION_CONTEXT => PoolEntry::ExecutionContext {
                    id: dec.var_u64()?,
                    parent_id: dec.var_u64()?,
                    name_symbol: dec.var_u64()?,
                },
                _ => {
                    let id = dec.var_u64()?;
                    let len = dec.var_u64()? as usize;
                    PoolEntry::Opaque {
                        id,
                        bytes: dec.bytes(len)?.to_vec(),
                    }
                }
            };
            entries.push(entry);
        }
        Ok(PoolSection { pool_type, entries })
    }

    fn accumulate(&mut self, record: &ChunkRecord) {
        let ChunkRecord::Checkpoint(checkpoint) = record else {
            return;
        };
        for pool in &checkpoint.pools {
            for entry in &pool.entries {
                match entry {
                    PoolEntry::Symbol { id, value } => {
                        self.symbols.insert(*id, value.clone());
                    }
                    PoolEntry::StackTrace { id, frames, .. } => {
                        self.stack_traces.insert(*id, frames.clone());
                    }
                    PoolEntry::ExecutionContext {
                        id,
                        parent_id,
                        name_symbol,
                    } => {
                        self.contexts.insert(*id, (*parent_id, *name_symbol));
                    }
                    PoolEntry::Opaque { .. } => {}
                }
            }
        }
    }

    pub fn read_all(&mut self) -> io::Result<Vec<ChunkRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.read_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// File offsets of every checkpoint event, found by walking the
    /// backward chain from the header without scanning the event body.
    pub fn checkpoint_offsets_backward(&self) -> io::Result<Vec<u64>> {
        let mut offsets = Vec::new();
        let mut at = self.header.last_checkpoint_offset;
        while at != 0 {
            offsets.push(at);
            let mut dec = Decoder::new(
                self.data
                    .get(at as usize..)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad offset"))?,
            );
            dec.padded_u32()?;
            let type_id = dec.var_u64()?;
            if type_id != format::EVENT_CHECKPOINT {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "checkpoint chain points at a non-checkpoint record",
                ));
            }
            dec.var_u64()?;
            dec.var_u64()?;
            let delta = format::unzigzag(u64::from(dec.padded_u32()?));
            if delta == 0 {
                break;
            }
            at = (at as i64 + delta) as u64;
        }
        Ok(offsets)
    }

    pub fn summarize(&mut self) -> io::Result<ChunkSummary> {
        let mut summary = ChunkSummary {
            chunk_size: self.header.chunk_size,
            is_final: self.header.is_final,
            generation: self.header.generation,
            ..ChunkSummary::default()
        };
        while let Some(record) = self.read_record()? {
            match record {
                ChunkRecord::Event { type_id, .. } => {
                    summary.events += 1;
                    *summary.events_by_type.entry(type_id).or_default() += 1;
                }
                ChunkRecord::Checkpoint(cp) => {
                    summary.checkpoints += 1;
                    summary.pool_entries += cp
                        .pools
                        .iter()
                        .map(|pool| pool.entries.len() as u64)
                        .sum::<u64>();
                }
                ChunkRecord::Metadata { .. } => summary.metadata_events += 1,
            }
        }
        Ok(summary)
    }
}

/// Per-chunk totals; `Serialize` for JSON tooling convenience.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkSummary {
    pub chunk_size: u64,
    pub is_final: bool,
    pub generation: u8,
    pub events: u64,
    pub checkpoints: u64,
    pub metadata_events: u64,
    pub pool_entries: u64,
    pub events_by_type: HashMap<u64, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::writer::ChunkWriter;
    use tempfile::TempDir;

    #[test]
    fn test_reads_plain_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk.0.frc");
        let mut writer = ChunkWriter::open(&path, 1).unwrap();
        writer.append_event(100, &[1, 2, 3]).unwrap();
        writer.append_event(101, &[]).unwrap();
        writer.close().unwrap();

        let mut reader = ChunkReader::open(&path).unwrap();
        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 2);
        match &records[0] {
            ChunkRecord::Event {
                type_id, payload, ..
            } => {
                assert_eq!(*type_id, 100);
                assert_eq!(payload, &[1, 2, 3]);
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk.0.frc");
        let mut writer = ChunkWriter::open(&path, 1).unwrap();
        writer.append_metadata(9, b"event-type-table").unwrap();
        writer.close().unwrap();

        let mut reader = ChunkReader::open(&path).unwrap();
        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 1);
        match &records[0] {
            ChunkRecord::Metadata {
                metadata_id,
                payload,
                ..
            } => {
                assert_eq!(*metadata_id, 9);
                assert_eq!(payload, b"event-type-table");
            }
            other => panic!("expected metadata, got {other:?}"),
        }
    }

    mod roundtrip_proptest {
        use super::*;
        use crate::chunk::format::{
            self, padded_u32, CHECKPOINT_FLUSH, EVENT_CHECKPOINT, PADDED_U32_SIZE, POOL_SYMBOL,
        };
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Event { type_id: u64, payload: Vec<u8> },
            SymbolCheckpoint { entries: Vec<(u64, String)> },
        }

        fn arb_op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (64u64..100, prop::collection::vec(any::<u8>(), 0..40))
                    .prop_map(|(type_id, payload)| Op::Event { type_id, payload }),
                prop::collection::vec((1u64..50, "[a-z]{0,12}"), 1..5)
                    .prop_map(|entries| Op::SymbolCheckpoint { entries }),
            ]
        }

        /// Build a checkpoint record the way a checkpoint buffer stages it:
        /// zeroed delta slot, counts patched.
        fn staged_symbol_checkpoint(entries: &[(u64, String)]) -> Vec<u8> {
            let mut record = vec![0; PADDED_U32_SIZE];
            format::put_var_u64(&mut record, EVENT_CHECKPOINT);
            format::put_var_u64(&mut record, 1); // ticks
            format::put_var_u64(&mut record, 0); // duration
            record.extend_from_slice(&padded_u32(0)); // delta
            format::put_var_u64(&mut record, CHECKPOINT_FLUSH);
            record.extend_from_slice(&padded_u32(1)); // pool count
            format::put_var_u64(&mut record, POOL_SYMBOL);
            record.extend_from_slice(&padded_u32(entries.len() as u32));
            for (id, name) in entries {
                format::put_var_u64(&mut record, *id);
                format::put_string(&mut record, name);
            }
            let size = padded_u32(record.len() as u32);
            record[..PADDED_U32_SIZE].copy_from_slice(&size);
            record
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(128))]

            #[test]
            fn chunk_roundtrip_preserves_every_record(ops in prop::collection::vec(arb_op(), 0..24)) {
                let dir = TempDir::new().unwrap();
                let path = dir.path().join("chunk.0.frc");
                let mut writer = ChunkWriter::open(&path, 1).unwrap();
                for op in &ops {
                    match op {
                        Op::Event { type_id, payload } => {
                            writer.append_event(*type_id, payload).unwrap();
                        }
                        Op::SymbolCheckpoint { entries } => {
                            writer
                                .append_checkpoint_records(&staged_symbol_checkpoint(entries))
                                .unwrap();
                        }
                    }
                }
                writer.close().unwrap();

                let mut reader = ChunkReader::open(&path).unwrap();
                let chain = reader.checkpoint_offsets_backward().unwrap();
                let records = reader.read_all().unwrap();
                prop_assert_eq!(records.len(), ops.len());

                let mut expected_symbols: HashMap<u64, String> = HashMap::new();
                let mut checkpoint_count = 0;
                for (op, record) in ops.iter().zip(&records) {
                    match (op, record) {
                        (Op::Event { type_id, payload }, ChunkRecord::Event { type_id: got, payload: got_payload, .. }) => {
                            prop_assert_eq!(type_id, got);
                            prop_assert_eq!(payload, got_payload);
                        }
                        (Op::SymbolCheckpoint { entries }, ChunkRecord::Checkpoint(cp)) => {
                            checkpoint_count += 1;
                            prop_assert_eq!(cp.pools.len(), 1);
                            prop_assert_eq!(cp.pools[0].entries.len(), entries.len());
                            for (id, name) in entries {
                                expected_symbols.insert(*id, name.clone());
                            }
                        }
                        (op, record) => {
                            return Err(TestCaseError::fail(format!("mismatch: {op:?} vs {record:?}")));
                        }
                    }
                }
                // The backward chain finds exactly the checkpoints, and the
                // reader accumulated every definition (last write wins).
                prop_assert_eq!(chain.len(), checkpoint_count);
                prop_assert_eq!(&reader.symbols, &expected_symbols);
            }
        }
    }

    #[test]
    fn test_summary_counts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk.0.frc");
        let mut writer = ChunkWriter::open(&path, 1).unwrap();
        writer.append_event(100, &[0]).unwrap();
        writer.append_event(100, &[1]).unwrap();
        writer.append_event(7, &[2]).unwrap();
        writer.append_metadata(1, &[]).unwrap();
        writer.close().unwrap();

        let mut reader = ChunkReader::open(&path).unwrap();
        let summary = reader.summarize().unwrap();
        assert_eq!(summary.events, 3);
        assert_eq!(summary.metadata_events, 1);
        assert_eq!(summary.events_by_type[&100], 2);
        assert!(summary.is_final);
    }
}
