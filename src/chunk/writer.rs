//! Append-only chunk file writer.
//!
//! The writer owns one open chunk at a time and moves through
//! Closed → Open → Writing → Closing → Closed. Patch slots in the header
//! (size, duration, checkpoint/metadata offsets) are rewritten on close;
//! checkpoint records get their backward delta patched as they are appended,
//! which threads them into an intrusive linked list through the file.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::format::{
    self, padded_u32, ChunkHeader, Decoder, HEADER_SIZE, PADDED_U32_BITS, PADDED_U32_SIZE,
};
use crate::clock;

/// Largest chunk the checkpoint back-reference can span: the delta is a
/// zigzag value in a padded u32 slot.
pub const MAX_CHUNK_SPAN: u64 = 1 << (PADDED_U32_BITS - 1);

pub struct ChunkWriter {
    file: BufWriter<File>,
    path: PathBuf,
    offset: u64,
    last_checkpoint_offset: u64,
    metadata_offset: u64,
    start_ticks: u64,
    start_nanos: u64,
    generation: u8,
    scratch: Vec<u8>,
}

impl ChunkWriter {
    /// Create the chunk file and reserve its header. Start times are latched
    /// here for the duration computation at close.
    pub fn open(path: impl AsRef<Path>, generation: u8) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut writer = Self {
            file: BufWriter::new(file),
            path,
            offset: HEADER_SIZE as u64,
            last_checkpoint_offset: 0,
            metadata_offset: 0,
            start_ticks: clock::ticks_now(),
            start_nanos: clock::wall_nanos(),
            generation,
            scratch: Vec::new(),
        };
        let header = writer.header(false);
        header.write_to(&mut writer.file)?;
        Ok(writer)
    }

    fn header(&self, is_final: bool) -> ChunkHeader {
        ChunkHeader {
            chunk_size: self.offset,
            last_checkpoint_offset: self.last_checkpoint_offset,
            metadata_offset: self.metadata_offset,
            start_nanos: self.start_nanos,
            duration_nanos: clock::ticks_now().saturating_sub(self.start_ticks),
            start_ticks: self.start_ticks,
            ticks_per_second: clock::TICKS_PER_SECOND,
            generation: self.generation,
            is_final,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended so far, header included.
    pub fn size(&self) -> u64 {
        self.offset
    }

    pub fn start_ticks(&self) -> u64 {
        self.start_ticks
    }

    /// Append already-framed event records drained from a buffer.
    pub fn append_record_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Frame and append a single event with the given payload.
    pub fn append_event(&mut self, type_id: u64, payload: &[u8]) -> io::Result<()> {
        let mut record = std::mem::take(&mut self.scratch);
        record.clear();
        record.extend_from_slice(&[0; PADDED_U32_SIZE]);
        format::put_var_u64(&mut record, type_id);
        format::put_var_u64(&mut record, clock::ticks_now());
        record.extend_from_slice(payload);
        let size = padded_u32(record.len() as u32);
        record[..PADDED_U32_SIZE].copy_from_slice(&size);
        let result = self.append_record_bytes(&record);
        self.scratch = record;
        result
    }

    /// Append back-to-back checkpoint records, patching each record's
    /// backward delta slot and advancing the last-checkpoint chain.
    ///
    /// Records arrive with a zeroed delta slot; malformed input is rejected
    /// rather than written, so a buffer corruption cannot poison the chain.
    pub fn append_checkpoint_records(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut dec = Decoder::new(bytes);
        while dec.remaining() > 0 {
            let record_start = dec.offset();
            let size = dec.padded_u32()? as usize;
            if size < PADDED_U32_SIZE || size > dec.remaining() + PADDED_U32_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "malformed checkpoint record",
                ));
            }
            let type_id = dec.var_u64()?;
            if type_id != format::EVENT_CHECKPOINT {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "non-checkpoint record in checkpoint buffer",
                ));
            }
            dec.var_u64()?; // start ticks
            dec.var_u64()?; // duration
            let delta_slot = dec.offset() - record_start;
            dec.skip(size - delta_slot)?;

            let record_offset = self.offset;
            let delta = if self.last_checkpoint_offset == 0 {
                0
            } else {
                self.last_checkpoint_offset as i64 - record_offset as i64
            };
            debug_assert!(delta <= 0);
            debug_assert!(delta.unsigned_abs() < MAX_CHUNK_SPAN);

            let mut record = std::mem::take(&mut self.scratch);
            record.clear();
            record.extend_from_slice(&bytes[record_start..record_start + size]);
            record[delta_slot..delta_slot + PADDED_U32_SIZE]
                .copy_from_slice(&padded_u32(format::zigzag(delta) as u32));
            let result = self.append_record_bytes(&record);
            self.scratch = record;
            result?;
            self.last_checkpoint_offset = record_offset;
        }
        Ok(())
    }

    /// Append a metadata event and remember its offset for the header.
    pub fn append_metadata(&mut self, metadata_id: u64, payload: &[u8]) -> io::Result<()> {
        let offset = self.offset;
        let mut body = Vec::with_capacity(payload.len() + 12);
        format::put_var_u64(&mut body, 0); // duration
        format::put_var_u64(&mut body, metadata_id);
        body.extend_from_slice(payload);
        self.append_event(format::EVENT_METADATA, &body)?;
        self.metadata_offset = offset;
        Ok(())
    }

    /// Repatch the header mid-chunk so a crash leaves a readable prefix.
    pub fn flush_header(&mut self) -> io::Result<()> {
        self.patch_header(false)
    }

    fn patch_header(&mut self, is_final: bool) -> io::Result<()> {
        self.file.flush()?;
        self.file.seek(SeekFrom::Start(0))?;
        let header = self.header(is_final);
        header.write_to(&mut self.file)?;
        self.file.flush()?;
        self.file.seek(SeekFrom::Start(self.offset))?;
        Ok(())
    }

    /// Finalize the chunk: patch size, duration, offsets and the final bit.
    /// Returns the chunk size.
    pub fn close(mut self) -> io::Result<u64> {
        self.patch_header(true)?;
        Ok(self.offset)
    }

    /// Best-effort close for the fatal-error path: patch what we can and
    /// leave the final bit unset so readers know the chunk was truncated.
    pub fn emergency_close(mut self) -> io::Result<u64> {
        self.patch_header(false)?;
        Ok(self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::format::{EVENT_CHECKPOINT, EVENT_DATA_LOSS};
    use std::io::Read;
    use tempfile::TempDir;

    fn read_header(path: &Path) -> ChunkHeader {
        let mut file = File::open(path).unwrap();
        ChunkHeader::read_from(&mut file).unwrap()
    }

    /// Build a checkpoint record with a zeroed delta slot, as the
    /// checkpoint writer stages them in its buffers.
    fn staged_checkpoint_record(ticks: u64, kind: u64) -> Vec<u8> {
        let mut record = vec![0; PADDED_U32_SIZE];
        format::put_var_u64(&mut record, EVENT_CHECKPOINT);
        format::put_var_u64(&mut record, ticks);
        format::put_var_u64(&mut record, 0);
        record.extend_from_slice(&padded_u32(0));
        format::put_var_u64(&mut record, kind);
        record.extend_from_slice(&padded_u32(0)); // pool count
        let size = padded_u32(record.len() as u32);
        record[..PADDED_U32_SIZE].copy_from_slice(&size);
        record
    }

    #[test]
    fn test_open_reserves_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk.0.frc");
        let writer = ChunkWriter::open(&path, 1).unwrap();
        assert_eq!(writer.size(), HEADER_SIZE as u64);
        drop(writer);
        let header = read_header(&path);
        assert!(!header.is_final);
        assert_eq!(header.generation, 1);
    }

    #[test]
    fn test_close_patches_size_and_final_bit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk.0.frc");
        let mut writer = ChunkWriter::open(&path, 1).unwrap();
        writer.append_event(EVENT_DATA_LOSS, &[1, 2, 3]).unwrap();
        let size = writer.close().unwrap();
        let header = read_header(&path);
        assert!(header.is_final);
        assert_eq!(header.chunk_size, size);
        assert_eq!(header.chunk_size, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_checkpoint_chain_links_backward() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk.0.frc");
        let mut writer = ChunkWriter::open(&path, 1).unwrap();

        let first = staged_checkpoint_record(10, 0);
        let first_offset = writer.size();
        writer.append_checkpoint_records(&first).unwrap();
        let second = staged_checkpoint_record(20, 0);
        let second_offset = writer.size();
        writer.append_checkpoint_records(&second).unwrap();
        writer.close().unwrap();

        let header = read_header(&path);
        assert_eq!(header.last_checkpoint_offset, second_offset);

        // Decode the second record's delta and follow it to the first.
        let mut contents = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        let mut dec = Decoder::new(&contents[second_offset as usize..]);
        dec.padded_u32().unwrap();
        dec.var_u64().unwrap();
        dec.var_u64().unwrap();
        dec.var_u64().unwrap();
        let delta = format::unzigzag(u64::from(dec.padded_u32().unwrap()));
        assert_eq!(second_offset as i64 + delta, first_offset as i64);
    }

    #[test]
    fn test_first_checkpoint_has_zero_delta() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk.0.frc");
        let mut writer = ChunkWriter::open(&path, 1).unwrap();
        let offset = writer.size();
        writer
            .append_checkpoint_records(&staged_checkpoint_record(5, 1))
            .unwrap();
        writer.close().unwrap();

        let mut contents = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        let mut dec = Decoder::new(&contents[offset as usize..]);
        dec.padded_u32().unwrap();
        dec.var_u64().unwrap();
        dec.var_u64().unwrap();
        dec.var_u64().unwrap();
        assert_eq!(dec.padded_u32().unwrap(), 0);
    }

    #[test]
    fn test_rejects_non_checkpoint_record_in_chain() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk.0.frc");
        let mut writer = ChunkWriter::open(&path, 1).unwrap();
        let mut record = vec![0; PADDED_U32_SIZE];
        format::put_var_u64(&mut record, EVENT_DATA_LOSS);
        let size = padded_u32(record.len() as u32);
        record[..PADDED_U32_SIZE].copy_from_slice(&size);
        assert!(writer.append_checkpoint_records(&record).is_err());
    }

    #[test]
    fn test_metadata_offset_recorded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk.0.frc");
        let mut writer = ChunkWriter::open(&path, 2).unwrap();
        let expected = writer.size();
        writer.append_metadata(7, b"types").unwrap();
        writer.close().unwrap();
        let header = read_header(&path);
        assert_eq!(header.metadata_offset, expected);
    }

    #[test]
    fn test_emergency_close_leaves_final_bit_unset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk.0.frc");
        let mut writer = ChunkWriter::open(&path, 1).unwrap();
        writer.append_event(EVENT_DATA_LOSS, &[]).unwrap();
        writer.emergency_close().unwrap();
        let header = read_header(&path);
        assert!(!header.is_final);
        assert_eq!(header.chunk_size, std::fs::metadata(&path).unwrap().len());
    }
}
