//! Per-thread event serialization over [`Storage`].
//!
//! Records are framed exactly as they appear in the chunk — a padded u32
//! size slot, the event type id, the start ticks, then the payload — so the
//! drain path copies committed buffer ranges into the file verbatim.
//!
//! Writes are transactional: payload bytes are staged beyond the committed
//! position and the position only advances at [`InFlightEvent::commit`], so
//! an abandoned or failed event leaves no partial record behind.

use std::sync::Arc;

use crate::buffer::{Buffer, WriterId};
use crate::chunk::format::{self, padded_u32, PADDED_U32_SIZE};
use crate::clock;
use crate::storage::Storage;

pub struct EventWriter<'a> {
    storage: &'a Storage,
    id: WriterId,
    buffer: Option<Arc<Buffer>>,
}

impl<'a> EventWriter<'a> {
    /// Writer bound to the calling thread's identity.
    pub fn new(storage: &'a Storage) -> Self {
        Self::with_id(storage, WriterId::current())
    }

    pub fn with_id(storage: &'a Storage, id: WriterId) -> Self {
        Self {
            storage,
            id,
            buffer: None,
        }
    }

    pub fn id(&self) -> WriterId {
        self.id
    }

    /// Begin a record. Returns `None` when no buffer can be obtained —
    /// the event is dropped and counted as lost.
    pub fn start_event(&mut self, type_id: u64) -> Option<InFlightEvent<'_, 'a>> {
        if self.buffer.is_none() {
            self.buffer = self.storage.acquire_thread_local(self.id);
        }
        if self.buffer.is_none() {
            self.storage.stats().add_lost(1);
            return None;
        }
        let mut event = InFlightEvent {
            writer: self,
            used: 0,
            failed: false,
        };
        event.push_raw(&[0; PADDED_U32_SIZE]);
        event.write_u64(type_id);
        event.write_u64(clock::ticks_now());
        Some(event)
    }

    fn buffer(&self) -> &Arc<Buffer> {
        self.buffer.as_ref().expect("event writer has no buffer")
    }
}

impl Drop for EventWriter<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            if buf.is_lease() || buf.is_transient() {
                self.storage.release_large(&buf, self.id);
            }
        }
        self.storage.release_thread(self.id);
    }
}

/// A record under construction. Dropping without [`commit`](Self::commit)
/// abandons the staged bytes.
pub struct InFlightEvent<'w, 'a> {
    writer: &'w mut EventWriter<'a>,
    /// Bytes staged beyond the committed position, size slot included.
    used: usize,
    failed: bool,
}

impl InFlightEvent<'_, '_> {
    fn ensure(&mut self, additional: usize) -> bool {
        if self.failed {
            return false;
        }
        let cur = Arc::clone(self.writer.buffer());
        if cur.free_size() >= self.used + additional {
            return true;
        }
        match self
            .writer
            .storage
            .flush(&cur, self.used, additional, self.writer.id)
        {
            Some(next) => {
                self.writer.buffer = Some(next);
                true
            }
            None => {
                self.failed = true;
                self.writer.storage.stats().add_lost(self.used as u64);
                false
            }
        }
    }

    fn push_raw(&mut self, bytes: &[u8]) {
        if !self.ensure(bytes.len()) {
            return;
        }
        let buf = self.writer.buffer();
        // SAFETY: the writer owns the buffer and `ensure` verified the
        // in-flight range stays within capacity.
        unsafe { buf.write_unbuffered(buf.pos() + self.used, bytes) };
        self.used += bytes.len();
    }

    pub fn write_u64(&mut self, value: u64) {
        let mut scratch = smallvec::SmallVec::<[u8; 10]>::new();
        let mut v = value;
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                scratch.push(byte);
                break;
            }
            scratch.push(byte | 0x80);
        }
        self.push_raw(&scratch);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_u64(format::zigzag(value));
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_u64(value.len() as u64);
        self.push_raw(value.as_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.push_raw(bytes);
    }

    /// Patch the size slot and publish the record. Oversized buffers picked
    /// up along the way are handed back immediately after commit.
    ///
    /// Returns the committed record size, or 0 if the event failed and was
    /// dropped.
    pub fn commit(self) -> usize {
        if self.failed {
            return 0;
        }
        let buf = Arc::clone(self.writer.buffer());
        let record_start = buf.pos();
        // SAFETY: owner-only patch of the reserved slot inside the
        // in-flight record.
        unsafe { buf.patch_unbuffered(record_start, &padded_u32(self.used as u32)) };
        buf.set_pos(record_start + self.used);
        if buf.is_lease() || buf.is_transient() {
            self.writer.storage.release_large(&buf, self.writer.id);
            self.writer.buffer = None;
        }
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::format::Decoder;
    use crate::options::RecorderOptions;
    use crate::stats::RecorderStats;

    fn small_storage() -> Storage {
        let mut opts = RecorderOptions::default();
        opts.thread_buffer_size = 256;
        opts.global_buffer_size = 512;
        Storage::new(&opts, Arc::new(RecorderStats::new()))
    }

    /// Decode every record in `bytes`, returning (type id, payload bytes).
    fn decode_records(bytes: &[u8]) -> Vec<(u64, Vec<u8>)> {
        let mut dec = Decoder::new(bytes);
        let mut records = Vec::new();
        while dec.remaining() > 0 {
            let start = dec.offset();
            let size = dec.padded_u32().unwrap() as usize;
            let type_id = dec.var_u64().unwrap();
            dec.var_u64().unwrap(); // ticks
            let consumed = dec.offset() - start;
            let payload = dec.bytes(size - consumed).unwrap().to_vec();
            records.push((type_id, payload));
        }
        records
    }

    #[test]
    fn test_committed_range_is_whole_records() {
        let storage = small_storage();
        let mut writer = EventWriter::with_id(&storage, WriterId::new(1));
        for i in 0..3u64 {
            let mut event = writer.start_event(100 + i).unwrap();
            event.write_u64(i);
            event.write_string("payload");
            assert!(event.commit() > 0);
        }
        let buf = Arc::clone(writer.buffer());
        let records = buf.peek_committed(decode_records);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].0, 100);
        assert_eq!(records[2].0, 102);
    }

    #[test]
    fn test_abandoned_event_leaves_no_partial_record() {
        let storage = small_storage();
        let mut writer = EventWriter::with_id(&storage, WriterId::new(1));
        {
            let mut event = writer.start_event(100).unwrap();
            event.write_u64(42);
            // Dropped without commit.
        }
        let buf = Arc::clone(writer.buffer());
        assert_eq!(buf.unflushed_size(), 0);
        // The next event is framed cleanly from the same position.
        let mut event = writer.start_event(101).unwrap();
        event.write_u64(7);
        event.commit();
        let records = buf.peek_committed(decode_records);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, 101);
    }

    #[test]
    fn test_oversized_event_escalates_and_commits_once() {
        let storage = small_storage();
        let mut writer = EventWriter::with_id(&storage, WriterId::new(1));
        // Fill most of the 256-byte dedicated buffer first.
        let mut event = writer.start_event(100).unwrap();
        event.write_bytes(&[1u8; 180]);
        event.commit();
        // This record cannot fit; it must follow the escalation path and
        // still commit exactly once.
        let mut big = writer.start_event(101).unwrap();
        big.write_bytes(&[2u8; 300]);
        assert!(big.commit() > 0);

        let snapshot = storage.stats().snapshot();
        assert_eq!(snapshot.lost_bytes, 0);
        assert!(snapshot.leases >= 1);
        // Both records travelled with the lease and were retired together
        // for the recorder to drain.
        assert_eq!(storage.full_count(), 1);
    }

    #[test]
    fn test_varint_fields_decode_exactly() {
        let storage = small_storage();
        let mut writer = EventWriter::with_id(&storage, WriterId::new(1));
        let mut event = writer.start_event(200).unwrap();
        event.write_u64(300);
        event.write_i64(-42);
        event.write_string("Foo");
        event.commit();

        let buf = Arc::clone(writer.buffer());
        let records = buf.peek_committed(decode_records);
        assert_eq!(records.len(), 1);
        let mut dec = Decoder::new(&records[0].1);
        assert_eq!(dec.var_u64().unwrap(), 300);
        assert_eq!(dec.var_i64().unwrap(), -42);
        assert_eq!(dec.string().unwrap(), "Foo");
        assert_eq!(dec.remaining(), 0);
    }
}
