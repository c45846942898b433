//! Loss and pressure accounting.
//!
//! Data loss is the designed failure mode of every exhaustion path, so it is
//! counted precisely: a discarded buffer adds its exact unflushed byte count
//! here, and the recorder periodically emits the totals as a low-frequency
//! event rather than surfacing an error anywhere.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RecorderStats {
    lost_bytes: AtomicU64,
    lost_records: AtomicU64,
    discarded_buffers: AtomicU64,
    leases: AtomicU64,
    transients: AtomicU64,
    sample_drops: AtomicU64,
}

impl RecorderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_lost(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.lost_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.lost_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_discarded_buffer(&self, bytes: u64) {
        self.discarded_buffers.fetch_add(1, Ordering::Relaxed);
        self.add_lost(bytes);
    }

    pub fn add_lease(&self) {
        self.leases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_transient(&self) {
        self.transients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sample_drops(&self, count: u64) {
        if count > 0 {
            self.sample_drops.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            lost_bytes: self.lost_bytes.load(Ordering::Relaxed),
            lost_records: self.lost_records.load(Ordering::Relaxed),
            discarded_buffers: self.discarded_buffers.load(Ordering::Relaxed),
            leases: self.leases.load(Ordering::Relaxed),
            transients: self.transients.load(Ordering::Relaxed),
            sample_drops: self.sample_drops.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values. `Serialize` is for JSON convenience in
/// tooling; the in-chunk representation is the hand-encoded loss event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub lost_bytes: u64,
    pub lost_records: u64,
    pub discarded_buffers: u64,
    pub leases: u64,
    pub transients: u64,
    pub sample_drops: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_accounting_is_exact() {
        let stats = RecorderStats::new();
        stats.add_lost(100);
        stats.add_lost(23);
        stats.add_lost(0);
        let snap = stats.snapshot();
        assert_eq!(snap.lost_bytes, 123);
        assert_eq!(snap.lost_records, 2);
    }

    #[test]
    fn test_discard_counts_buffer_and_bytes() {
        let stats = RecorderStats::new();
        stats.add_discarded_buffer(64);
        let snap = stats.snapshot();
        assert_eq!(snap.discarded_buffers, 1);
        assert_eq!(snap.lost_bytes, 64);
    }

    #[test]
    fn test_snapshot_serializes_for_tooling() {
        let stats = RecorderStats::new();
        stats.add_lost(7);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["lost_bytes"], 7);
        assert_eq!(json["lost_records"], 1);
    }
}
