use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use opcap_common::RecordKind;
use serde::Serialize;

const KIND_SLOTS: usize = 6;

fn kind_slot(kind: RecordKind) -> usize {
    match kind {
        RecordKind::Fork => 0,
        RecordKind::Drop => 1,
        RecordKind::Map => 2,
        RecordKind::Exit => 3,
        RecordKind::DropModules => 4,
        RecordKind::Count(_) | RecordKind::Reserved(_) => 5,
    }
}

/// Counters for the capture subsystem.
///
/// Updated from inside watched operations, so all fields are atomic.
pub struct Metrics {
    pub start_time: SystemTime,
    samples_emitted: AtomicU64,
    samples_dropped: AtomicU64,
    emitted_by_kind: [AtomicU64; KIND_SLOTS],
    mapping_records: AtomicU64,
    fragments_written: AtomicU64,
    fragments_lost: AtomicU64,
    degraded_events: AtomicU64,
    bytes_read: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            samples_emitted: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            emitted_by_kind: std::array::from_fn(|_| AtomicU64::new(0)),
            mapping_records: AtomicU64::new(0),
            fragments_written: AtomicU64::new(0),
            fragments_lost: AtomicU64::new(0),
            degraded_events: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        }
    }

    pub fn record_emitted(&self, kind: RecordKind) {
        self.samples_emitted.fetch_add(1, Ordering::Relaxed);
        self.emitted_by_kind[kind_slot(kind)].fetch_add(1, Ordering::Relaxed);
    }

    /// Sample channel was full; the record was discarded.
    pub fn inc_samples_dropped(&self) {
        self.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mappings(&self, records: usize, fragments: usize) {
        self.mapping_records.fetch_add(records as u64, Ordering::Relaxed);
        self.fragments_written.fetch_add(fragments as u64, Ordering::Relaxed);
    }

    /// Unread fragments overwritten by the write cursor.
    pub fn add_fragments_lost(&self, n: usize) {
        self.fragments_lost.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_degraded(&self) {
        self.degraded_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn samples_emitted(&self) -> u64 {
        self.samples_emitted.load(Ordering::Relaxed)
    }

    pub fn samples_dropped(&self) -> u64 {
        self.samples_dropped.load(Ordering::Relaxed)
    }

    pub fn emitted(&self, kind: RecordKind) -> u64 {
        self.emitted_by_kind[kind_slot(kind)].load(Ordering::Relaxed)
    }

    pub fn fragments_written(&self) -> u64 {
        self.fragments_written.load(Ordering::Relaxed)
    }

    pub fn fragments_lost(&self) -> u64 {
        self.fragments_lost.load(Ordering::Relaxed)
    }

    pub fn degraded_events(&self) -> u64 {
        self.degraded_events.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            samples_emitted: self.samples_emitted(),
            samples_dropped: self.samples_dropped(),
            fork: self.emitted(RecordKind::Fork),
            exec: self.emitted(RecordKind::Drop),
            map: self.emitted(RecordKind::Map),
            exit: self.emitted(RecordKind::Exit),
            drop_modules: self.emitted(RecordKind::DropModules),
            mapping_records: self.mapping_records.load(Ordering::Relaxed),
            fragments_written: self.fragments_written(),
            fragments_lost: self.fragments_lost(),
            degraded_events: self.degraded_events(),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub samples_emitted: u64,
    pub samples_dropped: u64,
    pub fork: u64,
    pub exec: u64,
    pub map: u64,
    pub exit: u64,
    pub drop_modules: u64,
    pub mapping_records: u64,
    pub fragments_written: u64,
    pub fragments_lost: u64,
    pub degraded_events: u64,
    pub bytes_read: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_kind() {
        let m = Metrics::new();
        m.record_emitted(RecordKind::Fork);
        m.record_emitted(RecordKind::Fork);
        m.record_emitted(RecordKind::Map);
        m.record_mappings(1, 5);
        m.inc_samples_dropped();

        let snap = m.snapshot();
        assert_eq!(snap.samples_emitted, 3);
        assert_eq!(snap.fork, 2);
        assert_eq!(snap.map, 1);
        assert_eq!(snap.exec, 0);
        assert_eq!(snap.fragments_written, 5);
        assert_eq!(snap.samples_dropped, 1);
    }
}
