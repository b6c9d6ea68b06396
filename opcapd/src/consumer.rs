//! Reference consumer: pairs samples with the mapping bytes they announce.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use opcap_common::{MapRecord, RecordKind, SampleRecord, decode_map_records};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::device::MapDevice;
use crate::error::Result;
use crate::sample::SampleStream;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConsumedEvent {
    Fork { pid: u16, child: u32 },
    Exec { pid: u16, mappings: Vec<MapRecord> },
    Map { pid: u16, mappings: Vec<MapRecord> },
    Exit { pid: u16 },
    ModulesChanged,
    Sample { count: u32, pid: u16, aux: u32 },
}

/// Holds the device open for its lifetime.
pub struct Consumer {
    stream: SampleStream,
    device: Arc<MapDevice>,
}

impl Consumer {
    pub fn new(stream: SampleStream, device: Arc<MapDevice>) -> Result<Self> {
        device.open()?;
        Ok(Self { stream, device })
    }

    /// Resolve one sample, reading its mapping bytes when it carries any.
    pub fn decode(&self, sample: SampleRecord) -> Result<ConsumedEvent> {
        let pid = sample.pid;
        let event = match sample.kind() {
            RecordKind::Fork => ConsumedEvent::Fork {
                pid,
                child: sample.aux,
            },
            RecordKind::Drop => ConsumedEvent::Exec {
                pid,
                mappings: self.mappings(&sample)?,
            },
            RecordKind::Map => ConsumedEvent::Map {
                pid,
                mappings: self.mappings(&sample)?,
            },
            RecordKind::Exit => ConsumedEvent::Exit { pid },
            RecordKind::DropModules => ConsumedEvent::ModulesChanged,
            RecordKind::Count(count) | RecordKind::Reserved(count) => ConsumedEvent::Sample {
                count,
                pid,
                aux: sample.aux,
            },
        };
        Ok(event)
    }

    fn mappings(&self, sample: &SampleRecord) -> Result<Vec<MapRecord>> {
        let n = sample.mapping_bytes();
        if n == 0 {
            return Ok(Vec::new());
        }
        if n > self.device.capacity_bytes() {
            warn!(
                "{} for pid {} announced {} mapping bytes, more than the buffer holds",
                sample.kind().label(),
                sample.pid,
                n
            );
            self.device.skip(n)?;
            return Ok(Vec::new());
        }

        let bytes = self.device.read(n)?;
        match decode_map_records(&bytes) {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!("mapping data for pid {} was overwritten: {}", sample.pid, e);
                Ok(Vec::new())
            }
        }
    }

    /// Wait up to `timeout` for the next event.
    pub fn next_event(&self, timeout: Duration) -> Result<Option<ConsumedEvent>> {
        match self.stream.recv_timeout(timeout)? {
            Some(sample) => self.decode(sample).map(Some),
            None => Ok(None),
        }
    }

    /// Every event already queued.
    pub fn drain(&self) -> Result<Vec<ConsumedEvent>> {
        let mut events = Vec::with_capacity(self.stream.pending());
        while let Some(sample) = self.stream.try_recv()? {
            events.push(self.decode(sample)?);
        }
        Ok(events)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Err(e) = self.device.close() {
            debug!("closing mapping buffer: {}", e);
        }
    }
}

/// Run `consumer` on a blocking task, forwarding events until every sample
/// sender is gone or `tx` is closed.
pub fn spawn_consumer(
    consumer: Consumer,
    tx: mpsc::Sender<ConsumedEvent>,
) -> JoinHandle<Result<()>> {
    debug!("starting mapping buffer consumer");
    tokio::task::spawn_blocking(move || {
        while let Some(sample) = consumer.stream.recv()? {
            let event = consumer.decode(sample)?;
            if tx.blocking_send(event).is_err() {
                debug!("event receiver dropped, stopping consumer");
                break;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;
    use crate::metrics::Metrics;
    use crate::process::MappedFile;
    use crate::ring::MappingRingBuffer;
    use crate::sample::{SampleSink, sample_channel};
    use crate::writer::MappingRecordWriter;

    struct Parts {
        writer: MappingRecordWriter,
        device: Arc<MapDevice>,
    }

    fn parts(fragments: usize) -> Parts {
        let metrics = Arc::new(Metrics::new());
        let ring = Arc::new(MappingRingBuffer::new(fragments, Arc::clone(&metrics)).unwrap());
        Parts {
            writer: MappingRecordWriter::new(Arc::clone(&ring), metrics).unwrap(),
            device: Arc::new(MapDevice::new(ring)),
        }
    }

    #[test]
    fn consumer_holds_the_device() {
        let p = parts(8);
        let (_tx, rx) = sample_channel(4, Arc::new(Metrics::new())).unwrap();
        let consumer = Consumer::new(rx, Arc::clone(&p.device)).unwrap();
        assert!(matches!(p.device.open(), Err(CaptureError::Busy)));
        drop(consumer);
        assert!(!p.device.is_open());
    }

    #[test]
    fn drain_pairs_samples_with_mappings() {
        let p = parts(16);
        let (tx, rx) = sample_channel(8, Arc::new(Metrics::new())).unwrap();
        let consumer = Consumer::new(rx, Arc::clone(&p.device)).unwrap();

        tx.emit(SampleRecord::fork(1, 2));
        let mut scratch = vec![0u8; 256];
        p.writer
            .write_mapping_committed(
                0x1000,
                0x1000,
                0,
                &MappedFile::Path("/bin/busybox".into()),
                &mut scratch,
                |n| tx.emit(SampleRecord::map(2, n as u32)),
            )
            .unwrap();
        tx.emit(SampleRecord::new(5, 2, 0xdead));
        tx.emit(SampleRecord::exit(2));

        let events = consumer.drain().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], ConsumedEvent::Fork { pid: 1, child: 2 });
        match &events[1] {
            ConsumedEvent::Map { pid, mappings } => {
                assert_eq!(*pid, 2);
                assert_eq!(mappings[0].path, "/bin/busybox");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            events[2],
            ConsumedEvent::Sample {
                count: 5,
                pid: 2,
                aux: 0xdead
            }
        );
        assert_eq!(events[3], ConsumedEvent::Exit { pid: 2 });
    }

    #[test]
    fn oversized_announcement_is_skipped() {
        let p = parts(4);
        let (tx, rx) = sample_channel(2, Arc::new(Metrics::new())).unwrap();
        let consumer = Consumer::new(rx, Arc::clone(&p.device)).unwrap();
        tx.emit(SampleRecord::exec(3, 80));
        assert_eq!(
            consumer.drain().unwrap(),
            vec![ConsumedEvent::Exec {
                pid: 3,
                mappings: Vec::new()
            }]
        );
        assert_eq!(p.device.capacity_bytes(), 64);
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_string(&ConsumedEvent::Fork { pid: 17, child: 4242 }).unwrap();
        assert_eq!(json, r#"{"event":"fork","pid":17,"child":4242}"#);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawned_consumer_forwards_until_senders_drop() {
        let p = parts(8);
        let (tx, rx) = sample_channel(8, Arc::new(Metrics::new())).unwrap();
        let consumer = Consumer::new(rx, Arc::clone(&p.device)).unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let handle = spawn_consumer(consumer, events_tx);

        tx.emit(SampleRecord::drop_modules());
        tx.emit(SampleRecord::exit(9));
        drop(tx);

        assert_eq!(events_rx.recv().await, Some(ConsumedEvent::ModulesChanged));
        assert_eq!(events_rx.recv().await, Some(ConsumedEvent::Exit { pid: 9 }));
        assert_eq!(events_rx.recv().await, None);
        handle.await.unwrap().unwrap();
        assert!(!p.device.is_open());
    }
}
