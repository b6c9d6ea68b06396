//! Sample channel: fixed-size record encodings on a bounded queue.
//!
//! The sending side runs inside the ring critical section, so it only ever
//! calls `try_send` on a queue whose slots were allocated up front. When the
//! queue is full the sample is dropped and counted.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use opcap_common::{SAMPLE_RECORD_SIZE, SampleRecord};

use crate::error::{CaptureError, Result};
use crate::metrics::Metrics;

/// Destination for lifecycle samples. Implementations must not block or
/// allocate in `emit`.
pub trait SampleSink: Send + Sync {
    /// Returns false when the record was dropped.
    fn emit(&self, record: SampleRecord) -> bool;
}

type Encoded = [u8; SAMPLE_RECORD_SIZE];

#[derive(Clone)]
pub struct SampleChannel {
    tx: Sender<Encoded>,
    metrics: Arc<Metrics>,
}

pub struct SampleStream {
    rx: Receiver<Encoded>,
}

pub fn sample_channel(
    capacity: usize,
    metrics: Arc<Metrics>,
) -> Result<(SampleChannel, SampleStream)> {
    if capacity == 0 {
        return Err(CaptureError::InvalidArgument(
            "sample channel capacity must be nonzero".to_string(),
        ));
    }
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    Ok((SampleChannel { tx, metrics }, SampleStream { rx }))
}

impl SampleSink for SampleChannel {
    fn emit(&self, record: SampleRecord) -> bool {
        match self.tx.try_send(record.encode()) {
            Ok(()) => {
                self.metrics.record_emitted(record.kind());
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.metrics.inc_samples_dropped();
                false
            }
        }
    }
}

impl SampleStream {
    pub fn try_recv(&self) -> Result<Option<SampleRecord>> {
        match self.rx.try_recv() {
            Ok(bytes) => Ok(Some(SampleRecord::decode(&bytes)?)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    /// Block until a sample arrives. `None` once every sender is gone.
    pub fn recv(&self) -> Result<Option<SampleRecord>> {
        match self.rx.recv() {
            Ok(bytes) => Ok(Some(SampleRecord::decode(&bytes)?)),
            Err(_) => Ok(None),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<SampleRecord>> {
        match self.rx.recv_timeout(timeout) {
            Ok(bytes) => Ok(Some(SampleRecord::decode(&bytes)?)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
