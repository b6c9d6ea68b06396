//! Wires the capture pieces together from a [`Config`].

use std::sync::Arc;

use log::info;

use crate::capture::Capture;
use crate::config::Config;
use crate::consumer::Consumer;
use crate::device::MapDevice;
use crate::error::{CaptureError, Result};
use crate::hooks::{HookId, HookRegistry};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::process::{ProcessSource, ProcfsSource};
use crate::ring::MappingRingBuffer;
use crate::sample::{SampleStream, sample_channel};
use crate::scratch::ScratchPool;
use crate::writer::MappingRecordWriter;

pub struct Subsystem {
    metrics: Arc<Metrics>,
    registry: Arc<HookRegistry>,
    capture: Arc<Capture>,
    hook: HookId,
    device: Arc<MapDevice>,
    stream: Option<SampleStream>,
}

impl Subsystem {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_source(config, Arc::new(ProcfsSource))
    }

    pub fn with_source(config: &Config, source: Arc<dyn ProcessSource>) -> Result<Self> {
        if config.capture.watch.is_empty() {
            return Err(CaptureError::InvalidArgument(
                "capture.watch lists no operations".to_string(),
            ));
        }

        let metrics = Arc::new(Metrics::new());
        let ring = Arc::new(MappingRingBuffer::new(
            config.buffer.map_fragments,
            Arc::clone(&metrics),
        )?);
        let writer = MappingRecordWriter::new(Arc::clone(&ring), Arc::clone(&metrics))?;
        let scratch = ScratchPool::new(config.scratch.page_size, config.scratch.max_pages)?;
        let (sink, stream) = sample_channel(config.buffer.sample_capacity, Arc::clone(&metrics))?;

        let capture = Arc::new(Capture::new(
            writer,
            scratch,
            source,
            Arc::new(sink),
            Arc::clone(&metrics),
        ));
        let registry = Arc::new(HookRegistry::new());
        let hook = capture.install(&registry, &config.capture.watch);
        info!(
            "capture installed: {} ops, {} scratch pages of {} bytes",
            config.capture.watch.len(),
            config.scratch.max_pages,
            config.scratch.page_size
        );

        Ok(Self {
            metrics,
            registry,
            capture,
            hook,
            device: Arc::new(MapDevice::new(ring)),
            stream: Some(stream),
        })
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    pub fn device(&self) -> &Arc<MapDevice> {
        &self.device
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn capture(&self) -> &Arc<Capture> {
        &self.capture
    }

    /// The sample stream has a single owner; later calls get `None`.
    pub fn take_stream(&mut self) -> Option<SampleStream> {
        self.stream.take()
    }

    /// Open the device and take the sample stream.
    pub fn consumer(&mut self) -> Result<Consumer> {
        let stream = self.take_stream().ok_or(CaptureError::Busy)?;
        Consumer::new(stream, Arc::clone(&self.device))
    }

    /// Uninstall the capture hook. Once every clone of the registry is gone
    /// the sample senders drop and a running consumer drains and stops.
    pub fn shutdown(self) -> MetricsSnapshot {
        self.registry.uninstall(self.hook);
        info!("capture uninstalled");
        self.metrics.snapshot()
    }
}
