//! The capture hook: turns lifecycle events into samples and mapping records.

use std::fmt::Display;
use std::sync::Arc;

use log::{debug, warn};
use opcap_common::SampleRecord;

use crate::hooks::{HookId, HookRegistry, LifecycleEvent, LifecycleHook, MmapRequest, WatchedOp};
use crate::metrics::Metrics;
use crate::process::ProcessSource;
use crate::sample::SampleSink;
use crate::scratch::ScratchPool;
use crate::writer::MappingRecordWriter;

pub struct Capture {
    writer: MappingRecordWriter,
    scratch: ScratchPool,
    source: Arc<dyn ProcessSource>,
    sink: Arc<dyn SampleSink>,
    metrics: Arc<Metrics>,
}

fn aux_bytes(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl Capture {
    pub fn new(
        writer: MappingRecordWriter,
        scratch: ScratchPool,
        source: Arc<dyn ProcessSource>,
        sink: Arc<dyn SampleSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            writer,
            scratch,
            source,
            sink,
            metrics,
        }
    }

    pub fn install(self: &Arc<Self>, registry: &HookRegistry, ops: &[WatchedOp]) -> HookId {
        registry.install(Arc::clone(self) as Arc<dyn LifecycleHook>, ops)
    }

    pub fn writer(&self) -> &MappingRecordWriter {
        &self.writer
    }

    /// Emit `record` without mapping data after a capture-side failure.
    fn degrade(&self, record: SampleRecord, what: &str, cause: &dyn Display) {
        warn!("{} for pid {} captured without mappings: {}", what, record.pid, cause);
        self.metrics.inc_degraded();
        self.sink.emit(record);
    }

    fn on_replaced(&self, pid: u32) {
        let mut page = match self.scratch.acquire() {
            Ok(page) => page,
            Err(e) => return self.degrade(SampleRecord::exec(pid, 0), "exec", &e),
        };
        let image = match self.source.snapshot(pid) {
            Ok(image) => image,
            Err(e) => return self.degrade(SampleRecord::exec(pid, 0), "exec", &e),
        };

        let sink = &self.sink;
        let bytes = self
            .writer
            .write_mappings_for_committed(&image, &mut page, |n| {
                sink.emit(SampleRecord::exec(pid, aux_bytes(n)))
            });
        debug!("exec pid={} mapping_bytes={}", pid, bytes);
    }

    fn on_mapped(&self, pid: u32, addr: u64, request: &MmapRequest) {
        let Some(file) = request.file.as_ref() else {
            debug!("pid {} anonymous executable mapping at {:#x}, skipped", pid, addr);
            return;
        };
        let mut page = match self.scratch.acquire() {
            Ok(page) => page,
            Err(e) => return self.degrade(SampleRecord::map(pid, 0), "mmap", &e),
        };

        let sink = &self.sink;
        let written = self.writer.write_mapping_committed(
            addr,
            request.len,
            request.offset,
            file,
            &mut page,
            |n| sink.emit(SampleRecord::map(pid, aux_bytes(n))),
        );
        match written {
            Ok(bytes) => debug!("mmap pid={} addr={:#x} mapping_bytes={}", pid, addr, bytes),
            Err(e) => self.degrade(SampleRecord::map(pid, 0), "mmap", &e),
        }
    }
}

impl LifecycleHook for Capture {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn on_event(&self, event: &LifecycleEvent<'_>) {
        match *event {
            LifecycleEvent::Created { op, parent, child } => {
                debug!("{:?} {} -> {}", op, parent, child);
                self.sink.emit(SampleRecord::fork(parent, child));
            }
            LifecycleEvent::Replaced { pid } => self.on_replaced(pid),
            LifecycleEvent::Mapped {
                pid, addr, request, ..
            } => self.on_mapped(pid, addr, request),
            LifecycleEvent::ModuleLoaded => {
                debug!("module loaded, dropping module mappings");
                self.sink.emit(SampleRecord::drop_modules());
            }
            LifecycleEvent::Exiting { pid, code } => {
                debug!("exit pid={} code={}", pid, code);
                self.sink.emit(SampleRecord::exit(pid));
            }
        }
    }
}
