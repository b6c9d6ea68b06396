pub mod capture;
pub mod config;
pub mod consumer;
pub mod critical;
pub mod device;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod process;
pub mod ring;
pub mod sample;
pub mod scratch;
pub mod subsystem;
pub mod writer;

pub use capture::Capture;
pub use config::{BufferConfig, CaptureConfig, Config, LoggingConfig, ScratchConfig};
pub use consumer::{ConsumedEvent, Consumer, spawn_consumer};
pub use device::MapDevice;
pub use error::{CaptureError, Result};
pub use hooks::{HookId, HookRegistry, LifecycleEvent, LifecycleHook, MmapRequest, WatchedOp};
pub use metrics::{Metrics, MetricsSnapshot};
pub use process::{MappedFile, ProcessImage, ProcessSource, ProcfsSource, Region};
pub use ring::MappingRingBuffer;
pub use sample::{SampleChannel, SampleSink, SampleStream, sample_channel};
pub use scratch::ScratchPool;
pub use subsystem::Subsystem;
pub use writer::MappingRecordWriter;
