#![cfg_attr(all(feature = "bare", not(feature = "user")), no_std)]

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

pub mod mapping;

pub use mapping::{
    MAP_FRAGMENT_SIZE, MAP_HEADER_FRAGMENTS, MAP_HEADER_SIZE, MapHeader, PATH_PREFIX_LEN,
    continuation_fragments, map_record_size, max_path_len,
};
#[cfg(feature = "user")]
pub use mapping::{MapRecord, decode_map_record, decode_map_records};

// =============================================================================
// SAMPLE STREAM - Shared Record Definitions
// =============================================================================
//
// Every lifecycle event crosses to the consumer as one fixed-size record on the
// sample stream. Ordinary profiling samples and lifecycle events share the
// first field: small values are counts, the top of the u32 range is reserved
// for sentinels.
//
// MEMORY LAYOUT (12 bytes, native endianness):
//   [0..4]   kind_or_count: u32 - sample count or sentinel
//   [4..6]   pid: u16           - acting process (truncated)
//   [6..8]   _pad: u16          - always zero
//   [8..12]  aux: u32           - sentinel-dependent payload
// =============================================================================

/// Sentinel values for `SampleRecord::kind_or_count`.
pub mod sentinel {
    /// Every value at or above this is reserved and never a sample count.
    pub const BASE: u32 = 0xFFFF_FF00;
    /// Process created. `aux` holds the child pid.
    pub const FORK: u32 = BASE | 0x01;
    /// Program replaced. `aux` bytes of mapping records follow.
    pub const DROP: u32 = BASE | 0x02;
    /// Executable mapping created. `aux` bytes of one mapping record follow.
    pub const MAP: u32 = BASE | 0x03;
    /// Process exiting.
    pub const EXIT: u32 = BASE | 0x04;
    /// Module loaded; cached kernel symbol tables are stale.
    pub const DROP_MODULES: u32 = BASE | 0x05;

    pub const fn is_reserved(value: u32) -> bool {
        value >= BASE
    }
}

/// One event on the sample stream.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct SampleRecord {
    pub kind_or_count: u32,
    pub pid: u16,
    #[cfg_attr(feature = "user", serde(skip))]
    pub _pad: u16,
    pub aux: u32,
}

pub const SAMPLE_RECORD_SIZE: usize = size_of::<SampleRecord>();

const _: () = assert!(SAMPLE_RECORD_SIZE == 12);

/// Errors raised while decoding records produced by the capture side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed record: expected {expected} bytes, got {actual}")]
    MalformedRecord { expected: usize, actual: usize },

    #[error("truncated mapping record: needs {needed} bytes, {available} available")]
    TruncatedMapping { needed: usize, available: usize },
}

impl SampleRecord {
    /// Build a record. The pid is truncated to 16 bits, which wraps for pids
    /// above 65535.
    pub const fn new(kind_or_count: u32, pid: u32, aux: u32) -> Self {
        Self {
            kind_or_count,
            pid: pid as u16,
            _pad: 0,
            aux,
        }
    }

    pub const fn fork(parent: u32, child: u32) -> Self {
        Self::new(sentinel::FORK, parent, child)
    }

    /// Program replacement followed by `mapping_bytes` of mapping records.
    pub const fn exec(pid: u32, mapping_bytes: u32) -> Self {
        Self::new(sentinel::DROP, pid, mapping_bytes)
    }

    pub const fn map(pid: u32, mapping_bytes: u32) -> Self {
        Self::new(sentinel::MAP, pid, mapping_bytes)
    }

    pub const fn exit(pid: u32) -> Self {
        Self::new(sentinel::EXIT, pid, 0)
    }

    pub const fn drop_modules() -> Self {
        Self::new(sentinel::DROP_MODULES, 0, 0)
    }

    pub fn kind(&self) -> RecordKind {
        RecordKind::from(self.kind_or_count)
    }

    /// Number of mapping-buffer bytes the consumer must read for this record.
    pub fn mapping_bytes(&self) -> usize {
        if self.kind().carries_mappings() {
            self.aux as usize
        } else {
            0
        }
    }

    pub fn encode(&self) -> [u8; SAMPLE_RECORD_SIZE] {
        let mut out = [0u8; SAMPLE_RECORD_SIZE];
        out.copy_from_slice(bytemuck::bytes_of(self));
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != SAMPLE_RECORD_SIZE {
            return Err(DecodeError::MalformedRecord {
                expected: SAMPLE_RECORD_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
}

/// Classification of `kind_or_count`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum RecordKind {
    Count(u32),
    Fork,
    Drop,
    Map,
    Exit,
    DropModules,
    /// Inside the sentinel range but not assigned.
    Reserved(u32),
}

impl From<u32> for RecordKind {
    fn from(raw: u32) -> Self {
        match raw {
            sentinel::FORK => RecordKind::Fork,
            sentinel::DROP => RecordKind::Drop,
            sentinel::MAP => RecordKind::Map,
            sentinel::EXIT => RecordKind::Exit,
            sentinel::DROP_MODULES => RecordKind::DropModules,
            x if sentinel::is_reserved(x) => RecordKind::Reserved(x),
            x => RecordKind::Count(x),
        }
    }
}

impl RecordKind {
    pub const fn raw(self) -> u32 {
        match self {
            RecordKind::Count(n) | RecordKind::Reserved(n) => n,
            RecordKind::Fork => sentinel::FORK,
            RecordKind::Drop => sentinel::DROP,
            RecordKind::Map => sentinel::MAP,
            RecordKind::Exit => sentinel::EXIT,
            RecordKind::DropModules => sentinel::DROP_MODULES,
        }
    }

    pub const fn carries_mappings(self) -> bool {
        matches!(self, RecordKind::Drop | RecordKind::Map)
    }

    pub const fn label(self) -> &'static str {
        match self {
            RecordKind::Count(_) => "Count",
            RecordKind::Fork => "Fork",
            RecordKind::Drop => "Exec",
            RecordKind::Map => "Map",
            RecordKind::Exit => "Exit",
            RecordKind::DropModules => "DropModules",
            RecordKind::Reserved(_) => "Reserved",
        }
    }
}
