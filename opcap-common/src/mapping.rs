// =============================================================================
// MAPPING BUFFER - Shared Record Definitions
// =============================================================================
//
// The mapping buffer is an array of 16-byte fragments. A mapping record is a
// 32-byte header (two fragments) followed by zero or more continuation
// fragments holding the rest of the path.
//
// HEADER LAYOUT (32 bytes):
//   [0..8]   addr: u64
//   [8..16]  len: u64
//   [16..24] offset: u64          - file offset of the mapping
//   [24..28] path_len: u32        - stored path length (after truncation)
//   [28..32] path_prefix: [u8; 4] - first bytes of `path ‖ NUL`
//
// The path is stored with a trailing NUL. Whatever does not fit in the prefix
// is written in 16-byte chunks; the last chunk is zero padded.
// =============================================================================

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

pub const MAP_FRAGMENT_SIZE: usize = 16;
pub const PATH_PREFIX_LEN: usize = 4;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct MapHeader {
    pub addr: u64,
    pub len: u64,
    pub offset: u64,
    pub path_len: u32,
    pub path_prefix: [u8; PATH_PREFIX_LEN],
}

pub const MAP_HEADER_SIZE: usize = size_of::<MapHeader>();
pub const MAP_HEADER_FRAGMENTS: usize = MAP_HEADER_SIZE / MAP_FRAGMENT_SIZE;

const _: () = assert!(MAP_HEADER_SIZE == 32);
const _: () = assert!(MAP_HEADER_SIZE % MAP_FRAGMENT_SIZE == 0);

impl MapHeader {
    /// Header for `path`. The prefix receives the first bytes of the path and
    /// is zero filled past its end, which doubles as the terminator for short
    /// paths.
    pub fn new(addr: u64, len: u64, offset: u64, path: &[u8]) -> Self {
        let mut path_prefix = [0u8; PATH_PREFIX_LEN];
        let n = path.len().min(PATH_PREFIX_LEN);
        path_prefix[..n].copy_from_slice(&path[..n]);
        Self {
            addr,
            len,
            offset,
            path_len: path.len() as u32,
            path_prefix,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Continuation fragments needed after the header for a path of `path_len`
/// bytes plus its NUL.
pub const fn continuation_fragments(path_len: usize) -> usize {
    let stream = path_len + 1;
    if stream <= PATH_PREFIX_LEN {
        0
    } else {
        (stream - PATH_PREFIX_LEN).div_ceil(MAP_FRAGMENT_SIZE)
    }
}

/// Total bytes one mapping record occupies in the buffer.
pub const fn map_record_size(path_len: usize) -> usize {
    MAP_HEADER_SIZE + continuation_fragments(path_len) * MAP_FRAGMENT_SIZE
}

/// Longest path whose record fits in a buffer of `capacity_fragments`, or
/// `None` when not even a header fits.
pub const fn max_path_len(capacity_fragments: usize) -> Option<usize> {
    if capacity_fragments < MAP_HEADER_FRAGMENTS {
        return None;
    }
    let spare = capacity_fragments - MAP_HEADER_FRAGMENTS;
    // path_len + 1 - PREFIX <= spare * FRAGMENT
    Some(spare * MAP_FRAGMENT_SIZE + PATH_PREFIX_LEN - 1)
}

#[cfg(feature = "user")]
pub use decode::{MapRecord, decode_map_record, decode_map_records};

#[cfg(feature = "user")]
mod decode {
    extern crate alloc;

    use alloc::string::String;
    use alloc::vec::Vec;

    use super::*;
    use crate::DecodeError;

    /// A mapping record as the consumer sees it.
    #[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct MapRecord {
        pub addr: u64,
        pub len: u64,
        pub offset: u64,
        pub path: String,
    }

    /// Decode the record at the start of `bytes`, returning it together with
    /// the number of bytes it occupied.
    pub fn decode_map_record(bytes: &[u8]) -> Result<(MapRecord, usize), DecodeError> {
        if bytes.len() < MAP_HEADER_SIZE {
            return Err(DecodeError::TruncatedMapping {
                needed: MAP_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let header: MapHeader = bytemuck::pod_read_unaligned(&bytes[..MAP_HEADER_SIZE]);
        let path_len = header.path_len as usize;
        let size = map_record_size(path_len);
        if bytes.len() < size {
            return Err(DecodeError::TruncatedMapping {
                needed: size,
                available: bytes.len(),
            });
        }

        let mut path = Vec::with_capacity(path_len);
        let from_prefix = path_len.min(PATH_PREFIX_LEN);
        path.extend_from_slice(&header.path_prefix[..from_prefix]);
        path.extend_from_slice(&bytes[MAP_HEADER_SIZE..MAP_HEADER_SIZE + (path_len - from_prefix)]);

        Ok((
            MapRecord {
                addr: header.addr,
                len: header.len,
                offset: header.offset,
                path: String::from_utf8_lossy(&path).into_owned(),
            },
            size,
        ))
    }

    /// Decode every record in `bytes`, which must hold whole records only.
    pub fn decode_map_records(mut bytes: &[u8]) -> Result<Vec<MapRecord>, DecodeError> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let (record, used) = decode_map_record(bytes)?;
            out.push(record);
            bytes = &bytes[used..];
        }
        Ok(out)
    }
}
