//! Mapping record writer.
//!
//! Paths are resolved into caller-owned scratch before the ring lock is taken.
//! Under the lock only fixed-size stack fragments are copied into the ring.

use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use log::debug;
use opcap_common::{
    MAP_FRAGMENT_SIZE, MAP_HEADER_FRAGMENTS, MapHeader, PATH_PREFIX_LEN, continuation_fragments,
    map_record_size, max_path_len,
};

use crate::error::{CaptureError, Result};
use crate::metrics::Metrics;
use crate::process::{MappedFile, ProcessImage};
use crate::ring::{MappingRingBuffer, RingWriter};

/// A record ready to be copied into the ring.
struct PendingMapping<'a> {
    addr: u64,
    len: u64,
    offset: u64,
    path: &'a [u8],
}

pub struct MappingRecordWriter {
    ring: Arc<MappingRingBuffer>,
    metrics: Arc<Metrics>,
    max_path: usize,
}

impl MappingRecordWriter {
    /// Fails when the ring cannot hold even a record header.
    pub fn new(ring: Arc<MappingRingBuffer>, metrics: Arc<Metrics>) -> Result<Self> {
        let max_path = max_path_len(ring.capacity_fragments()).ok_or_else(|| {
            CaptureError::InvalidArgument(format!(
                "mapping buffer needs at least {MAP_HEADER_FRAGMENTS} fragments"
            ))
        })?;
        Ok(Self {
            ring,
            metrics,
            max_path,
        })
    }

    pub fn ring(&self) -> &Arc<MappingRingBuffer> {
        &self.ring
    }

    /// Longest path stored without truncation.
    pub fn max_path_len(&self) -> usize {
        self.max_path
    }

    /// Write one mapping record and return the bytes it occupies.
    pub fn write_mapping(
        &self,
        addr: u64,
        len: u64,
        offset: u64,
        file: &MappedFile,
        scratch: &mut [u8],
    ) -> Result<usize> {
        self.write_mapping_committed(addr, len, offset, file, scratch, |_| true)
    }

    /// Like [`write_mapping`](Self::write_mapping), but `commit` runs with the
    /// byte count before the ring lock is released. `commit` must not block or
    /// allocate. When it returns false the record is taken back out of the
    /// ring and 0 is returned.
    pub fn write_mapping_committed<F>(
        &self,
        addr: u64,
        len: u64,
        offset: u64,
        file: &MappedFile,
        scratch: &mut [u8],
        commit: F,
    ) -> Result<usize>
    where
        F: FnOnce(usize) -> bool,
    {
        let path = file.resolve(scratch)?;
        let pending = [self.pending(addr, len, offset, path)];
        Ok(self.write_all(&pending, commit))
    }

    /// Write a record for every executable, file-backed region of `image`.
    /// Regions whose path cannot be resolved are skipped.
    pub fn write_mappings_for(&self, image: &ProcessImage, scratch: &mut [u8]) -> usize {
        self.write_mappings_for_committed(image, scratch, |_| true)
    }

    pub fn write_mappings_for_committed<'a, F>(
        &self,
        image: &'a ProcessImage,
        scratch: &'a mut [u8],
        commit: F,
    ) -> usize
    where
        F: FnOnce(usize) -> bool,
    {
        let page = scratch.len();
        let mut rest: &'a mut [u8] = scratch;
        let mut pending = Vec::new();

        for region in image.recordable() {
            let path: &'a [u8] = match region.file.as_ref() {
                Some(MappedFile::Path(p)) => {
                    let bytes = p.as_os_str().as_bytes();
                    &bytes[..bytes.len().min(page)]
                }
                Some(file @ MappedFile::Descriptor(_)) => {
                    let n = match file.resolve(rest) {
                        Ok(bytes) => bytes.len(),
                        Err(e) => {
                            debug!("pid {}: skipping region {:#x}: {}", image.pid, region.start, e);
                            continue;
                        }
                    };
                    let (used, tail) = std::mem::take(&mut rest).split_at_mut(n);
                    rest = tail;
                    used
                }
                None => continue,
            };
            pending.push(self.pending(region.start, region.len(), region.offset, path));
        }

        self.write_all(&pending, commit)
    }

    fn pending<'a>(&self, addr: u64, len: u64, offset: u64, path: &'a [u8]) -> PendingMapping<'a> {
        PendingMapping {
            addr,
            len,
            offset,
            path: &path[..path.len().min(self.max_path)],
        }
    }

    fn write_all<F>(&self, records: &[PendingMapping<'_>], commit: F) -> usize
    where
        F: FnOnce(usize) -> bool,
    {
        let (total, fragments) = {
            let mut w = self.ring.lock_writer();
            let total: usize = records.iter().map(|r| encode_into(&mut w, r)).sum();
            if commit(total) {
                (total, w.fragments_written())
            } else {
                // Nobody will read these bytes, so the next record must land
                // where this one started.
                w.rewind();
                (0, 0)
            }
        };
        if fragments > 0 {
            self.metrics.record_mappings(records.len(), fragments);
        }
        total
    }
}

/// Copy one record into the ring: two header fragments, then the path tail
/// and its NUL in zero-padded chunks.
fn encode_into(w: &mut RingWriter<'_>, record: &PendingMapping<'_>) -> usize {
    let header = MapHeader::new(record.addr, record.len, record.offset, record.path);
    for chunk in header.as_bytes().chunks_exact(MAP_FRAGMENT_SIZE) {
        let mut fragment = [0u8; MAP_FRAGMENT_SIZE];
        fragment.copy_from_slice(chunk);
        w.put(&fragment);
    }

    let tail = record.path.get(PATH_PREFIX_LEN..).unwrap_or(&[]);
    for i in 0..continuation_fragments(record.path.len()) {
        let from = (i * MAP_FRAGMENT_SIZE).min(tail.len());
        let to = ((i + 1) * MAP_FRAGMENT_SIZE).min(tail.len());
        let mut fragment = [0u8; MAP_FRAGMENT_SIZE];
        fragment[..to - from].copy_from_slice(&tail[from..to]);
        w.put(&fragment);
    }

    map_record_size(record.path.len())
}
