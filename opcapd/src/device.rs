//! Single-reader byte-stream surface over the mapping buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;

use crate::error::{CaptureError, Result};
use crate::ring::MappingRingBuffer;

pub struct MapDevice {
    ring: Arc<MappingRingBuffer>,
    open: AtomicBool,
}

impl MapDevice {
    pub fn new(ring: Arc<MappingRingBuffer>) -> Self {
        Self {
            ring,
            open: AtomicBool::new(false),
        }
    }

    pub fn open(&self) -> Result<()> {
        self.open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CaptureError::Busy)?;
        info!("mapping buffer opened");
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CaptureError::NotOpen)?;
        info!("mapping buffer closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn capacity_bytes(&self) -> usize {
        self.ring.capacity_bytes()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CaptureError::NotOpen)
        }
    }

    /// Next `count` bytes from the read cursor.
    pub fn read(&self, count: usize) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.ring.read_next(count)
    }

    /// Fill `buf` from the read cursor. The copy into `buf` happens after the
    /// buffer lock is released.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<usize> {
        let bytes = self.read(buf.len())?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    pub fn skip(&self, count: usize) -> Result<()> {
        self.ensure_open()?;
        self.ring.skip(count);
        Ok(())
    }
}
