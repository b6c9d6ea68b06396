//! Mapping ring buffer.
//!
//! A fixed array of 16-byte fragments with a write cursor (in fragments) and a
//! read cursor (in bytes), both behind one mutex. Writers never wait for the
//! reader: once the write cursor laps unread data that data is gone, and the
//! loss is only counted.
//!
//! The lock is held for bounded copies only. Reads reserve their output
//! buffer before locking; writers reach the storage through [`RingWriter`],
//! which marks the thread as inside the critical section for as long as the
//! guard lives.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::info;
use opcap_common::MAP_FRAGMENT_SIZE;

use crate::critical::CriticalSection;
use crate::error::{CaptureError, Result};
use crate::metrics::Metrics;

struct RingState {
    storage: Box<[u8]>,
    /// Next fragment to write.
    write: usize,
    /// Next byte `read_next` returns.
    read: usize,
    /// Bytes written since the read cursor last caught up, capped at capacity.
    unread: usize,
}

pub struct MappingRingBuffer {
    capacity: usize,
    state: Mutex<RingState>,
    metrics: Arc<Metrics>,
}

impl MappingRingBuffer {
    pub fn new(capacity_fragments: usize, metrics: Arc<Metrics>) -> Result<Self> {
        if capacity_fragments == 0 {
            return Err(CaptureError::InvalidArgument(
                "mapping buffer capacity must be nonzero".to_string(),
            ));
        }
        let bytes = capacity_fragments
            .checked_mul(MAP_FRAGMENT_SIZE)
            .ok_or_else(|| CaptureError::InvalidArgument("mapping buffer too large".to_string()))?;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(bytes)
            .map_err(|_| CaptureError::ResourceExhausted("mapping buffer storage"))?;
        storage.resize(bytes, 0);

        info!(
            "mapping buffer: {} fragments, {} KB",
            capacity_fragments,
            bytes / 1024
        );

        Ok(Self {
            capacity: capacity_fragments,
            state: Mutex::new(RingState {
                storage: storage.into_boxed_slice(),
                write: 0,
                read: 0,
                unread: 0,
            }),
            metrics,
        })
    }

    pub fn capacity_fragments(&self) -> usize {
        self.capacity
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity * MAP_FRAGMENT_SIZE
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Byte offset the next fragment will be written at.
    pub fn write_cursor(&self) -> usize {
        self.lock().write * MAP_FRAGMENT_SIZE
    }

    pub fn read_cursor(&self) -> usize {
        self.lock().read
    }

    pub fn unread_bytes(&self) -> usize {
        self.lock().unread
    }

    /// Take the lock for writing. Everything done through the returned guard
    /// must be bounded and allocation free.
    pub fn lock_writer(&self) -> RingWriter<'_> {
        let cs = CriticalSection::enter();
        let state = self.lock();
        RingWriter {
            start_write: state.write,
            start_unread: state.unread,
            state,
            capacity: self.capacity,
            fragments: 0,
            metrics: &self.metrics,
            _cs: cs,
        }
    }

    /// Copy `count` bytes starting at `offset`, wrapping past the end. Does
    /// not move the read cursor.
    pub fn read(&self, offset: usize, count: usize) -> Result<Vec<u8>> {
        self.copy_out(Some(offset), count)
    }

    /// Copy `count` bytes from the read cursor and advance it.
    pub fn read_next(&self, count: usize) -> Result<Vec<u8>> {
        self.copy_out(None, count)
    }

    /// Advance the read cursor past `count` bytes without copying them. Used
    /// when a record was larger than the buffer and its bytes are gone.
    pub fn skip(&self, count: usize) {
        let cap = self.capacity_bytes();
        let _cs = CriticalSection::enter();
        let mut state = self.lock();
        state.read = (state.read + count % cap) % cap;
        state.unread = state.unread.saturating_sub(count);
    }

    fn copy_out(&self, offset: Option<usize>, count: usize) -> Result<Vec<u8>> {
        let cap = self.capacity_bytes();
        if count == 0 {
            return Ok(Vec::new());
        }
        if let Some(offset) = offset
            && offset >= cap
        {
            return Err(CaptureError::OutOfRange {
                offset,
                capacity: cap,
            });
        }
        if count > cap {
            return Err(CaptureError::InvalidArgument(format!(
                "read of {count} bytes exceeds the {cap}-byte mapping buffer"
            )));
        }

        let mut out = Vec::new();
        out.try_reserve_exact(count)
            .map_err(|_| CaptureError::ResourceExhausted("read buffer"))?;

        {
            let _cs = CriticalSection::enter();
            let mut state = self.lock();
            let start = offset.unwrap_or(state.read);
            let first = count.min(cap - start);
            out.extend_from_slice(&state.storage[start..start + first]);
            out.extend_from_slice(&state.storage[..count - first]);

            if offset.is_none() {
                state.read = (start + count) % cap;
                state.unread = state.unread.saturating_sub(count);
            }
        }

        self.metrics.add_bytes_read(count);
        Ok(out)
    }
}

/// Exclusive write access to the ring. Dropping it releases the lock.
pub struct RingWriter<'a> {
    state: MutexGuard<'a, RingState>,
    start_write: usize,
    start_unread: usize,
    capacity: usize,
    fragments: usize,
    metrics: &'a Metrics,
    _cs: CriticalSection,
}

impl RingWriter<'_> {
    /// Byte offset the next fragment goes to.
    pub fn cursor(&self) -> usize {
        self.state.write * MAP_FRAGMENT_SIZE
    }

    /// Fragments written through this guard.
    pub fn fragments_written(&self) -> usize {
        self.fragments
    }

    pub fn capacity_fragments(&self) -> usize {
        self.capacity
    }

    pub fn put(&mut self, fragment: &[u8; MAP_FRAGMENT_SIZE]) {
        let at = self.state.write * MAP_FRAGMENT_SIZE;
        self.state.storage[at..at + MAP_FRAGMENT_SIZE].copy_from_slice(fragment);
        self.advance_write(1);
    }

    /// Undo every `put` made through this guard. Fragments of unread data
    /// that were overwritten stay lost.
    pub fn rewind(&mut self) {
        self.state.write = self.start_write;
        self.state.unread = self.start_unread;
        self.fragments = 0;
    }

    fn advance_write(&mut self, n: usize) {
        let cap_bytes = self.capacity * MAP_FRAGMENT_SIZE;
        self.state.write = (self.state.write + n) % self.capacity;
        self.fragments += n;

        let unread = self.state.unread + n * MAP_FRAGMENT_SIZE;
        if unread > cap_bytes {
            let lost = (unread - cap_bytes).div_ceil(MAP_FRAGMENT_SIZE);
            self.metrics.add_fragments_lost(lost);
            self.state.unread = cap_bytes;
        } else {
            self.state.unread = unread;
        }
    }
}
