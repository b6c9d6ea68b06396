//! Page-sized scratch buffers handed out before the ring lock is taken.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use crate::critical::assert_may_block;
use crate::error::{CaptureError, Result};

/// Hands out scratch pages, bounded by `max_pages` outstanding at once.
#[derive(Clone)]
pub struct ScratchPool {
    page_size: usize,
    max_pages: usize,
    outstanding: Arc<AtomicUsize>,
}

impl ScratchPool {
    pub fn new(page_size: usize, max_pages: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(CaptureError::InvalidArgument(
                "scratch page size must be nonzero".to_string(),
            ));
        }
        Ok(Self {
            page_size,
            max_pages,
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Take a zeroed page. Fails with `ResourceExhausted` when the pool is
    /// at its limit or the allocation fails.
    pub fn acquire(&self) -> Result<ScratchPage> {
        assert_may_block("scratch allocation");

        let reserved = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_pages).then_some(n + 1)
            });
        if reserved.is_err() {
            debug!("scratch pool exhausted ({} pages out)", self.max_pages);
            return Err(CaptureError::ResourceExhausted("scratch pool"));
        }

        let mut buf = Vec::new();
        if buf.try_reserve_exact(self.page_size).is_err() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(CaptureError::ResourceExhausted("scratch page allocation"));
        }
        buf.resize(self.page_size, 0);

        Ok(ScratchPage {
            buf,
            outstanding: Arc::clone(&self.outstanding),
        })
    }
}

/// A scratch page; returns its slot to the pool on drop.
pub struct ScratchPage {
    buf: Vec<u8>,
    outstanding: Arc<AtomicUsize>,
}

impl Deref for ScratchPage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for ScratchPage {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for ScratchPage {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Current platform page size.
pub fn system_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::critical::CriticalSection;

    #[test]
    fn pages_are_bounded_and_returned() {
        let pool = ScratchPool::new(64, 2).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a.len(), 64);
        assert!(b.iter().all(|&x| x == 0));
        assert!(matches!(
            pool.acquire(),
            Err(CaptureError::ResourceExhausted(_))
        ));
        drop(a);
        assert_eq!(pool.outstanding(), 1);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn zero_limit_always_exhausted() {
        let pool = ScratchPool::new(4096, 0).unwrap();
        assert!(pool.acquire().is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn zero_page_size_rejected() {
        assert!(matches!(
            ScratchPool::new(0, 1),
            Err(CaptureError::InvalidArgument(_))
        ));
    }

    #[test]
    #[should_panic(expected = "scratch allocation")]
    fn acquire_under_lock_panics() {
        let pool = ScratchPool::new(64, 1).unwrap();
        let _cs = CriticalSection::enter();
        let _ = pool.acquire();
    }

    #[test]
    fn page_size_is_sane() {
        let size = system_page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }
}
