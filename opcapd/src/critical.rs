//! Per-thread marker for the mapping buffer's critical section.
//!
//! The ring lock is taken on the hot path of every watched operation, so
//! nothing that can allocate or suspend may run while it is held. The ring
//! enters a [`CriticalSection`] whenever it takes its lock, and code that may
//! block calls [`assert_may_block`] first. In debug builds a violation panics,
//! which turns the rule into something tests can observe.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Guard marking the current thread as inside the critical section.
/// Not `Send`: the marker is per thread.
pub struct CriticalSection {
    _not_send: PhantomData<*const ()>,
}

impl CriticalSection {
    pub fn enter() -> Self {
        DEPTH.with(|d| d.set(d.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

pub fn in_critical_section() -> bool {
    DEPTH.with(|d| d.get() > 0)
}

/// Declare that `what` may allocate or block.
#[track_caller]
pub fn assert_may_block(what: &str) {
    debug_assert!(
        !in_critical_section(),
        "{what} while holding the mapping buffer lock"
    );
}
