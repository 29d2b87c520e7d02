//! # Kernel synchronization primitives
//!
//! Two lock flavors over one guard type:
//!
//! - [`SpinLock`] (test-and-test-and-set) for short critical sections such
//!   as free-list pushes and page-table entry installs.
//! - [`TicketLock`] (FIFO) for locks that may be held across a synchronous
//!   device operation, where waiters must be served in arrival order so no
//!   thread starves behind a stream of cache misses.
//!
//! Both are [`Mutex<T, R>`] over a raw lock implementing [`RawLock`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw;

pub use mutex::{Mutex, MutexGuard};
pub use raw::{RawSpin, RawTicket};

/// Test-and-test-and-set spin lock.
pub type SpinLock<T> = Mutex<T, RawSpin>;

/// Guard returned by [`SpinLock::lock`].
pub type SpinLockGuard<'a, T> = MutexGuard<'a, T, RawSpin>;

/// FIFO ticket lock.
pub type TicketLock<T> = Mutex<T, RawTicket>;

/// Guard returned by [`TicketLock::lock`].
pub type TicketLockGuard<'a, T> = MutexGuard<'a, T, RawTicket>;

/// A raw, data-less lock.
///
/// # Safety
/// Implementations must provide mutual exclusion: after `lock` or a
/// successful `try_lock` returns, no other caller may acquire the lock until
/// `unlock` is called.
pub unsafe trait RawLock {
    /// Creates the lock in the unlocked state.
    const INIT: Self;

    fn lock(&self);

    fn try_lock(&self) -> bool;

    /// Whether some thread currently holds the lock. Racy; only meaningful
    /// for assertions made by the holder itself.
    fn is_locked(&self) -> bool;

    /// # Safety
    /// Must only be called by the current holder.
    unsafe fn unlock(&self);
}
