//! # Spin lock
//!
//! A raw, word-sized mutual exclusion primitive that spins instead of
//! sleeping.
//!
//! The lock carries no data and no owner information. It is the building
//! block for [`Mutex`], which adds RAII guards and protected data on top.
//!
//! ## Memory ordering
//!
//! A successful acquisition uses `Acquire` and the release store uses
//! `Release`, so every write made while holding the lock is visible to the
//! next thread that acquires it. Contended waiters spin on a `Relaxed` load
//! and only retry the compare-exchange once the lock looks free, which keeps
//! the cache line in shared state while waiting.
//!
//! [`Mutex`]: crate::Mutex

use core::{
    hint,
    sync::atomic::{AtomicU32, Ordering},
};

use static_assertions::const_assert_eq;

/// Raw value of an unlocked [`SpinLock`].
const UNLOCKED: u32 = 0;
/// Raw value of a locked [`SpinLock`].
const LOCKED: u32 = 1;

/// A non-sleeping mutual exclusion lock.
#[derive(Debug)]
#[repr(transparent)]
pub struct SpinLock(AtomicU32);

// The lock must stay a single machine word.
const_assert_eq!(size_of::<SpinLock>(), size_of::<u32>());

impl Default for SpinLock {
    /// Creates a new spin lock.
    ///
    /// The lock is initially unlocked.
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    /// Creates a new spin lock.
    ///
    /// The lock is initially unlocked.
    pub const fn new() -> Self {
        Self(AtomicU32::new(UNLOCKED))
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Locking a spin lock already held by the calling context never returns.
    #[inline]
    pub fn lock(&self) {
        while !self.try_lock() {
            while self.is_locked() {
                hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `true` if the lock was acquired.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    ///
    /// Must only be called by the context that currently holds the lock.
    #[inline]
    pub fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlocking a spin lock that is not held");
        self.0.store(UNLOCKED, Ordering::Release);
    }

    /// Whether the lock is currently held by anyone.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed) == LOCKED
    }
}
