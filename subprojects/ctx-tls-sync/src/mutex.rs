//! # Mutex
//!
//! A data-carrying mutex over [`SpinLock`].

use core::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use crate::spin::SpinLock;

/// A mutual exclusion primitive useful for protecting shared data
///
/// The data can only be accessed through the RAII guards returned from
/// [`lock`] and [`try_lock`], which guarantees that the data is only ever
/// accessed when the mutex is locked. Waiting never sleeps: contended callers
/// spin until the holder drops its guard.
///
/// [`lock`]: Mutex::lock
/// [`try_lock`]: Mutex::try_lock
pub struct Mutex<T: ?Sized> {
    inner: SpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    #[inline]
    pub const fn new(data: T) -> Mutex<T> {
        Mutex {
            inner: SpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, spinning until it is able to do so.
    ///
    /// Locking a mutex from the context that already holds it never returns.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock();
        // SAFETY: the lock is held and released by the guard's `Drop`.
        unsafe { MutexGuard::new(self) }
    }

    /// Attempts to acquire this lock without spinning.
    ///
    /// # Errors
    ///
    /// Returns [`TryLockError::WouldBlock`] if the mutex is already locked.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, TryLockError> {
        if self.inner.try_lock() {
            // SAFETY: the lock is held and released by the guard's `Drop`.
            Ok(unsafe { MutexGuard::new(self) })
        } else {
            Err(TryLockError::WouldBlock)
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking needs to
    /// take place -- the mutable borrow statically guarantees no locks exist.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Ok(guard) => {
                d.field("data", &&*guard);
            }
            Err(TryLockError::WouldBlock) => {
                d.field("data", &format_args!("<locked>"));
            }
        }
        d.finish_non_exhaustive()
    }
}

/// An RAII scoped lock of a [`Mutex`]. Unlocks when dropped.
#[must_use = "if unused the Mutex will immediately unlock"]
#[clippy::has_significant_drop]
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
    _marker: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<'mutex, T: ?Sized> MutexGuard<'mutex, T> {
    /// # Safety
    ///
    /// The caller must hold `lock.inner`.
    unsafe fn new(lock: &'mutex Mutex<T>) -> MutexGuard<'mutex, T> {
        MutexGuard {
            lock,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.inner.unlock();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Error returned by [`Mutex::try_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockError {
    /// The lock could not be acquired because it is already held.
    WouldBlock,
}

impl fmt::Display for TryLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => f.write_str("try_lock failed because the operation would block"),
        }
    }
}

impl core::error::Error for TryLockError {}

#[cfg(test)]
mod tests {
    use std::{format, sync::Arc, thread, vec::Vec};

    use super::{Mutex, TryLockError};

    #[test]
    fn test_guard_unlocks_on_drop() {
        let mutex = Mutex::new(5u32);
        {
            let mut guard = mutex.lock();
            *guard += 1;
            assert_eq!(mutex.try_lock().err(), Some(TryLockError::WouldBlock));
        }
        assert_eq!(*mutex.try_lock().unwrap(), 6);
    }

    #[test]
    fn test_debug_reports_locked_state() {
        let mutex = Mutex::new(1u8);
        assert!(format!("{mutex:?}").contains("data: 1"));

        let _guard = mutex.lock();
        assert!(format!("{mutex:?}").contains("<locked>"));
    }

    #[test]
    fn test_shared_counter_across_threads() {
        let mutex = Arc::new(Mutex::new(0usize));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mutex = Arc::into_inner(mutex).unwrap();
        assert_eq!(mutex.into_inner(), 8_000);
    }
}
