//! # ctx-tls-sync
//!
//! Non-sleeping synchronization primitives for the context TLS manager.
//!
//! Everything in this crate busy-waits. None of the primitives ever parks the
//! calling thread, so they may be taken from contexts where sleeping is not
//! allowed, provided the critical sections they guard stay short and bounded.

#![no_std]

#[cfg(test)]
extern crate std;

mod mutex;
mod spin;

#[doc(inline)]
pub use self::{
    mutex::{Mutex, MutexGuard, TryLockError},
    spin::SpinLock,
};
