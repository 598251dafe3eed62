//! # TLS entries
//!
//! An entry is one reference-counted value slot owned by a context. Each
//! entry is its own allocation, made through whichever allocator was in
//! force when it was first acquired, so the [`Slot`] handed to the caller
//! keeps a stable address for the entry's whole lifetime.

use core::{ffi::c_void, ptr::NonNull};

use ctx_tls_alloc::Allocator;

/// The opaque, pointer-sized payload stored in an entry.
///
/// Payloads belong to the caller; the manager only transports them.
pub type Value = *mut c_void;

/// The payload of a freshly created entry.
pub const EMPTY: Value = core::ptr::null_mut();

/// Which allocator an entry was allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// The owning context's allocator.
    Context,
    /// A caller-supplied allocator, identified by address.
    Custom(usize),
}

impl Origin {
    pub(crate) fn of(custom: Option<&dyn Allocator>) -> Self {
        match custom {
            None => Self::Context,
            Some(alloc) => Self::Custom((alloc as *const dyn Allocator).cast::<()>() as usize),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Entry {
    value: Value,
    ref_count: u32,
    origin: Origin,
}

impl Entry {
    pub(crate) fn new(origin: Origin) -> Self {
        Self {
            value: EMPTY,
            ref_count: 1,
            origin,
        }
    }

    pub(crate) fn value(&self) -> Value {
        self.value
    }

    pub(crate) fn set_value(&mut self, value: Value) {
        self.value = value;
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub(crate) fn origin(&self) -> Origin {
        self.origin
    }

    /// Adds a reference and returns the new count, or `None`, leaving the
    /// count alone, if it is already at its maximum.
    pub(crate) fn retain(&mut self) -> Option<u32> {
        self.ref_count = self.ref_count.checked_add(1)?;
        Some(self.ref_count)
    }

    /// Drops a reference and returns the new count, stopping at zero.
    pub(crate) fn unretain(&mut self) -> u32 {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    #[cfg(test)]
    pub(crate) fn set_ref_count(&mut self, count: u32) {
        self.ref_count = count;
    }

    /// A stable handle on this entry's payload.
    pub(crate) fn slot(&mut self) -> Slot {
        Slot(NonNull::from(&mut self.value))
    }
}

/// Reference to an entry's payload, returned by `acquire`.
///
/// The slot stays valid while the entry is acquired in the context that
/// obtained it. Reading or writing it afterwards is undefined behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(NonNull<Value>);

impl Slot {
    /// Raw pointer to the payload.
    pub fn as_ptr(self) -> *mut Value {
        self.0.as_ptr()
    }

    /// Reads the payload.
    ///
    /// # Safety
    ///
    /// The entry must still be acquired by the calling context.
    pub unsafe fn read(self) -> Value {
        unsafe { self.0.read() }
    }

    /// Overwrites the payload.
    ///
    /// # Safety
    ///
    /// The entry must still be acquired by the calling context.
    pub unsafe fn write(self, value: Value) {
        unsafe { self.0.write(value) }
    }
}
