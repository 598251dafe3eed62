//! # Lock-free slot table
//!
//! A fixed array of `(key, context)` slots for hosts where an interrupt
//! handler may not take any lock, not even a spinning one.
//!
//! ## Design
//!
//! - A key of `0` marks a free slot. Claiming a slot is a single
//!   compare-and-swap of that sentinel for the new key, probing linearly from
//!   slot 0 and wrapping around.
//! - The context pointer is published after the key, so readers skip slots
//!   whose key is set but whose pointer is still null.
//! - Removal clears the pointer first and then hands the key back to the
//!   sentinel.
//! - Lookups are linear scans. The table is sized for the deepest interrupt
//!   nesting the host can produce, which is small.
//!
//! The table never grows. [`SlotTable::try_insert`] reports a full table
//! after one lap; the registry-level [`insert`](ContextRegistry::insert)
//! keeps probing until another handler frees a slot, so an undersized table
//! is a configuration error that shows up as a spin.

use alloc::{boxed::Box, vec::Vec};
use core::{
    hint,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering},
};

use super::{ContextRegistry, StackGrowth};
use crate::{
    context::ContextKey,
    error::{Result, TlsError},
};

/// Key of a free slot.
const FREE: u64 = 0;

struct IsrSlot<T> {
    key: AtomicU64,
    ctx: AtomicPtr<T>,
}

impl<T> IsrSlot<T> {
    const fn new() -> Self {
        Self {
            key: AtomicU64::new(FREE),
            ctx: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The published context of an occupied slot.
    fn load(&self) -> Option<(u64, NonNull<T>)> {
        let key = self.key.load(Ordering::Acquire);
        if key == FREE {
            return None;
        }
        NonNull::new(self.ctx.load(Ordering::Acquire)).map(|ctx| (key, ctx))
    }

    /// Empties the slot, returning its context if one was published.
    fn clear(&self) -> Option<NonNull<T>> {
        let ctx = self.ctx.swap(ptr::null_mut(), Ordering::AcqRel);
        // Release: the pointer is gone before the slot can be claimed again.
        self.key.store(FREE, Ordering::Release);
        NonNull::new(ctx)
    }
}

/// Fixed-capacity lock-free context registry.
pub struct SlotTable<T> {
    slots: Box<[IsrSlot<T>]>,
    exhaustion_reported: AtomicBool,
}

// SAFETY: all shared state is atomic; the stored pointers are never
// dereferenced by the table.
unsafe impl<T: Send> Send for SlotTable<T> {}
unsafe impl<T: Send> Sync for SlotTable<T> {}

impl<T> SlotTable<T> {
    /// Allocates a table with `capacity` free slots.
    ///
    /// # Errors
    ///
    /// - [`TlsError::InvalidConfig`] if `capacity` is zero.
    /// - [`TlsError::OutOfMemory`] if the slots cannot be allocated.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TlsError::InvalidConfig("slot table needs at least one slot"));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| TlsError::OutOfMemory)?;
        slots.extend((0..capacity).map(|_| IsrSlot::new()));

        Ok(Self {
            slots: slots.into_boxed_slice(),
            exhaustion_reported: AtomicBool::new(false),
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claims a free slot for `key` with a single lap over the table.
    ///
    /// # Errors
    ///
    /// - [`TlsError::ContextExists`] if `key` is already registered, or is
    ///   the free-slot sentinel `0`.
    /// - [`TlsError::CapacityExhausted`] if every slot is taken.
    pub fn try_insert(&self, key: ContextKey, ctx: NonNull<T>) -> Result<()> {
        let raw = key.to_raw();
        if raw == FREE || self.get(key).is_some() {
            return Err(TlsError::ContextExists(raw));
        }

        for slot in self.slots.iter() {
            if slot
                .key
                .compare_exchange(FREE, raw, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Release: publishes the context to readers that see the key.
                slot.ctx.store(ctx.as_ptr(), Ordering::Release);
                return Ok(());
            }
        }

        Err(TlsError::CapacityExhausted {
            capacity: self.capacity(),
        })
    }
}

impl<T> ContextRegistry<T> for SlotTable<T> {
    fn get(&self, key: ContextKey) -> Option<NonNull<T>> {
        self.slots
            .iter()
            .filter_map(IsrSlot::load)
            .find(|(raw, _)| *raw == key.to_raw())
            .map(|(_, ctx)| ctx)
    }

    fn insert(&self, key: ContextKey, ctx: NonNull<T>) -> Result<()> {
        loop {
            match self.try_insert(key, ctx) {
                Err(err @ TlsError::CapacityExhausted { .. }) => {
                    if !self.exhaustion_reported.swap(true, Ordering::Relaxed) {
                        err.report();
                    }
                    hint::spin_loop();
                }
                other => return other,
            }
        }
    }

    fn remove(&self, key: ContextKey) -> Option<NonNull<T>> {
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.key.load(Ordering::Acquire) == key.to_raw())?;
        slot.clear()
    }

    fn find_nearest(&self, probe: u64, growth: StackGrowth) -> Option<(ContextKey, NonNull<T>)> {
        let mut best: Option<(u64, NonNull<T>)> = None;

        for (raw, ctx) in self.slots.iter().filter_map(IsrSlot::load) {
            if !growth.admits(raw, probe) {
                continue;
            }
            if best.is_none_or(|(best_raw, _)| growth.prefers(raw, best_raw)) {
                best = Some((raw, ctx));
            }
        }

        best.map(|(raw, ctx)| (ContextKey::from_raw(raw), ctx))
    }

    fn drain(&self, f: &mut dyn FnMut(ContextKey, NonNull<T>)) {
        for slot in self.slots.iter() {
            let raw = slot.key.load(Ordering::Acquire);
            if raw == FREE {
                continue;
            }
            if let Some(ctx) = slot.clear() {
                f(ContextKey::from_raw(raw), ctx);
            }
        }
    }

    fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.key.load(Ordering::Acquire) != FREE)
            .count()
    }
}
