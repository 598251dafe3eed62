//! Registry for deployments with exactly one context of a kind.

use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU64, Ordering},
};

use super::{ContextRegistry, StackGrowth};
use crate::{
    context::ContextKey,
    error::{Result, TlsError},
};

/// Key of the empty registry.
const VACANT: u64 = 0;

/// Holds at most one context, which every lookup resolves to.
///
/// Used where the host runs a single thread, or never nests handlers, so
/// there is nothing to tell apart and no lookup needs to compare keys.
pub struct SingleRegistry<T> {
    key: AtomicU64,
    ctx: AtomicPtr<T>,
}

// SAFETY: all shared state is atomic; the stored pointer is never
// dereferenced by the registry.
unsafe impl<T: Send> Send for SingleRegistry<T> {}
unsafe impl<T: Send> Sync for SingleRegistry<T> {}

impl<T> SingleRegistry<T> {
    pub const fn new() -> Self {
        Self {
            key: AtomicU64::new(VACANT),
            ctx: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn occupant(&self) -> Option<(ContextKey, NonNull<T>)> {
        let ctx = NonNull::new(self.ctx.load(Ordering::Acquire))?;
        Some((ContextKey::from_raw(self.key.load(Ordering::Acquire)), ctx))
    }

    fn take(&self) -> Option<(ContextKey, NonNull<T>)> {
        let ctx = NonNull::new(self.ctx.swap(ptr::null_mut(), Ordering::AcqRel))?;
        let key = self.key.swap(VACANT, Ordering::AcqRel);
        Some((ContextKey::from_raw(key), ctx))
    }
}

impl<T> Default for SingleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ContextRegistry<T> for SingleRegistry<T> {
    fn get(&self, _key: ContextKey) -> Option<NonNull<T>> {
        self.occupant().map(|(_, ctx)| ctx)
    }

    fn insert(&self, key: ContextKey, ctx: NonNull<T>) -> Result<()> {
        if let Some((occupant, _)) = self.occupant() {
            return Err(if occupant == key {
                TlsError::ContextExists(key.to_raw())
            } else {
                TlsError::CapacityExhausted { capacity: 1 }
            });
        }

        self.key.store(key.to_raw(), Ordering::Release);
        self.ctx
            .compare_exchange(ptr::null_mut(), ctx.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| TlsError::CapacityExhausted { capacity: 1 })
    }

    fn remove(&self, _key: ContextKey) -> Option<NonNull<T>> {
        self.take().map(|(_, ctx)| ctx)
    }

    fn find_nearest(&self, _probe: u64, _growth: StackGrowth) -> Option<(ContextKey, NonNull<T>)> {
        self.occupant()
    }

    fn drain(&self, f: &mut dyn FnMut(ContextKey, NonNull<T>)) {
        if let Some((key, ctx)) = self.take() {
            f(key, ctx);
        }
    }

    fn len(&self) -> usize {
        usize::from(self.occupant().is_some())
    }
}
