//! # Context registries
//!
//! A registry maps a [`ContextKey`] to the context it identifies. The
//! database keeps two of them, one for passive threads and one for interrupt
//! handlers, and each can be backed by one of three implementations:
//!
//! | Kind | Type | Use |
//! |---|---|---|
//! | [`RegistryKind::Locked`] | `LockedRegistry` | intrusive ordered tree behind a spin lock |
//! | [`RegistryKind::LockFree`] | [`SlotTable`] | fixed array of atomic slots, for hosts where no lock may be taken in a handler |
//! | [`RegistryKind::Single`] | [`SingleRegistry`] | exactly one context, for single-threaded deployments |
//!
//! ## Fuzzy lookup
//!
//! An interrupt handler only knows *some* address on its own stack, not the
//! key it registered with. The registration always runs at a shallower stack
//! depth than any lookup in the same handler invocation, so the owning
//! context is the registered key nearest to the probe in the direction the
//! stack grows *from*. [`StackGrowth`] names that direction and every backend
//! implements [`ContextRegistry::find_nearest`] over it.
//!
//! Registries store pointers only; the contexts themselves are owned by the
//! database, which creates them before `insert` and frees them after
//! `remove`. No backend allocates once built: the slot table and the single
//! slot are sized up front, and the locked tree links contexts through a
//! link embedded in each of them.

use core::ptr::NonNull;

use crate::{
    context::{ContextKey, ContextMap},
    error::Result,
};

mod locked;
mod lockfree;
mod single;

pub(crate) use self::locked::LockedRegistry;
pub use self::{lockfree::SlotTable, single::SingleRegistry};

/// Direction in which the host's stacks grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackGrowth {
    /// From high to low addresses. Deeper frames have smaller addresses.
    #[default]
    Downward,
    /// From low to high addresses. Deeper frames have larger addresses.
    Upward,
}

impl StackGrowth {
    /// Whether a context registered at `registered` can own a frame at
    /// `probe`, i.e. the registration is not deeper than the probe.
    pub fn admits(self, registered: u64, probe: u64) -> bool {
        match self {
            Self::Downward => registered >= probe,
            Self::Upward => registered <= probe,
        }
    }

    /// Whether `candidate` is nearer to any admitted probe than `best`.
    pub fn prefers(self, candidate: u64, best: u64) -> bool {
        match self {
            Self::Downward => candidate < best,
            Self::Upward => candidate > best,
        }
    }
}

/// Backend selection for a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    /// An ordered tree behind a spin lock.
    Locked,
    /// [`SlotTable`] with `capacity` slots.
    LockFree {
        /// Number of slots. Must exceed the deepest interrupt nesting the
        /// host can produce.
        capacity: usize,
    },
    /// [`SingleRegistry`].
    Single,
}

/// Common interface of all registry backends.
pub trait ContextRegistry<T> {
    /// The context registered under exactly `key`.
    fn get(&self, key: ContextKey) -> Option<NonNull<T>>;

    /// Registers `ctx` under `key`.
    ///
    /// # Errors
    ///
    /// - [`TlsError::ContextExists`] if `key` is already registered.
    /// - [`TlsError::CapacityExhausted`] if a bounded backend is full.
    ///
    /// [`TlsError::ContextExists`]: crate::TlsError::ContextExists
    /// [`TlsError::CapacityExhausted`]: crate::TlsError::CapacityExhausted
    fn insert(&self, key: ContextKey, ctx: NonNull<T>) -> Result<()>;

    /// Unregisters `key`, returning the context that was registered.
    fn remove(&self, key: ContextKey) -> Option<NonNull<T>>;

    /// The context whose key is nearest to `probe` in the direction opposite
    /// to `growth`, including an exact match.
    fn find_nearest(&self, probe: u64, growth: StackGrowth) -> Option<(ContextKey, NonNull<T>)>;

    /// Unregisters every context, handing each to `f`.
    fn drain(&self, f: &mut dyn FnMut(ContextKey, NonNull<T>));

    /// Number of registered contexts.
    fn len(&self) -> usize;

    /// Whether no context is registered.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A context registry whose backend is chosen at construction time.
pub(crate) enum Registry {
    Locked(LockedRegistry),
    LockFree(SlotTable<ContextMap>),
    Single(SingleRegistry<ContextMap>),
}

impl Registry {
    /// Builds the backend `kind` names.
    ///
    /// # Errors
    ///
    /// Fails if a slot table cannot be allocated or has no slots.
    pub(crate) fn new(kind: RegistryKind) -> Result<Self> {
        Ok(match kind {
            RegistryKind::Locked => Self::Locked(LockedRegistry::new()),
            RegistryKind::LockFree { capacity } => Self::LockFree(SlotTable::with_capacity(capacity)?),
            RegistryKind::Single => Self::Single(SingleRegistry::new()),
        })
    }

    /// The backend kind.
    pub(crate) fn kind(&self) -> RegistryKind {
        match self {
            Self::Locked(_) => RegistryKind::Locked,
            Self::LockFree(table) => RegistryKind::LockFree {
                capacity: table.capacity(),
            },
            Self::Single(_) => RegistryKind::Single,
        }
    }

    fn backend(&self) -> &dyn ContextRegistry<ContextMap> {
        match self {
            Self::Locked(registry) => registry,
            Self::LockFree(registry) => registry,
            Self::Single(registry) => registry,
        }
    }
}

impl ContextRegistry<ContextMap> for Registry {
    fn get(&self, key: ContextKey) -> Option<NonNull<ContextMap>> {
        self.backend().get(key)
    }

    fn insert(&self, key: ContextKey, ctx: NonNull<ContextMap>) -> Result<()> {
        self.backend().insert(key, ctx)
    }

    fn remove(&self, key: ContextKey) -> Option<NonNull<ContextMap>> {
        self.backend().remove(key)
    }

    fn find_nearest(&self, probe: u64, growth: StackGrowth) -> Option<(ContextKey, NonNull<ContextMap>)> {
        self.backend().find_nearest(probe, growth)
    }

    fn drain(&self, f: &mut dyn FnMut(ContextKey, NonNull<ContextMap>)) {
        self.backend().drain(f)
    }

    fn len(&self) -> usize {
        self.backend().len()
    }
}

impl core::fmt::Debug for Registry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;
    use std::vec::Vec;

    use super::{ContextRegistry, Registry, RegistryKind, StackGrowth};
    use crate::{
        context::{ContextKey, ContextMap},
        error::TlsError,
    };

    /// Distinct fake context pointers; never dereferenced.
    pub(super) fn ctx(n: usize) -> NonNull<u8> {
        NonNull::new(core::ptr::without_provenance_mut(n * 16)).unwrap()
    }

    pub(super) fn key(raw: u64) -> ContextKey {
        ContextKey::from_raw(raw)
    }

    /// Unlinked passive contexts with the given keys.
    pub(super) fn contexts(raws: &[u64]) -> Vec<ContextMap> {
        raws.iter().map(|&raw| ContextMap::passive(key(raw))).collect()
    }

    /// Registers 0x1000, 0x2000 and 0x3000 and checks nearest lookups in
    /// both growth directions.
    pub(super) fn check_fuzzy_lookup(registry: &dyn ContextRegistry<ContextMap>) {
        let ctxs = contexts(&[0x1000, 0x2000, 0x3000]);
        for ctx in &ctxs {
            registry.insert(ctx.key(), NonNull::from(ctx)).unwrap();
        }

        let nearest = |probe, growth| registry.find_nearest(probe, growth).map(|(k, _)| k.to_raw());

        // Stack grows down: the owner sits at or above the probe.
        assert_eq!(nearest(0x1800, StackGrowth::Downward), Some(0x2000));
        assert_eq!(nearest(0x2000, StackGrowth::Downward), Some(0x2000));
        assert_eq!(nearest(0x0800, StackGrowth::Downward), Some(0x1000));
        assert_eq!(nearest(0x3001, StackGrowth::Downward), None);

        // Stack grows up: the owner sits at or below the probe.
        assert_eq!(nearest(0x1800, StackGrowth::Upward), Some(0x1000));
        assert_eq!(nearest(0x3000, StackGrowth::Upward), Some(0x3000));
        assert_eq!(nearest(0x9000, StackGrowth::Upward), Some(0x3000));
        assert_eq!(nearest(0x0fff, StackGrowth::Upward), None);

        let found = registry.find_nearest(0x2fff, StackGrowth::Downward);
        assert_eq!(found, Some((key(0x3000), NonNull::from(&ctxs[2]))));

        // Unlink before the contexts go away.
        registry.drain(&mut |_, _| {});
        assert!(registry.is_empty());
    }

    #[test]
    fn test_growth_direction_helpers() {
        assert!(StackGrowth::Downward.admits(0x20, 0x10));
        assert!(!StackGrowth::Downward.admits(0x10, 0x20));
        assert!(StackGrowth::Downward.prefers(0x20, 0x30));

        assert!(StackGrowth::Upward.admits(0x10, 0x20));
        assert!(!StackGrowth::Upward.admits(0x20, 0x10));
        assert!(StackGrowth::Upward.prefers(0x30, 0x20));
    }

    #[test]
    fn test_every_backend_rejects_duplicates_and_drains() {
        for kind in [
            RegistryKind::Locked,
            RegistryKind::LockFree { capacity: 4 },
            RegistryKind::Single,
        ] {
            let registry = Registry::new(kind).unwrap();
            assert_eq!(registry.kind(), kind);
            assert!(registry.is_empty());

            let ctxs = contexts(&[7, 7]);
            let (first, second) = (NonNull::from(&ctxs[0]), NonNull::from(&ctxs[1]));
            registry.insert(key(7), first).unwrap();
            assert_eq!(registry.insert(key(7), second), Err(TlsError::ContextExists(7)));
            assert_eq!(registry.get(key(7)), Some(first));
            assert_eq!(registry.len(), 1);

            let mut drained = Vec::new();
            registry.drain(&mut |k, c| drained.push((k, c)));
            assert_eq!(drained, [(key(7), first)]);
            assert!(registry.is_empty());
            assert_eq!(registry.get(key(7)), None);
        }
    }

    #[test]
    fn test_empty_slot_table_is_refused() {
        let err = Registry::new(RegistryKind::LockFree { capacity: 0 }).unwrap_err();
        assert!(matches!(err, TlsError::InvalidConfig(_)));
    }
}
