//! # Context maps
//!
//! A context map holds every entry of one execution context: one passive
//! thread, or one registered interrupt handler invocation.
//!
//! ## Allocation
//!
//! - A **passive** map owns an [`Arena`] carved from the database's fallback
//!   allocator at creation. Entries are served from that block first and
//!   spill into the fallback once it is full, so a thread with a handful of
//!   keys never touches the shared allocator after its first acquire.
//! - An **interrupt** map borrows the [`Arena`] its handler registered with
//!   and allocates entries from it only.
//! - Either default is bypassed when the caller supplies its own allocator;
//!   such entries remember the allocator's identity and can only be released
//!   with the same allocator.
//!
//! The key-to-entry index of a map is an [`EntryTable`] grown through the
//! same allocator, and the map carries its own registry link, so neither
//! acquiring nor registering a context touches the global heap.
//!
//! A map is only ever touched by the context it belongs to, so it carries no
//! lock of its own.

use core::{fmt, ptr::NonNull};

use ctx_tls_alloc::{Allocator, Arena, Spill, drop_in, new_in};
use intrusive_collections::{KeyAdapter, RBTreeLink, UnsafeRef, intrusive_adapter};

use crate::{
    entry::{Entry, Origin, Slot, Value},
    error::{Result, TlsError},
    key::TlsKey,
    table::EntryTable,
};

/// Identity of a context: a thread id for passive threads, the address of
/// the registering handler's allocator for interrupt contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ContextKey(u64);

impl ContextKey {
    /// Wraps a raw identity.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identity.
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// The identity of the interrupt context registered with `arena`.
    pub fn of_arena(arena: &Arena) -> Self {
        Self(arena as *const Arena as usize as u64)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Where a context's entries come from by default.
enum Backing {
    Passive { arena: Option<Arena> },
    Isr { arena: NonNull<Arena> },
}

impl Backing {
    /// Runs `f` with `custom`, or with the context's own allocator.
    fn with_allocator<R>(
        &self,
        custom: Option<&dyn Allocator>,
        fallback: &dyn Allocator,
        f: impl FnOnce(&dyn Allocator) -> R,
    ) -> R {
        if let Some(custom) = custom {
            return f(custom);
        }

        match self {
            Self::Passive { arena } => f(&Spill::new(arena.as_ref(), fallback)),
            // SAFETY: the handler keeps its arena alive until it deregisters,
            // which also destroys the map.
            Self::Isr { arena } => f(unsafe { arena.as_ref() }),
        }
    }
}

/// The entries of one context.
pub(crate) struct ContextMap {
    key: ContextKey,
    backing: Backing,
    entries: EntryTable,
    link: RBTreeLink,
}

intrusive_adapter!(pub(crate) ContextAdapter = UnsafeRef<ContextMap>: ContextMap { link: RBTreeLink });

impl<'a> KeyAdapter<'a> for ContextAdapter {
    type Key = ContextKey;

    fn get_key(&self, ctx: &'a ContextMap) -> ContextKey {
        ctx.key
    }
}

// SAFETY: a map is only used by the context it belongs to, except at
// teardown, when the database has exclusive access to every map. The link is
// only touched under the lock of the registry it is linked into.
unsafe impl Send for ContextMap {}

impl ContextMap {
    /// A passive thread's map. The arena, if any, is attached afterwards with
    /// [`ContextMap::attach_arena`].
    pub(crate) fn passive(key: ContextKey) -> Self {
        Self {
            key,
            backing: Backing::Passive { arena: None },
            entries: EntryTable::new(),
            link: RBTreeLink::new(),
        }
    }

    /// An interrupt handler's map, allocating from `arena`.
    pub(crate) fn isr(key: ContextKey, arena: NonNull<Arena>) -> Self {
        Self {
            key,
            backing: Backing::Isr { arena },
            entries: EntryTable::new(),
            link: RBTreeLink::new(),
        }
    }

    pub(crate) fn key(&self) -> ContextKey {
        self.key
    }

    pub(crate) fn is_isr(&self) -> bool {
        matches!(self.backing, Backing::Isr { .. })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Gives a passive map its entry block.
    pub(crate) fn attach_arena(&mut self, block: Arena) {
        if let Backing::Passive { arena } = &mut self.backing {
            *arena = Some(block);
        }
    }

    /// Takes a passive map's entry block back, for release to its parent.
    pub(crate) fn detach_arena(&mut self) -> Option<Arena> {
        match &mut self.backing {
            Backing::Passive { arena } => arena.take(),
            Backing::Isr { .. } => None,
        }
    }

    /// The allocator an interrupt map was registered with.
    pub(crate) fn isr_arena(&self) -> Option<NonNull<Arena>> {
        match self.backing {
            Backing::Isr { arena } => Some(arena),
            Backing::Passive { .. } => None,
        }
    }

    /// Gets or creates the entry for `key`, adding a reference.
    pub(crate) fn acquire(
        &mut self,
        key: TlsKey,
        custom: Option<&dyn Allocator>,
        fallback: &dyn Allocator,
    ) -> Result<Slot> {
        if let Some(entry) = self.entries.get(key) {
            // SAFETY: entries in the map are live and owned by this map.
            let entry = unsafe { &mut *entry.as_ptr() };
            entry.retain().ok_or(TlsError::RefCountOverflow(key))?;
            return Ok(entry.slot());
        }

        let origin = Origin::of(custom);
        let mut entry = self
            .backing
            .with_allocator(custom, fallback, |alloc| new_in(alloc, Entry::new(origin)))
            .ok_or(TlsError::OutOfMemory)?;

        // The index always grows through the context's own allocator.
        let entries = &mut self.entries;
        let indexed = self
            .backing
            .with_allocator(None, fallback, |alloc| entries.insert(key, entry, alloc));
        if let Err(err) = indexed {
            // SAFETY: just allocated with this allocator and never published.
            self.backing
                .with_allocator(custom, fallback, |alloc| unsafe { drop_in(alloc, entry) });
            return Err(err);
        }

        // SAFETY: just allocated and initialized.
        Ok(unsafe { entry.as_mut() }.slot())
    }

    /// Drops a reference to `key`'s entry, freeing the entry when none remain.
    ///
    /// Returns the remaining reference count.
    pub(crate) fn release(
        &mut self,
        key: TlsKey,
        custom: Option<&dyn Allocator>,
        fallback: &dyn Allocator,
    ) -> Result<u32> {
        let ptr = self.entries.get(key).ok_or(TlsError::NotFound(key))?;

        // SAFETY: entries in the map are live and owned by this map.
        let entry = unsafe { &mut *ptr.as_ptr() };
        if entry.origin() != Origin::of(custom) {
            return Err(TlsError::AllocatorMismatch(key));
        }

        let remaining = entry.unretain();
        if remaining == 0 {
            self.entries.remove(key);
            // SAFETY: allocated by `acquire` with the allocator this origin
            // designates, and no longer reachable from the map.
            self.backing
                .with_allocator(custom, fallback, |alloc| unsafe { drop_in(alloc, ptr) });
            if self.entries.is_empty() {
                self.release_index(fallback);
            }
        }

        Ok(remaining)
    }

    pub(crate) fn get(&self, key: TlsKey) -> Option<Value> {
        self.entry(key).map(Entry::value)
    }

    /// Overwrites an existing entry's payload. Returns `false` if there is no
    /// entry for `key`.
    pub(crate) fn set(&mut self, key: TlsKey, value: Value) -> bool {
        match self.entry_mut(key) {
            Some(entry) => {
                entry.set_value(value);
                true
            }
            None => false,
        }
    }

    pub(crate) fn ref_count(&self, key: TlsKey) -> Option<u32> {
        self.entry(key).map(Entry::ref_count)
    }

    /// Adds a reference without allocating.
    pub(crate) fn reference(&mut self, key: TlsKey) -> Result<u32> {
        let entry = self.entry_mut(key).ok_or(TlsError::NotFound(key))?;
        entry.retain().ok_or(TlsError::RefCountOverflow(key))
    }

    /// Drops a reference without freeing, even when the count reaches zero.
    pub(crate) fn unreference(&mut self, key: TlsKey) -> Result<u32> {
        let entry = self.entry_mut(key).ok_or(TlsError::NotFound(key))?;
        if entry.ref_count() == 0 {
            return Err(TlsError::RefCountUnderflow(key));
        }
        Ok(entry.unretain())
    }

    /// Frees every entry that came from the context's own allocator.
    ///
    /// Entries from caller-supplied allocators cannot be freed here; they are
    /// dropped from the map and their count returned.
    pub(crate) fn clear(&mut self, fallback: &dyn Allocator) -> usize {
        let mut stranded = 0;

        for &(_, ptr) in self.entries.as_slice() {
            // SAFETY: the entry is live, and the index is emptied below.
            match unsafe { ptr.as_ref() }.origin() {
                Origin::Context => self
                    .backing
                    .with_allocator(None, fallback, |alloc| unsafe { drop_in(alloc, ptr) }),
                Origin::Custom(_) => stranded += 1,
            }
        }

        self.entries.clear();
        self.release_index(fallback);
        stranded
    }

    fn release_index(&mut self, fallback: &dyn Allocator) {
        let entries = &mut self.entries;
        // SAFETY: the index only ever grows through the context's own
        // allocator, which is what `None` selects.
        self.backing
            .with_allocator(None, fallback, |alloc| unsafe { entries.release_storage(alloc) });
    }

    fn entry(&self, key: TlsKey) -> Option<&Entry> {
        // SAFETY: entries in the map are live and owned by this map.
        self.entries.get(key).map(|ptr| unsafe { ptr.as_ref() })
    }

    pub(crate) fn entry_mut(&mut self, key: TlsKey) -> Option<&mut Entry> {
        // SAFETY: entries in the map are live and owned by this map.
        self.entries.get(key).map(|ptr| unsafe { &mut *ptr.as_ptr() })
    }
}

#[cfg(test)]
mod tests {
    use core::{mem::MaybeUninit, ptr::NonNull};

    use ctx_tls_alloc::{Allocator, Arena, HeapAllocator};

    use super::{ContextKey, ContextMap};
    use crate::{
        entry::EMPTY,
        error::TlsError,
        key::TlsKey,
        testing::{CountingAllocator, value},
    };

    fn passive_map(fallback: &dyn Allocator, block: usize) -> ContextMap {
        let mut map = ContextMap::passive(ContextKey::from_raw(1));
        map.attach_arena(Arena::carve(fallback, block).unwrap());
        map
    }

    fn dispose(mut map: ContextMap, fallback: &dyn Allocator) {
        assert_eq!(map.clear(fallback), 0);
        if let Some(arena) = map.detach_arena() {
            unsafe { arena.release(fallback) };
        }
    }

    #[test]
    fn test_acquire_twice_shares_one_entry() {
        let heap = HeapAllocator;
        let mut map = passive_map(&heap, 256);
        let key = TlsKey::from_raw(20);

        let first = map.acquire(key, None, &heap).unwrap();
        unsafe { first.write(value(5)) };
        let second = map.acquire(key, None, &heap).unwrap();

        assert_eq!(first, second);
        assert_eq!(map.ref_count(key), Some(2));
        assert_eq!(map.get(key), Some(value(5)));

        assert_eq!(map.release(key, None, &heap), Ok(1));
        assert_eq!(map.release(key, None, &heap), Ok(0));
        assert!(map.is_empty());
        dispose(map, &heap);
    }

    #[test]
    fn test_entries_spill_past_the_block() {
        let fallback = CountingAllocator::new();
        let mut map = passive_map(&fallback, 64);
        assert_eq!(fallback.live(), 1);

        let keys: std::vec::Vec<_> = (0..16).map(TlsKey::from_raw).collect();
        for &key in &keys {
            map.acquire(key, None, &fallback).unwrap();
        }
        assert!(fallback.live() > 1, "some entries should come from the fallback");

        for &key in &keys {
            assert_eq!(map.release(key, None, &fallback), Ok(0));
        }
        assert_eq!(fallback.live(), 1);
        dispose(map, &fallback);
        assert_eq!(fallback.live(), 0);
    }

    #[test]
    fn test_release_requires_the_acquiring_allocator() {
        let heap = HeapAllocator;
        let custom = CountingAllocator::new();
        let mut map = passive_map(&heap, 256);
        let key = TlsKey::from_raw(4);

        map.acquire(key, Some(&custom), &heap).unwrap();
        assert_eq!(custom.live(), 1);
        assert_eq!(
            map.release(key, None, &heap),
            Err(TlsError::AllocatorMismatch(key))
        );
        assert_eq!(map.release(key, Some(&custom), &heap), Ok(0));
        assert_eq!(custom.live(), 0);
        dispose(map, &heap);
    }

    #[test]
    fn test_failed_allocation_leaves_no_entry() {
        let heap = HeapAllocator;
        let failing = CountingAllocator::failing_after(0);
        let mut map = passive_map(&heap, 256);

        let key = TlsKey::from_raw(9);
        assert_eq!(
            map.acquire(key, Some(&failing), &heap),
            Err(TlsError::OutOfMemory)
        );
        assert!(map.is_empty());
        assert_eq!(map.get(key), None);
        dispose(map, &heap);
    }

    #[test]
    fn test_unreference_never_frees() {
        let heap = HeapAllocator;
        let mut map = passive_map(&heap, 256);
        let key = TlsKey::from_raw(2);

        map.acquire(key, None, &heap).unwrap();
        assert_eq!(map.reference(key), Ok(2));
        assert_eq!(map.unreference(key), Ok(1));
        assert_eq!(map.unreference(key), Ok(0));
        assert_eq!(map.get(key), Some(EMPTY));
        assert_eq!(map.unreference(key), Err(TlsError::RefCountUnderflow(key)));

        // Releasing an entry already at zero frees it.
        assert_eq!(map.release(key, None, &heap), Ok(0));
        assert!(map.is_empty());
        dispose(map, &heap);
    }

    #[test]
    fn test_set_never_creates() {
        let heap = HeapAllocator;
        let mut map = passive_map(&heap, 256);
        assert!(!map.set(TlsKey::from_raw(1), value(1)));
        assert!(map.is_empty());
        dispose(map, &heap);
    }

    #[test]
    fn test_isr_maps_never_touch_the_fallback() {
        let fallback = CountingAllocator::new();
        let mut buf = [MaybeUninit::<u64>::uninit(); 256];
        let arena =
            unsafe { Arena::from_raw_parts(buf.as_mut_ptr().cast(), size_of_val(&buf)) }.unwrap();
        let mut map = ContextMap::isr(ContextKey::of_arena(&arena), NonNull::from(&arena));

        let keys: std::vec::Vec<_> = (1..=9).map(TlsKey::from_raw).collect();
        for &key in &keys {
            map.acquire(key, None, &fallback).unwrap();
        }
        assert_eq!(fallback.live(), 0);
        assert!(arena.used() > 0);

        for &key in &keys {
            assert_eq!(map.release(key, None, &fallback), Ok(0));
        }
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_reference_count_does_not_wrap() {
        let heap = HeapAllocator;
        let mut map = passive_map(&heap, 256);
        let key = TlsKey::from_raw(6);

        map.acquire(key, None, &heap).unwrap();
        map.entry_mut(key).unwrap().set_ref_count(u32::MAX);

        assert_eq!(map.reference(key), Err(TlsError::RefCountOverflow(key)));
        assert_eq!(
            map.acquire(key, None, &heap).err(),
            Some(TlsError::RefCountOverflow(key))
        );
        assert_eq!(map.ref_count(key), Some(u32::MAX));

        map.entry_mut(key).unwrap().set_ref_count(1);
        assert_eq!(map.release(key, None, &heap), Ok(0));
        dispose(map, &heap);
    }

    #[test]
    fn test_failed_index_growth_frees_the_new_entry() {
        // The first allocation serves the entry, the second would grow the
        // index.
        let fallback = CountingAllocator::failing_after(1);
        let mut map = ContextMap::passive(ContextKey::from_raw(2));
        let key = TlsKey::from_raw(8);

        assert_eq!(map.acquire(key, None, &fallback).err(), Some(TlsError::OutOfMemory));
        assert!(map.is_empty());
        assert_eq!(fallback.live(), 0);
        dispose(map, &fallback);
    }
}
