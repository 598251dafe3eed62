//! # TLS database
//!
//! [`TlsDatabase`] owns every registry and context and implements the
//! acquire/release protocol on top of them.
//!
//! ## Design
//!
//! - The database is an ordinary value. Whoever bootstraps the subsystem
//!   builds one with [`TlsDatabase::new`] and passes it to its users; dropping
//!   it tears everything down. [`SharedTls`](crate::SharedTls) adds
//!   reference-counted initialization on top for hosts with several
//!   independent owners.
//! - Each call first classifies the caller. Passive threads find their
//!   context by thread id and get one created on their first acquire.
//!   Interrupt handlers find theirs by a fuzzy lookup on the current stack
//!   address, and must have registered it beforehand with
//!   [`TlsDatabase::isr_register`].
//! - A context map is only ever touched by its own context, so entry
//!   operations run without locks. Only registry lookups and updates
//!   synchronize, inside the registry backend.
//! - A passive context is destroyed as soon as its last entry is released.
//!   An interrupt context lives from registration to deregistration.
//!
//! ## Memory
//!
//! | Object | Allocated from |
//! |---|---|
//! | passive context map and its entry block | the fallback allocator |
//! | passive entry and entry index | the entry block, spilling into the fallback |
//! | interrupt context map, its index and its entries | the handler's [`Arena`] |
//! | registry bookkeeping | nothing after construction |
//! | any entry acquired with [`acquire_with`](TlsDatabase::acquire_with) | the given allocator |

use core::{
    hint,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use ctx_tls_alloc::{Allocator, Arena, ArenaError, HeapAllocator, drop_in, new_in};

use crate::{
    classify::{Classifier, Platform},
    config::TlsConfig,
    context::{ContextKey, ContextMap},
    entry::{EMPTY, Slot, Value},
    error::{Result, TlsError},
    key::{KeyCounter, TlsKey},
    registry::{ContextRegistry, Registry},
};

/// The per-context storage manager.
pub struct TlsDatabase<P: Platform, A: Allocator = HeapAllocator> {
    platform: P,
    fallback: A,
    config: TlsConfig,
    keys: KeyCounter,
    classifier: Classifier,
    passive: Registry,
    isr: Registry,
    passive_register_reported: AtomicBool,
}

impl<P: Platform, A: Allocator> TlsDatabase<P, A> {
    /// Builds a database.
    ///
    /// # Errors
    ///
    /// - [`TlsError::InvalidConfig`] if `config` does not validate.
    /// - [`TlsError::OutOfMemory`] if a registry or the nesting counters
    ///   cannot be allocated.
    ///
    /// Nothing is left allocated on failure.
    pub fn new(platform: P, fallback: A, config: TlsConfig) -> Result<Self> {
        config.validate().map_err(TlsError::report)?;

        let classifier = Classifier::new(config.classifier).map_err(TlsError::report)?;
        let passive = Registry::new(config.passive_registry).map_err(TlsError::report)?;
        let isr = Registry::new(config.isr_registry).map_err(TlsError::report)?;

        log::debug!(
            "TLS: database ready (passive {:?}, isr {:?}, {:?})",
            config.passive_registry,
            config.isr_registry,
            config.classifier
        );

        Ok(Self {
            platform,
            fallback,
            config,
            keys: KeyCounter::new(),
            classifier,
            passive,
            isr,
            passive_register_reported: AtomicBool::new(false),
        })
    }

    /// Issues a fresh dynamic key, unique for the database's lifetime.
    pub fn alloc_key(&self) -> TlsKey {
        self.keys.issue()
    }

    /// Whether the caller is classified as interrupt context.
    pub fn is_interrupt(&self) -> bool {
        self.classifier.is_interrupt(&self.platform)
    }

    /// Gets or creates the caller's entry for `key` and adds a reference.
    ///
    /// A new entry starts out [`EMPTY`]; an existing one keeps its value.
    ///
    /// # Errors
    ///
    /// - [`TlsError::InvalidKey`] if `key` is a dynamic key not yet issued.
    /// - [`TlsError::IsrNotRegistered`] if called from a handler that has
    ///   not registered.
    /// - [`TlsError::OutOfMemory`] if the context or entry cannot be
    ///   allocated. No context or entry is left behind.
    /// - [`TlsError::RefCountOverflow`] if the entry already holds the most
    ///   references a count can represent.
    pub fn acquire(&self, key: TlsKey) -> Result<Slot> {
        self.acquire_in(key, None)
    }

    /// Like [`acquire`](Self::acquire), but a new entry is allocated from
    /// `alloc`. The entry must later be released with the same allocator.
    pub fn acquire_with(&self, key: TlsKey, alloc: &dyn Allocator) -> Result<Slot> {
        self.acquire_in(key, Some(alloc))
    }

    /// Drops one reference to the caller's entry for `key`, freeing it when
    /// none remain. A passive context left without entries is destroyed.
    ///
    /// Returns the remaining reference count.
    ///
    /// # Errors
    ///
    /// - [`TlsError::NotFound`] if the caller holds no entry for `key`.
    /// - [`TlsError::AllocatorMismatch`] if the entry was acquired with
    ///   [`acquire_with`](Self::acquire_with).
    pub fn release(&self, key: TlsKey) -> Result<u32> {
        self.release_in(key, None)
    }

    /// Releases an entry acquired with [`acquire_with`](Self::acquire_with)
    /// and the same `alloc`.
    pub fn release_with(&self, key: TlsKey, alloc: &dyn Allocator) -> Result<u32> {
        self.release_in(key, Some(alloc))
    }

    /// The caller's value for `key`, or [`EMPTY`] if it holds no entry.
    pub fn get(&self, key: TlsKey) -> Value {
        self.current()
            .and_then(|ctx| {
                // SAFETY: only the calling context uses its own map.
                unsafe { ctx.as_ref() }.get(key)
            })
            .unwrap_or(EMPTY)
    }

    /// Overwrites the caller's value for `key`. Returns `false`, without
    /// creating anything, if the caller holds no entry for `key`.
    pub fn set(&self, key: TlsKey, value: Value) -> bool {
        // SAFETY: only the calling context uses its own map.
        let stored = self
            .current()
            .is_some_and(|ctx| unsafe { &mut *ctx.as_ptr() }.set(key, value));
        if !stored {
            TlsError::NotFound(key).report();
        }
        stored
    }

    /// Adds a reference to an existing entry without allocating.
    ///
    /// Returns the new reference count.
    ///
    /// # Errors
    ///
    /// - [`TlsError::NotFound`] if the caller holds no entry for `key`.
    /// - [`TlsError::RefCountOverflow`] if the count is already at its
    ///   maximum. The count is left unchanged.
    pub fn reference(&self, key: TlsKey) -> Result<u32> {
        self.with_current(key, |map| map.reference(key))
    }

    /// Drops a reference without ever freeing the entry, even at zero. The
    /// entry stays until a matching [`release`](Self::release).
    ///
    /// Returns the new reference count.
    ///
    /// # Errors
    ///
    /// [`TlsError::RefCountUnderflow`] if the count is already zero.
    pub fn unreference(&self, key: TlsKey) -> Result<u32> {
        self.with_current(key, |map| map.unreference(key))
    }

    /// Registers the calling interrupt handler, which allocates its context
    /// and entries from `arena`.
    ///
    /// Called from a passive thread this does nothing, and the first such
    /// call is logged. Under [`ClassifierMode::NestingCounter`] every call
    /// registers, and the caller counts as interrupt context from then on.
    ///
    /// # Errors
    ///
    /// - [`TlsError::OutOfMemory`] if `arena` cannot hold the context.
    /// - [`TlsError::ContextExists`] if `arena` is already registered.
    /// - [`TlsError::CapacityExhausted`] if a bounded registry is full.
    ///
    /// # Safety
    ///
    /// `arena` must stay alive and in place until the matching
    /// [`isr_deregister`](Self::isr_deregister), and must sit on the
    /// handler's stack (or, for [`RegistryKind::Single`], anywhere) so that
    /// lookups from deeper frames resolve to it. Prefer
    /// [`isr_scope`](Self::isr_scope), which upholds this by construction.
    ///
    /// [`ClassifierMode::NestingCounter`]: crate::ClassifierMode::NestingCounter
    /// [`RegistryKind::Single`]: crate::RegistryKind::Single
    pub unsafe fn isr_register(&self, arena: &Arena) -> Result<()> {
        if !self.classifier.counts_nesting() && !self.is_interrupt() {
            if !self.passive_register_reported.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "TLS: interrupt registration from a passive thread ignored; \
                     further ones will not be reported"
                );
            }
            return Ok(());
        }

        let key = ContextKey::of_arena(arena);
        let ctx = new_in(arena, ContextMap::isr(key, NonNull::from(arena)))
            .ok_or_else(|| TlsError::OutOfMemory.report())?;

        if let Err(err) = self.isr.insert(key, ctx) {
            // SAFETY: allocated above from the same arena, never published.
            unsafe { drop_in(arena, ctx) };
            return Err(err.report());
        }

        self.classifier.enter(&self.platform);
        log::debug!("TLS: registered interrupt context {key}");
        Ok(())
    }

    /// Deregisters the calling interrupt handler and frees its context.
    ///
    /// Entries still held are freed with it and reported. From a passive
    /// thread this does nothing, unless the classifier counts nesting, in
    /// which case it fails.
    ///
    /// # Errors
    ///
    /// - [`TlsError::NotInInterrupt`] under a nesting classifier when the
    ///   caller holds no registration.
    /// - [`TlsError::IsrNotRegistered`] if `arena` was never registered.
    ///
    /// # Safety
    ///
    /// No [`Slot`] obtained in the handler's context may be used afterwards.
    pub unsafe fn isr_deregister(&self, arena: &Arena) -> Result<()> {
        if !self.is_interrupt() {
            if self.classifier.counts_nesting() {
                return Err(TlsError::NotInInterrupt.report());
            }
            return Ok(());
        }

        let key = ContextKey::of_arena(arena);
        let ctx = match self.isr.get(key) {
            // SAFETY: registered contexts are live until removed here.
            Some(ctx) if unsafe { ctx.as_ref() }.key() == key => ctx,
            _ => return Err(TlsError::IsrNotRegistered.report()),
        };
        self.isr.remove(key);

        // SAFETY: unpublished above; the map and its entries came from
        // `arena`, which the caller keeps alive until this returns.
        let map = unsafe { &mut *ctx.as_ptr() };
        let live = map.len();
        let stranded = map.clear(&self.fallback);
        if live > 0 {
            log::warn!(
                "TLS: interrupt context {key} deregistered holding {live} entries \
                 ({stranded} from caller allocators leaked)"
            );
        }
        unsafe { drop_in(arena, ctx) };

        self.classifier.leave(&self.platform);
        log::debug!("TLS: deregistered interrupt context {key}");
        Ok(())
    }

    /// Runs `f` with the calling handler registered on `arena`.
    ///
    /// The registration ends when `f` returns or unwinds.
    ///
    /// # Errors
    ///
    /// Fails, without running `f`, when [`isr_register`](Self::isr_register)
    /// fails.
    pub fn isr_scope<R>(&self, arena: &Arena, f: impl FnOnce() -> R) -> Result<R> {
        // SAFETY: `arena` is borrowed for the whole registration, which the
        // guard ends before this function returns.
        unsafe { self.isr_register(arena)? };
        let _registration = IsrRegistration { db: self, arena };
        Ok(f())
    }

    /// The allocator the calling handler registered with, or `None` outside
    /// a registered handler.
    ///
    /// The arena is only valid until the handler deregisters.
    pub fn isr_allocator(&self) -> Option<NonNull<Arena>> {
        if !self.is_interrupt() {
            return None;
        }
        let (_, ctx) = self.isr.find_nearest(stack_probe(), self.config.stack_growth)?;
        // SAFETY: registered contexts are live while their handler runs.
        unsafe { ctx.as_ref() }.isr_arena()
    }

    /// Number of live contexts, passive and interrupt.
    pub fn context_count(&self) -> usize {
        self.passive.len() + self.isr.len()
    }

    /// Number of entries held by the calling context.
    pub fn entry_count(&self) -> usize {
        self.current()
            // SAFETY: only the calling context uses its own map.
            .map_or(0, |ctx| unsafe { ctx.as_ref() }.len())
    }

    /// Reference count of the caller's entry for `key`.
    pub fn ref_count(&self, key: TlsKey) -> Option<u32> {
        // SAFETY: only the calling context uses its own map.
        self.current()
            .and_then(|ctx| unsafe { ctx.as_ref() }.ref_count(key))
    }

    /// The host platform the database classifies callers with.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// The allocator behind passive contexts and their spilled entries.
    pub fn fallback(&self) -> &A {
        &self.fallback
    }

    /// The configuration the database was built with.
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    fn thread_key(&self) -> ContextKey {
        ContextKey::from_raw(self.platform.current_thread_id())
    }

    /// The caller's context, if it has one.
    fn current(&self) -> Option<NonNull<ContextMap>> {
        if self.is_interrupt() {
            self.isr
                .find_nearest(stack_probe(), self.config.stack_growth)
                .map(|(_, ctx)| ctx)
        } else {
            self.passive.get(self.thread_key())
        }
    }

    fn with_current<R>(&self, key: TlsKey, f: impl FnOnce(&mut ContextMap) -> Result<R>) -> Result<R> {
        let Some(ctx) = self.current() else {
            return Err(TlsError::NotFound(key).report());
        };
        // SAFETY: only the calling context uses its own map.
        f(unsafe { &mut *ctx.as_ptr() }).map_err(TlsError::report)
    }

    /// The caller's context, created first for a passive thread that has
    /// none. The flag tells whether it was just created.
    fn current_or_create(&self) -> Result<(NonNull<ContextMap>, bool)> {
        if self.is_interrupt() {
            return self
                .isr
                .find_nearest(stack_probe(), self.config.stack_growth)
                .map(|(_, ctx)| (ctx, false))
                .ok_or(TlsError::IsrNotRegistered);
        }

        // Only the owning thread inserts under its own key, so the lookup and
        // the insert below cannot race for the same context.
        let key = self.thread_key();
        if let Some(ctx) = self.passive.get(key) {
            return Ok((ctx, false));
        }
        self.create_passive(key).map(|ctx| (ctx, true))
    }

    fn create_passive(&self, key: ContextKey) -> Result<NonNull<ContextMap>> {
        let ctx = new_in(&self.fallback, ContextMap::passive(key)).ok_or(TlsError::OutOfMemory)?;

        let block = self.config.entry_block_bytes();
        if block > 0 {
            match Arena::carve(&self.fallback, block) {
                // SAFETY: freshly allocated and not yet published.
                Ok(arena) => unsafe { &mut *ctx.as_ptr() }.attach_arena(arena),
                Err(err) => {
                    // SAFETY: as above.
                    unsafe { drop_in(&self.fallback, ctx) };
                    return Err(match err {
                        ArenaError::OutOfMemory => TlsError::OutOfMemory,
                        ArenaError::Layout(_) => TlsError::InvalidConfig("entry block too small"),
                    });
                }
            }
        }

        if let Err(err) = self.passive.insert(key, ctx) {
            // SAFETY: never published.
            unsafe { self.destroy_passive(ctx) };
            return Err(err);
        }

        log::debug!("TLS: created context {key}");
        Ok(ctx)
    }

    fn retire_passive(&self, ctx: NonNull<ContextMap>) {
        // SAFETY: only the owning thread retires its context.
        let key = unsafe { ctx.as_ref() }.key();
        if self.passive.remove(key).is_some() {
            // SAFETY: unpublished above.
            unsafe { self.destroy_passive(ctx) };
        }
    }

    /// Frees a passive context, its entries and its entry block.
    ///
    /// # Safety
    ///
    /// `ctx` must be an unpublished passive context created by
    /// [`create_passive`](Self::create_passive).
    unsafe fn destroy_passive(&self, ctx: NonNull<ContextMap>) {
        let map = unsafe { &mut *ctx.as_ptr() };
        let key = map.key();

        let live = map.len();
        let stranded = map.clear(&self.fallback);
        if live > 0 {
            log::warn!(
                "TLS: context {key} destroyed holding {live} entries \
                 ({stranded} from caller allocators leaked)"
            );
        }

        if let Some(arena) = map.detach_arena() {
            // SAFETY: carved from the fallback in `create_passive`; every
            // entry from it was freed by `clear`.
            unsafe { arena.release(&self.fallback) };
        }
        unsafe { drop_in(&self.fallback, ctx) };

        log::debug!("TLS: destroyed context {key}");
    }

    fn acquire_in(&self, key: TlsKey, custom: Option<&dyn Allocator>) -> Result<Slot> {
        if !self.keys.accepts(key) {
            return Err(TlsError::InvalidKey(key).report());
        }

        let (ctx, created) = self.current_or_create().map_err(TlsError::report)?;
        // SAFETY: only the calling context uses its own map.
        let map = unsafe { &mut *ctx.as_ptr() };

        map.acquire(key, custom, &self.fallback).map_err(|err| {
            if created && map.is_empty() {
                self.retire_passive(ctx);
            }
            err.report()
        })
    }

    fn release_in(&self, key: TlsKey, custom: Option<&dyn Allocator>) -> Result<u32> {
        let Some(ctx) = self.current() else {
            return Err(TlsError::NotFound(key).report());
        };
        // SAFETY: only the calling context uses its own map.
        let map = unsafe { &mut *ctx.as_ptr() };

        let remaining = map.release(key, custom, &self.fallback).map_err(TlsError::report)?;
        if map.is_empty() && !map.is_isr() {
            self.retire_passive(ctx);
        }
        Ok(remaining)
    }
}

impl<P: Platform, A: Allocator> Drop for TlsDatabase<P, A> {
    fn drop(&mut self) {
        self.passive.drain(&mut |_, ctx| {
            // SAFETY: drained, so unpublished; the database is exclusively
            // borrowed, so no thread is using the context.
            unsafe { self.destroy_passive(ctx) }
        });

        // Interrupt contexts live in their handlers' arenas, which may
        // already be gone. They are dropped from the registry but not freed.
        self.isr.drain(&mut |key, _| {
            log::warn!("TLS: interrupt context {key} still registered at teardown");
        });

        log::debug!("TLS: database torn down");
    }
}

impl<P: Platform, A: Allocator> core::fmt::Debug for TlsDatabase<P, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TlsDatabase")
            .field("config", &self.config)
            .field("passive", &self.passive)
            .field("isr", &self.isr)
            .finish_non_exhaustive()
    }
}

/// Ends an [`isr_scope`](TlsDatabase::isr_scope) registration on drop.
struct IsrRegistration<'a, P: Platform, A: Allocator> {
    db: &'a TlsDatabase<P, A>,
    arena: &'a Arena,
}

impl<P: Platform, A: Allocator> Drop for IsrRegistration<'_, P, A> {
    fn drop(&mut self) {
        // SAFETY: slots from the scope's context do not outlive the closure
        // they were obtained in, unless the closure smuggled them out, which
        // `isr_scope` documents as unusable.
        let _ = unsafe { self.db.isr_deregister(self.arena) };
    }
}

/// An address on the caller's stack, one frame deeper than the caller.
#[inline(never)]
fn stack_probe() -> u64 {
    let marker = 0u8;
    hint::black_box(&marker) as *const u8 as usize as u64
}
