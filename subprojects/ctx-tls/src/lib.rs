//! # ctx-tls
//!
//! Per-context storage keyed by integers, usable both from ordinary threads
//! and from interrupt handlers that must never block.
//!
//! ## Model
//!
//! - A **key** ([`TlsKey`]) names a piece of data across all contexts. Keys
//!   are either reserved, issued by [`TlsDatabase::alloc_key`], or tags
//!   derived by callers.
//! - A **context** is one passive thread, or one registered invocation of an
//!   interrupt handler. Every context has its own map from keys to entries.
//! - An **entry** holds one pointer-sized value owned by the caller, plus a
//!   reference count. [`TlsDatabase::acquire`] creates it (empty) or adds a
//!   reference; [`TlsDatabase::release`] drops a reference and frees the
//!   entry at zero.
//!
//! Operations always act on the caller's own context. Which one that is
//! gets decided per call by the [`Platform`] and the configured
//! [`ClassifierMode`].
//!
//! ```ignore
//! let db = TlsDatabase::new(StdPlatform, HeapAllocator, TlsConfig::default())?;
//!
//! let key = db.alloc_key();
//! let slot = db.acquire(key)?;
//! unsafe { slot.write(payload) };
//! assert_eq!(db.get(key), payload);
//! assert_eq!(db.release(key)?, 0);
//! ```
//!
//! ## Interrupt handlers
//!
//! A handler registers itself on entry with an [`Arena`] on its own stack,
//! most simply through [`TlsDatabase::isr_scope`]. Lookups from anywhere
//! inside the handler then find its context by stack address, and all of the
//! context's memory comes from that arena. See [`registry`] for the backends
//! that hold handler contexts, including a lock-free one.
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade and never installs a logger.
//! Contract violations are logged at `error` level in addition to being
//! returned as [`TlsError`].
#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

mod classify;
mod config;
mod context;
mod database;
mod entry;
mod error;
mod key;
pub mod registry;
mod shared;
mod table;

#[cfg(test)]
mod testing;

#[doc(inline)]
pub use ctx_tls_alloc::{Allocator, Arena, HeapAllocator};

#[cfg(feature = "std")]
pub use self::classify::StdPlatform;
pub use self::{
    classify::{ClassifierMode, Platform},
    config::{DEFAULT_ENTRY_BLOCK_ENTRIES, DEFAULT_ISR_SLOTS, TlsConfig},
    context::ContextKey,
    database::TlsDatabase,
    entry::{EMPTY, Slot, Value},
    error::{Result, TlsError},
    key::{KEY_DYNAMIC_START, KEY_TAG_START, TlsKey},
    registry::{RegistryKind, StackGrowth},
    shared::SharedTls,
};
