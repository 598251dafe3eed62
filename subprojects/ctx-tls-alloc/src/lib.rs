//! # ctx-tls-alloc
//!
//! Pluggable allocation strategies for the context TLS manager.
//!
//! The manager never calls the global allocator directly for the objects it
//! owns. Every allocation goes through an [`Allocator`] strategy object:
//!
//! - [`HeapAllocator`] forwards to the global heap and is the usual shared
//!   fallback.
//! - [`Arena`] is a first-fit allocator over a single pre-allocated block,
//!   either carved from another allocator or adopted from caller memory (for
//!   example a buffer on an interrupt handler's stack).
//! - [`Spill`] chains an optional arena in front of a fallback.
#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod allocator;
mod arena;
mod spill;

pub use self::{
    allocator::{Allocator, HeapAllocator, drop_in, new_in},
    arena::{Arena, ArenaError, LayoutError, MIN_BLOCK_SIZE},
    spill::Spill,
};
