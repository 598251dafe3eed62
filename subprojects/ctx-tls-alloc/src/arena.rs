//! # Block-backed arena
//!
//! A first-fit allocator confined to one contiguous block of memory.
//!
//! It is based on the [linked_list_allocator](https://github.com/rust-osdev/linked_list_allocator)
//! crate: the block becomes a [`Heap`] whose free list is threaded through
//! the block itself, so the arena needs no bookkeeping memory of its own.
//! Access to the heap is serialized by a spin [`Mutex`], which makes the arena
//! usable from contexts that must not sleep.
//!
//! An arena can obtain its block in two ways:
//!
//! - [`Arena::carve`] allocates the block from another [`Allocator`]. The block
//!   must later be handed back with [`Arena::release`].
//! - [`Arena::from_raw_parts`] adopts memory the caller already owns, such as a
//!   buffer on an interrupt handler's stack. Nothing is freed when such an
//!   arena goes away.

use core::{alloc::Layout, ptr::NonNull};

use ctx_tls_sync::Mutex;
use linked_list_allocator::Heap;
use static_assertions::const_assert;

use crate::allocator::Allocator;

/// Alignment of blocks carved by [`Arena::carve`].
const BLOCK_ALIGN: usize = 2 * size_of::<usize>();

/// The smallest block a [`Heap`] can manage, whatever the block's alignment.
pub const MIN_BLOCK_SIZE: usize = 3 * size_of::<usize>();

const_assert!(BLOCK_ALIGN.is_power_of_two());

/// A first-fit allocator over a single block.
pub struct Arena {
    heap: Mutex<Heap>,
    bottom: usize,
    size: usize,
}

impl Arena {
    /// Adopts `size` bytes at `bottom` as the arena's block.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError`] if the block is null or smaller than
    /// [`MIN_BLOCK_SIZE`].
    ///
    /// # Safety
    ///
    /// The memory must be valid for reads and writes for as long as the arena
    /// or any block allocated from it is in use, and must not be accessed by
    /// anything else in the meantime.
    pub unsafe fn from_raw_parts(bottom: *mut u8, size: usize) -> Result<Self, LayoutError> {
        if bottom.is_null() || size < MIN_BLOCK_SIZE {
            return Err(LayoutError);
        }

        // SAFETY: the caller guarantees exclusive ownership of the block.
        let heap = unsafe { Heap::new(bottom, size) };

        Ok(Self {
            heap: Mutex::new(heap),
            bottom: bottom as usize,
            size,
        })
    }

    /// Creates an arena whose `size`-byte block is allocated from `from`.
    ///
    /// # Errors
    ///
    /// - [`ArenaError::Layout`] if `size` is too small to hold an arena.
    /// - [`ArenaError::OutOfMemory`] if `from` cannot provide the block.
    pub fn carve<A>(from: &A, size: usize) -> Result<Self, ArenaError>
    where
        A: Allocator + ?Sized,
    {
        let layout = block_layout(size)?;
        let block = from.allocate(layout).ok_or(ArenaError::OutOfMemory)?;

        // SAFETY: the block is freshly allocated and owned by the arena until
        // `release` hands it back.
        match unsafe { Self::from_raw_parts(block.as_ptr(), size) } {
            Ok(arena) => Ok(arena),
            Err(err) => {
                unsafe { from.deallocate(block, layout) };
                Err(err.into())
            }
        }
    }

    /// Gives a carved block back to the allocator it came from.
    ///
    /// # Safety
    ///
    /// The arena must have been created by [`Arena::carve`] with the same
    /// allocator, and no block allocated from the arena may be used
    /// afterwards.
    pub unsafe fn release<A>(self, from: &A)
    where
        A: Allocator + ?Sized,
    {
        // The size was validated by `carve`.
        let Ok(layout) = block_layout(self.size) else {
            return;
        };

        // SAFETY: `bottom` is the non-null block returned by `from.allocate`.
        let block = unsafe { NonNull::new_unchecked(self.bottom as *mut u8) };
        unsafe { from.deallocate(block, layout) };
    }

    /// Whether `ptr` points into this arena's block.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        addr >= self.bottom && addr < self.bottom + self.size
    }

    /// Total size of the arena's block in bytes.
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Bytes currently handed out, including allocator padding.
    pub fn used(&self) -> usize {
        self.heap.lock().used()
    }

    /// Address of the first byte of the block.
    pub fn bottom(&self) -> usize {
        self.bottom
    }
}

unsafe impl Allocator for Arena {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }

        self.heap.lock().allocate_first_fit(layout).ok()
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        debug_assert!(self.contains(ptr), "block freed into the wrong arena");
        unsafe { self.heap.lock().deallocate(ptr, layout) }
    }
}

impl core::fmt::Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("bottom", &format_args!("{:#x}", self.bottom))
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

fn block_layout(size: usize) -> Result<Layout, LayoutError> {
    if size < MIN_BLOCK_SIZE {
        return Err(LayoutError);
    }

    Layout::from_size_align(size, BLOCK_ALIGN).map_err(|_| LayoutError)
}

/// Invalid parameters for an arena block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
#[error("invalid arena block: null, too small, or too large")]
pub struct LayoutError;

/// An error that can occur when carving an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    /// The requested block size cannot back an arena.
    #[error(transparent)]
    Layout(#[from] LayoutError),
    /// The parent allocator could not provide the block.
    #[error("out of memory while carving an arena block")]
    OutOfMemory,
}

#[cfg(test)]
mod tests {
    use core::{alloc::Layout, mem::MaybeUninit};
    use std::vec::Vec;

    use super::{Arena, ArenaError, LayoutError, MIN_BLOCK_SIZE};
    use crate::{Allocator, HeapAllocator};

    #[test]
    fn test_carve_rejects_tiny_blocks() {
        let err = Arena::carve(&HeapAllocator, MIN_BLOCK_SIZE - 1).unwrap_err();
        assert_eq!(err, ArenaError::Layout(LayoutError));
    }

    #[test]
    fn test_allocations_stay_inside_the_block_until_exhausted() {
        let arena = Arena::carve(&HeapAllocator, 256).unwrap();
        let layout = Layout::new::<[u64; 2]>();

        let mut blocks = Vec::new();
        while let Some(ptr) = arena.allocate(layout) {
            assert!(arena.contains(ptr));
            blocks.push(ptr);
        }
        assert!(!blocks.is_empty());
        assert!(blocks.len() <= 256 / layout.size());

        for ptr in blocks.drain(..) {
            unsafe { arena.deallocate(ptr, layout) };
        }
        assert_eq!(arena.used(), 0);
        assert!(arena.allocate(layout).is_some());

        unsafe { arena.release(&HeapAllocator) };
    }

    #[test]
    fn test_adopts_caller_memory() {
        let mut buf = [MaybeUninit::<u64>::uninit(); 32];
        let arena =
            unsafe { Arena::from_raw_parts(buf.as_mut_ptr().cast(), size_of_val(&buf)) }.unwrap();
        assert_eq!(arena.capacity(), 256);
        assert_eq!(arena.bottom(), buf.as_ptr() as usize);

        let ptr = arena.allocate(Layout::new::<u64>()).unwrap();
        assert!(arena.contains(ptr));
        unsafe { arena.deallocate(ptr, Layout::new::<u64>()) };
    }

    #[test]
    fn test_null_block_is_refused() {
        let err = unsafe { Arena::from_raw_parts(core::ptr::null_mut(), 128) }.unwrap_err();
        assert_eq!(err, LayoutError);
    }
}
