//! # Allocator strategy
//!
//! The [`Allocator`] trait and the global-heap [`HeapAllocator`].

use core::{alloc::Layout, ptr::NonNull};

/// A memory allocation strategy.
///
/// Implementations hand out raw blocks and take them back. Callers must
/// return a block to the same allocator that produced it, with the same
/// layout.
///
/// # Safety
///
/// Implementors must return blocks that are valid for reads and writes of
/// `layout.size()` bytes, aligned to `layout.align()`, and that do not
/// overlap any other live block until passed back to [`deallocate`].
///
/// [`deallocate`]: Allocator::deallocate
pub unsafe trait Allocator: Send + Sync {
    /// Allocates a block for `layout`.
    ///
    /// Returns `None` when out of memory or when the layout is zero-sized.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Allocator::allocate) on
    /// this same allocator with the same `layout`, and must not be used
    /// afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

unsafe impl<A: Allocator + ?Sized> Allocator for &A {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

/// The process-wide heap, via the `#[global_allocator]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

unsafe impl Allocator for HeapAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }

        // SAFETY: the layout has a non-zero size.
        NonNull::new(unsafe { alloc::alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Moves `value` into a block allocated from `alloc`.
///
/// Returns `None` (dropping `value`) if the allocation fails.
pub fn new_in<T, A>(alloc: &A, value: T) -> Option<NonNull<T>>
where
    A: Allocator + ?Sized,
{
    let ptr = alloc.allocate(Layout::new::<T>())?.cast::<T>();

    // SAFETY: the block is fresh, properly sized and aligned for `T`.
    unsafe { ptr.as_ptr().write(value) };
    Some(ptr)
}

/// Drops the value behind `ptr` and returns its block to `alloc`.
///
/// # Safety
///
/// `ptr` must come from [`new_in`] called with the same allocator, and must
/// not be used afterwards.
pub unsafe fn drop_in<T, A>(alloc: &A, ptr: NonNull<T>)
where
    A: Allocator + ?Sized,
{
    unsafe {
        ptr.as_ptr().drop_in_place();
        alloc.deallocate(ptr.cast(), Layout::new::<T>());
    }
}
