//! # Arena with fallback

use core::{alloc::Layout, ptr::NonNull};

use crate::{allocator::Allocator, arena::Arena};

/// An allocator that serves from an arena first and spills into a fallback
/// once the arena is full.
///
/// Frees are routed by address: blocks inside the arena go back to the
/// arena, everything else goes to the fallback.
#[derive(Clone, Copy)]
pub struct Spill<'a> {
    arena: Option<&'a Arena>,
    fallback: &'a dyn Allocator,
}

impl<'a> Spill<'a> {
    /// Creates a spilling allocator. Without an arena every request goes
    /// straight to `fallback`.
    pub fn new(arena: Option<&'a Arena>, fallback: &'a dyn Allocator) -> Self {
        Self { arena, fallback }
    }
}

unsafe impl Allocator for Spill<'_> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.arena
            .and_then(|arena| arena.allocate(layout))
            .or_else(|| self.fallback.allocate(layout))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        match self.arena {
            Some(arena) if arena.contains(ptr) => unsafe { arena.deallocate(ptr, layout) },
            _ => unsafe { self.fallback.deallocate(ptr, layout) },
        }
    }
}

#[cfg(test)]
mod tests {
    use core::alloc::Layout;
    use std::vec::Vec;

    use super::Spill;
    use crate::{Allocator, Arena, HeapAllocator};

    #[test]
    fn test_spills_to_the_fallback_once_the_arena_is_full() {
        let arena = Arena::carve(&HeapAllocator, 128).unwrap();
        let spill = Spill::new(Some(&arena), &HeapAllocator);
        let layout = Layout::new::<[u64; 2]>();

        let blocks: Vec<_> = (0..32).map(|_| spill.allocate(layout).unwrap()).collect();
        let (inside, outside): (Vec<_>, Vec<_>) =
            blocks.iter().copied().partition(|ptr| arena.contains(*ptr));
        assert!(!inside.is_empty());
        assert!(!outside.is_empty());

        for ptr in blocks {
            unsafe { spill.deallocate(ptr, layout) };
        }
        assert_eq!(arena.used(), 0);

        unsafe { arena.release(&HeapAllocator) };
    }

    #[test]
    fn test_without_an_arena_everything_goes_to_the_fallback() {
        let spill = Spill::new(None, &HeapAllocator);
        let ptr = spill.allocate(Layout::new::<u32>()).unwrap();
        unsafe { spill.deallocate(ptr, Layout::new::<u32>()) };
    }
}
