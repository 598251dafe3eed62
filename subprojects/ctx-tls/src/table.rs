//! # Entry tables
//!
//! A context's index from [`TlsKey`] to entry: a sorted array of
//! `(key, entry)` pairs, looked up by binary search.
//!
//! The array is allocated through the same allocator as the context's
//! entries, so an interrupt handler's index lives in its own arena and a
//! passive thread's index lives in its entry block until that fills up.
//! Nothing here ever reaches for the global heap.
//!
//! The table never frees its storage on its own. The owner hands the
//! allocator back in with [`EntryTable::release_storage`] once the table is
//! empty.

use core::{alloc::Layout, ptr::NonNull};

use ctx_tls_alloc::Allocator;

use crate::{
    entry::Entry,
    error::{Result, TlsError},
    key::TlsKey,
};

type Pair = (TlsKey, NonNull<Entry>);

/// Capacity of the first allocation.
const INITIAL_CAPACITY: usize = 4;

pub(crate) struct EntryTable {
    pairs: NonNull<Pair>,
    len: usize,
    capacity: usize,
}

impl EntryTable {
    pub(crate) const fn new() -> Self {
        Self {
            pairs: NonNull::dangling(),
            len: 0,
            capacity: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn as_slice(&self) -> &[Pair] {
        // SAFETY: the first `len` pairs are initialized; with no storage the
        // pointer is dangling and the slice empty.
        unsafe { core::slice::from_raw_parts(self.pairs.as_ptr(), self.len) }
    }

    pub(crate) fn get(&self, key: TlsKey) -> Option<NonNull<Entry>> {
        let slice = self.as_slice();
        slice
            .binary_search_by_key(&key, |(k, _)| *k)
            .ok()
            .map(|idx| slice[idx].1)
    }

    /// Adds `entry` under `key`, growing the array through `alloc`.
    ///
    /// # Errors
    ///
    /// [`TlsError::OutOfMemory`] if the array is full and `alloc` cannot
    /// provide a larger one. The table is unchanged.
    pub(crate) fn insert(&mut self, key: TlsKey, entry: NonNull<Entry>, alloc: &dyn Allocator) -> Result<()> {
        let idx = match self.as_slice().binary_search_by_key(&key, |(k, _)| *k) {
            Ok(idx) => {
                // SAFETY: `idx < len`.
                unsafe { self.pairs.add(idx).write((key, entry)) };
                return Ok(());
            }
            Err(idx) => idx,
        };

        if self.len == self.capacity {
            self.grow(alloc)?;
        }

        // SAFETY: `len < capacity`, so shifting the tail one slot up stays in
        // bounds.
        unsafe {
            let at = self.pairs.add(idx);
            core::ptr::copy(at.as_ptr(), at.add(1).as_ptr(), self.len - idx);
            at.write((key, entry));
        }
        self.len += 1;
        Ok(())
    }

    pub(crate) fn remove(&mut self, key: TlsKey) -> Option<NonNull<Entry>> {
        let idx = self.as_slice().binary_search_by_key(&key, |(k, _)| *k).ok()?;

        // SAFETY: `idx < len`; the tail moves down over the removed pair.
        let (_, entry) = unsafe {
            let at = self.pairs.add(idx);
            let pair = at.read();
            core::ptr::copy(at.add(1).as_ptr(), at.as_ptr(), self.len - idx - 1);
            pair
        };
        self.len -= 1;
        Some(entry)
    }

    /// Forgets every pair. The storage is kept.
    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    /// Returns the array to `alloc` and empties the table.
    ///
    /// # Safety
    ///
    /// `alloc` must be the allocator every [`insert`](Self::insert) was given.
    pub(crate) unsafe fn release_storage(&mut self, alloc: &dyn Allocator) {
        if self.capacity > 0 {
            // SAFETY: allocated by `grow` from `alloc` with this layout.
            unsafe { alloc.deallocate(self.pairs.cast(), Self::layout(self.capacity)) };
        }
        *self = Self::new();
    }

    fn grow(&mut self, alloc: &dyn Allocator) -> Result<()> {
        let capacity = match self.capacity {
            0 => INITIAL_CAPACITY,
            n => n.checked_mul(2).ok_or(TlsError::OutOfMemory)?,
        };
        let layout = Layout::array::<Pair>(capacity).map_err(|_| TlsError::OutOfMemory)?;
        let pairs = alloc.allocate(layout).ok_or(TlsError::OutOfMemory)?.cast::<Pair>();

        if self.capacity > 0 {
            // SAFETY: both arrays are valid for `len` pairs and distinct; the
            // old one came from `alloc` with its own layout.
            unsafe {
                core::ptr::copy_nonoverlapping(self.pairs.as_ptr(), pairs.as_ptr(), self.len);
                alloc.deallocate(self.pairs.cast(), Self::layout(self.capacity));
            }
        }

        self.pairs = pairs;
        self.capacity = capacity;
        Ok(())
    }

    fn layout(capacity: usize) -> Layout {
        // SAFETY: only called with capacities `grow` already built an array
        // layout for, so the size cannot overflow.
        unsafe { Layout::from_size_align_unchecked(size_of::<Pair>() * capacity, align_of::<Pair>()) }
    }
}
