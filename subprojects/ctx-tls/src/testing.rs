//! Test doubles for the host platform and allocators.

use core::{
    alloc::{GlobalAlloc, Layout},
    cell::Cell,
    ptr::NonNull,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use ctx_tls_alloc::{Allocator, HeapAllocator};

use crate::{classify::Platform, entry::Value};

/// A distinct non-null payload.
pub(crate) fn value(n: usize) -> Value {
    core::ptr::without_provenance_mut(n)
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static HEAP_TRACKED: Cell<bool> = const { Cell::new(false) };
    static HEAP_ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
    static PROCESSOR: Cell<usize> = const { Cell::new(0) };
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Platform whose interrupt flag and processor number are set per test
/// thread.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TestPlatform;

impl TestPlatform {
    /// Runs `f` with the calling thread flagged as interrupt context.
    pub(crate) fn interrupt<R>(f: impl FnOnce() -> R) -> R {
        let outer = IN_INTERRUPT.replace(true);
        let result = f();
        IN_INTERRUPT.set(outer);
        result
    }

    pub(crate) fn set_processor(cpu: usize) {
        PROCESSOR.set(cpu);
    }
}

impl Platform for TestPlatform {
    fn in_interrupt(&self) -> bool {
        IN_INTERRUPT.get()
    }

    fn current_thread_id(&self) -> u64 {
        THREAD_ID.with(|id| *id)
    }

    fn current_processor(&self) -> usize {
        PROCESSOR.get()
    }
}

/// Heap allocator that counts live blocks and can run out on demand.
#[derive(Debug)]
pub(crate) struct CountingAllocator {
    live: AtomicUsize,
    budget: AtomicUsize,
}

impl CountingAllocator {
    pub(crate) const fn new() -> Self {
        Self::failing_after(usize::MAX)
    }

    /// Serves `successes` allocations, then fails every further one.
    pub(crate) const fn failing_after(successes: usize) -> Self {
        Self {
            live: AtomicUsize::new(0),
            budget: AtomicUsize::new(successes),
        }
    }

    /// Blocks allocated and not yet freed.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

unsafe impl Allocator for CountingAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()?;
        let ptr = HeapAllocator.allocate(layout)?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        unsafe { HeapAllocator.deallocate(ptr, layout) }
    }
}

/// The system heap, counting the allocations of threads inside
/// [`heap_allocations`].
struct TrackingHeap;

unsafe impl GlobalAlloc for TrackingHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // `try_with`: allocations also happen while thread locals are torn
        // down.
        if HEAP_TRACKED.try_with(Cell::get).unwrap_or(false) {
            let _ = HEAP_ALLOCATIONS.try_with(|n| n.set(n.get() + 1));
        }
        unsafe { std::alloc::System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { std::alloc::System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static HEAP: TrackingHeap = TrackingHeap;

/// Runs `f` and counts the global-heap allocations it makes on this thread.
pub(crate) fn heap_allocations<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let before = HEAP_ALLOCATIONS.get();
    HEAP_TRACKED.set(true);
    let result = f();
    HEAP_TRACKED.set(false);
    (result, HEAP_ALLOCATIONS.get() - before)
}
