use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use thiserror::Error;

/// Alignment every allocation made for work records must satisfy.
pub const MAX_ALIGN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("allocation layout error: {0} bytes is not a valid arena size")]
    Layout(usize),
    #[error("out of memory: failed to allocate {size} bytes aligned to {align}")]
    OutOfMemory { size: usize, align: usize },
}

/// Source of raw memory for buffers and storages.
///
/// An allocator travels with the container that owns the memory; cloning it must yield a
/// handle to the same underlying memory source.
pub trait Allocator: Clone + Send + Sync {
    /// Allocates memory fitting `layout`. Zero-sized layouts are never requested.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Releases memory previously returned by [`Allocator::allocate`].
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same `layout`.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Allocator backed by the global heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Heap;

impl Allocator for Heap {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert_ne!(layout.size(), 0);
        // SAFETY: the layout is not zero-sized.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(AllocError::OutOfMemory {
            size: layout.size(),
            align: layout.align(),
        })
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    live_bytes: AtomicUsize,
    limit: AtomicUsize,
}

/// Wraps another allocator and counts what flows through it.
///
/// Clones share the counters. An optional byte limit makes allocations fail once the live
/// byte count would exceed it.
#[derive(Debug, Clone)]
pub struct Tracked<A = Heap> {
    inner: A,
    counters: Arc<Counters>,
}

impl<A: Allocator> Tracked<A> {
    pub fn new(inner: A) -> Self {
        let counters = Arc::new(Counters {
            limit: AtomicUsize::new(usize::MAX),
            ..Default::default()
        });
        Self { inner, counters }
    }

    /// Fail any allocation that would push the live byte count above `limit`.
    pub fn with_limit(self, limit: usize) -> Self {
        self.counters.limit.store(limit, Ordering::Relaxed);
        self
    }

    #[inline]
    pub fn allocations(&self) -> usize {
        self.counters.allocations.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deallocations(&self) -> usize {
        self.counters.deallocations.load(Ordering::Relaxed)
    }

    /// Number of allocations not yet released.
    #[inline]
    pub fn live(&self) -> usize {
        self.allocations() - self.deallocations()
    }

    #[inline]
    pub fn live_bytes(&self) -> usize {
        self.counters.live_bytes.load(Ordering::Relaxed)
    }
}

impl<A: Allocator + Default> Default for Tracked<A> {
    fn default() -> Self {
        Self::new(A::default())
    }
}

impl<A: Allocator> Allocator for Tracked<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let limit = self.counters.limit.load(Ordering::Relaxed);
        if self.live_bytes().saturating_add(layout.size()) > limit {
            return Err(AllocError::OutOfMemory {
                size: layout.size(),
                align: layout.align(),
            });
        }
        let ptr = self.inner.allocate(layout)?;
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        self.counters
            .live_bytes
            .fetch_add(layout.size(), Ordering::Relaxed);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { self.inner.deallocate(ptr, layout) };
        self.counters.deallocations.fetch_add(1, Ordering::Relaxed);
        self.counters
            .live_bytes
            .fetch_sub(layout.size(), Ordering::Relaxed);
    }
}

/// Layout of a byte arena of `size` bytes holding work records.
#[inline]
pub(crate) fn arena_layout(size: usize) -> Result<Layout, AllocError> {
    Layout::from_size_align(size, MAX_ALIGN).map_err(|_| AllocError::Layout(size))
}
