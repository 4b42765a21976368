use std::{marker::PhantomData, ptr::NonNull};

use super::{Relocations, WorkStorage, relocate};
use crate::loom::{
    alloc::{AllocError, Allocator, Heap, arena_layout},
    record::{RecordRef, WorkRecord},
    vtable::{Vtable, Work},
};

/// Lays records out at a constant stride in one arena.
///
/// The stride is the largest record size seen so far and never shrinks. Two events reallocate
/// the arena:
/// 1. a record larger than the stride arrives, and all records are re-laid at the new stride;
/// 2. the arena runs out of room at the current stride, and it doubles with the stride kept.
pub struct StrideStorage<R: 'static, A: 'static, Al: Allocator = Heap> {
    alloc: Al,
    arena: NonNull<u8>,
    /// Bytes in use; always a multiple of the stride.
    end: usize,
    /// Bytes allocated.
    cap: usize,
    stride: usize,
    relocations: Relocations,
    phantom: PhantomData<fn(&R, &A)>,
}

// SAFETY: records are `Send + Sync` payloads exclusively owned by the storage.
unsafe impl<R: 'static, A: 'static, Al: Allocator> Send for StrideStorage<R, A, Al> {}
unsafe impl<R: 'static, A: 'static, Al: Allocator> Sync for StrideStorage<R, A, Al> {}

impl<R: 'static, A: 'static, Al: Allocator + Default> Default for StrideStorage<R, A, Al> {
    fn default() -> Self {
        Self::new(Al::default())
    }
}

impl<R: 'static, A: 'static, Al: Allocator> std::fmt::Debug for StrideStorage<R, A, Al> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrideStorage")
            .field("len", &self.len())
            .field("end", &self.end)
            .field("cap", &self.cap)
            .field("stride", &self.stride)
            .field("relocations", &self.relocations)
            .finish()
    }
}

impl<R: 'static, A: 'static, Al: Allocator> StrideStorage<R, A, Al> {
    /// Bytes between consecutive records.
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn relocations(&self) -> Relocations {
        self.relocations
    }

    #[inline]
    fn unused(&self) -> usize {
        self.cap - self.end
    }

    /// Re-lays the arena as `cap` bytes at `stride`.
    ///
    /// Does nothing if neither grows. An empty arena that is already large enough only takes
    /// the new stride.
    fn array_reserve(&mut self, cap: usize, stride: usize) -> Result<(), AllocError> {
        debug_assert!(stride >= self.stride);
        let len = self.len();
        if cap <= self.cap && (stride == self.stride || len == 0) {
            self.stride = stride;
            return Ok(());
        }

        let cap = cap.max(self.cap);
        let layout = arena_layout(cap)?;
        let arena = self.alloc.allocate(layout)?;

        if len > 0 {
            log::trace!(
                "stride storage relocates {len} records: stride {} -> {stride}, {} -> {cap} bytes",
                self.stride,
                self.cap
            );
            let from = self.stride;
            // SAFETY: the first `len` slots of the old arena are live records; the new arena
            // holds `len` slots at the new stride, which is no smaller than any record.
            unsafe {
                relocate::<R, A>(
                    arena,
                    self.arena,
                    (0..len).map(|index| (index * from, index * stride)),
                )
            };
            if stride == self.stride {
                self.relocations.capacity += 1;
            } else {
                self.relocations.stride += 1;
            }
        }

        self.release();
        self.arena = arena;
        self.cap = cap;
        self.stride = stride;
        self.end = len * stride;
        Ok(())
    }

    /// Returns the arena to the allocator without touching its contents.
    fn release(&mut self) {
        if self.cap == 0 {
            return;
        }
        if let Ok(layout) = arena_layout(self.cap) {
            // SAFETY: the arena was allocated with exactly this layout.
            unsafe { self.alloc.deallocate(self.arena, layout) };
        }
        self.arena = NonNull::dangling();
        self.cap = 0;
    }
}

impl<R: 'static, A: 'static, Al: Allocator> WorkStorage<R, A> for StrideStorage<R, A, Al> {
    type Allocator = Al;

    fn new(alloc: Al) -> Self {
        Self {
            alloc,
            arena: NonNull::dangling(),
            end: 0,
            cap: 0,
            stride: 1,
            relocations: Default::default(),
            phantom: PhantomData,
        }
    }

    #[inline]
    fn allocator(&self) -> &Al {
        &self.alloc
    }

    fn reserve(&mut self, num_loops: usize, bytes: usize) -> Result<(), AllocError> {
        let cap = num_loops
            .checked_mul(self.stride)
            .ok_or(AllocError::Layout(usize::MAX))?
            .max(bytes);
        self.array_reserve(cap, self.stride)
    }

    #[inline]
    fn len(&self) -> usize {
        self.end / self.stride
    }

    #[inline]
    fn storage_size(&self) -> usize {
        self.end
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.cap
    }

    fn emplace<T: Work<R, A>>(
        &mut self,
        vtable: &'static Vtable<R, A>,
        value: T,
    ) -> Result<(), AllocError> {
        let size = WorkRecord::<R, A>::size_of::<T>();
        if size > self.stride {
            // every slot widens to `size`, the new one included
            let cap = (self.len() + 1)
                .checked_mul(size)
                .ok_or(AllocError::Layout(usize::MAX))?
                .max(self.cap);
            self.array_reserve(cap, size)?;
        } else if self.stride > self.unused() {
            // the record fits a slot but no slot is left
            let cap = (self.end + self.stride).max(self.cap.saturating_mul(2));
            self.array_reserve(cap, self.stride)?;
        }

        // SAFETY: `end` is a slot boundary and a whole stride past it is free.
        unsafe {
            let dst = self.arena.add(self.end);
            WorkRecord::construct(dst, vtable, value);
        }
        self.end += self.stride;
        Ok(())
    }

    fn iter(&self) -> impl DoubleEndedIterator<Item = RecordRef<'_, R, A>> + ExactSizeIterator {
        let arena = self.arena;
        let stride = self.stride;
        // SAFETY: the first `len` slots hold live records.
        (0..self.len()).map(move |index| unsafe { RecordRef::new(arena.add(index * stride).cast()) })
    }

    /// Destroys all records and releases memory, keeping the stride.
    fn clear(&mut self) {
        let len = self.len();
        self.end = 0;
        for index in (0..len).rev() {
            // SAFETY: slot `index` is live and no longer counted.
            unsafe { WorkRecord::<R, A>::destroy(self.arena.add(index * self.stride).cast()) };
        }
        self.release();
        self.relocations = Default::default();
    }
}

impl<R: 'static, A: 'static, Al: Allocator> Drop for StrideStorage<R, A, Al> {
    fn drop(&mut self) {
        self.clear();
    }
}
