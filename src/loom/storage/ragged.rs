use std::{marker::PhantomData, ptr::NonNull};

use super::{WorkStorage, relocate};
use crate::loom::{
    alloc::{AllocError, Allocator, Heap, arena_layout},
    buffer::Buffer,
    record::{RecordRef, WorkRecord},
    vtable::{Vtable, Work},
};

/// Packs records of any size back to back in one arena, indexed by an offset table.
///
/// When the arena fills up it is reallocated and every record is relocated; offsets stay valid
/// while addresses do not.
pub struct RaggedStorage<R: 'static, A: 'static, Al: Allocator = Heap> {
    offsets: Buffer<usize, Al>,
    arena: NonNull<u8>,
    /// Bytes in use.
    end: usize,
    /// Bytes allocated.
    cap: usize,
    relocations: usize,
    phantom: PhantomData<fn(&R, &A)>,
}

// SAFETY: records are `Send + Sync` payloads exclusively owned by the storage.
unsafe impl<R: 'static, A: 'static, Al: Allocator> Send for RaggedStorage<R, A, Al> {}
unsafe impl<R: 'static, A: 'static, Al: Allocator> Sync for RaggedStorage<R, A, Al> {}

impl<R: 'static, A: 'static, Al: Allocator + Default> Default for RaggedStorage<R, A, Al> {
    fn default() -> Self {
        Self::new(Al::default())
    }
}

impl<R: 'static, A: 'static, Al: Allocator> std::fmt::Debug for RaggedStorage<R, A, Al> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaggedStorage")
            .field("offsets", &self.offsets)
            .field("end", &self.end)
            .field("cap", &self.cap)
            .field("relocations", &self.relocations)
            .finish()
    }
}

impl<R: 'static, A: 'static, Al: Allocator> RaggedStorage<R, A, Al> {
    /// Number of arena reallocations that moved records.
    #[inline]
    pub fn relocations(&self) -> usize {
        self.relocations
    }

    #[inline]
    fn unused(&self) -> usize {
        self.cap - self.end
    }

    /// Reallocates the arena to `cap` bytes and relocates every record in offset order.
    fn grow(&mut self, cap: usize) -> Result<(), AllocError> {
        let layout = arena_layout(cap)?;
        let arena = self.allocator().allocate(layout)?;

        if !self.offsets.is_empty() {
            log::trace!(
                "ragged storage relocates {} records: {} -> {} bytes",
                self.offsets.len(),
                self.cap,
                cap
            );
            // SAFETY: offsets are increasing and address live records in the old arena; the
            // new arena is at least `end` bytes.
            unsafe {
                relocate::<R, A>(
                    arena,
                    self.arena,
                    self.offsets.iter().map(|&offset| (offset, offset)),
                )
            };
            self.relocations += 1;
        }

        self.release();
        self.arena = arena;
        self.cap = cap;
        Ok(())
    }

    /// Returns the arena to the allocator without touching its contents.
    fn release(&mut self) {
        if self.cap == 0 {
            return;
        }
        if let Ok(layout) = arena_layout(self.cap) {
            // SAFETY: the arena was allocated with exactly this layout.
            unsafe { self.allocator().deallocate(self.arena, layout) };
        }
        self.arena = NonNull::dangling();
        self.cap = 0;
    }
}

impl<R: 'static, A: 'static, Al: Allocator> WorkStorage<R, A> for RaggedStorage<R, A, Al> {
    type Allocator = Al;

    fn new(alloc: Al) -> Self {
        Self {
            offsets: Buffer::new(alloc),
            arena: NonNull::dangling(),
            end: 0,
            cap: 0,
            relocations: 0,
            phantom: PhantomData,
        }
    }

    #[inline]
    fn allocator(&self) -> &Al {
        self.offsets.allocator()
    }

    fn reserve(&mut self, num_loops: usize, bytes: usize) -> Result<(), AllocError> {
        self.offsets.reserve(num_loops)?;
        if bytes > self.cap {
            self.grow(bytes)?;
        }
        Ok(())
    }

    #[inline]
    fn len(&self) -> usize {
        self.offsets.len()
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
        if size > self.unused() {
            let cap = self
                .end
                .checked_add(size)
                .ok_or(AllocError::Layout(usize::MAX))?
                .max(self.cap.saturating_mul(2));
            self.grow(cap)?;
        }
        self.offsets.push(self.end)?;

        // SAFETY: `end` is a multiple of the record alignment and `size` bytes past it are free.
        unsafe {
            let dst = self.arena.add(self.end);
            WorkRecord::construct(dst, vtable, value);
        }
        self.end += size;
        Ok(())
    }

    fn iter(&self) -> impl DoubleEndedIterator<Item = RecordRef<'_, R, A>> + ExactSizeIterator {
        let arena = self.arena;
        // SAFETY: every offset addresses a live record inside the arena.
        self.offsets
            .iter()
            .map(move |&offset| unsafe { RecordRef::new(arena.add(offset).cast()) })
    }

    fn clear(&mut self) {
        while let Some(offset) = self.offsets.pop() {
            // SAFETY: the record is live and no longer indexed.
            unsafe { WorkRecord::<R, A>::destroy(self.arena.add(offset).cast()) };
        }
        self.offsets.clear();
        self.release();
        self.end = 0;
        self.relocations = 0;
    }
}

impl<R: 'static, A: 'static, Al: Allocator> Drop for RaggedStorage<R, A, Al> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use itertools::Itertools;

    use super::RaggedStorage;
    use crate::loom::{
        alloc::{Heap, Tracked},
        record::WorkRecord,
        storage::{
            WorkStorage,
            tests::{Log, Push, emplace_mixed},
        },
        vtable::Vtable,
    };

    #[test]
    fn test_packed_offsets() -> Result<(), Box<dyn std::error::Error>> {
        let token = Arc::new(AtomicUsize::new(0));
        let mut storage = RaggedStorage::<(), Log>::default();
        emplace_mixed(&mut storage, 0..6, &token)?;

        let sizes = [
            WorkRecord::<(), Log>::size_of::<Push<1>>(),
            WorkRecord::<(), Log>::size_of::<Push<40>>(),
            WorkRecord::<(), Log>::size_of::<Push<200>>(),
        ];
        assert_eq!(storage.storage_size(), 2 * sizes.iter().sum::<usize>());
        assert!(
            storage
                .iter()
                .map(|record| record.size())
                .eq(sizes.iter().copied().cycle().take(6))
        );
        Ok(())
    }

    #[test]
    fn test_relocation_preserves_captures() -> Result<(), Box<dyn std::error::Error>> {
        let alloc = Tracked::new(Heap);
        let token = Arc::new(AtomicUsize::new(0));
        let mut storage = RaggedStorage::<(), Log, _>::new(alloc.clone());

        let log = Log::default();
        let mut expected = vec![];
        for id in 0..64 {
            storage.emplace(Vtable::of::<Push<24>>(), Push::<24>::new(id, &token))?;
            storage.iter().for_each(|record| record.call(&(), &log));
            expected.extend(0..=id);
        }
        assert!(storage.relocations() > 0);
        assert_eq!(log.into_inner().unwrap(), expected);
        assert_eq!(Arc::strong_count(&token), 65);

        // only the offset table and the current arena remain
        assert_eq!(alloc.live(), 2);
        storage.clear();
        assert_eq!(storage.relocations(), 0);
        assert_eq!(alloc.live(), 0);
        assert_eq!(Arc::strong_count(&token), 1);
        assert_eq!(token.load(Ordering::Relaxed), (1..=64).sum::<usize>());
        Ok(())
    }

    #[test]
    fn test_reserve_no_relocation() -> Result<(), Box<dyn std::error::Error>> {
        let token = Arc::new(AtomicUsize::new(0));
        let mut storage = RaggedStorage::<(), Log>::default();
        let size = WorkRecord::<(), Log>::size_of::<Push<40>>();
        storage.reserve(32, 32 * size)?;

        for id in 0..32 {
            storage.emplace(Vtable::of::<Push<40>>(), Push::<40>::new(id, &token))?;
        }
        assert_eq!(storage.relocations(), 0);
        assert_eq!(storage.capacity(), 32 * size);
        assert_eq!(storage.storage_size(), storage.capacity());

        let log = Log::default();
        storage.iter().for_each(|record| record.call(&(), &log));
        assert_eq!(log.into_inner().unwrap(), (0..32).collect_vec());
        Ok(())
    }
}
