use std::{marker::PhantomData, ptr::NonNull};

use super::WorkStorage;
use crate::loom::{
    alloc::{AllocError, Allocator, Heap, arena_layout},
    buffer::Buffer,
    record::{RecordRef, WorkRecord},
    vtable::{Vtable, Work},
};

/// Stores every record in its own allocation, sized exactly for its payload.
///
/// Growing only moves the pointer table, so records are never relocated.
pub struct PointerStorage<R: 'static, A: 'static, Al: Allocator = Heap> {
    records: Buffer<NonNull<WorkRecord<R, A>>, Al>,
    size: usize,
    phantom: PhantomData<fn(&R, &A)>,
}

// SAFETY: records are `Send + Sync` payloads exclusively owned by the storage.
unsafe impl<R: 'static, A: 'static, Al: Allocator> Send for PointerStorage<R, A, Al> {}
unsafe impl<R: 'static, A: 'static, Al: Allocator> Sync for PointerStorage<R, A, Al> {}

impl<R: 'static, A: 'static, Al: Allocator + Default> Default for PointerStorage<R, A, Al> {
    fn default() -> Self {
        Self::new(Al::default())
    }
}

impl<R: 'static, A: 'static, Al: Allocator> std::fmt::Debug for PointerStorage<R, A, Al> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointerStorage")
            .field("len", &self.records.len())
            .field("size", &self.size)
            .finish()
    }
}

impl<R: 'static, A: 'static, Al: Allocator> WorkStorage<R, A> for PointerStorage<R, A, Al> {
    type Allocator = Al;

    fn new(alloc: Al) -> Self {
        Self {
            records: Buffer::new(alloc),
            size: 0,
            phantom: PhantomData,
        }
    }

    #[inline]
    fn allocator(&self) -> &Al {
        self.records.allocator()
    }

    fn reserve(&mut self, num_loops: usize, _bytes: usize) -> Result<(), AllocError> {
        self.records.reserve(num_loops)
    }

    #[inline]
    fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    fn storage_size(&self) -> usize {
        self.size
    }

    /// Every byte allocated is occupied.
    #[inline]
    fn capacity(&self) -> usize {
        self.size
    }

    fn emplace<T: Work<R, A>>(
        &mut self,
        vtable: &'static Vtable<R, A>,
        value: T,
    ) -> Result<(), AllocError> {
        let size = WorkRecord::<R, A>::size_of::<T>();
        let layout = arena_layout(size)?;
        let ptr = self.allocator().allocate(layout)?;

        // SAFETY: the block is fresh, aligned and sized for `T`.
        let record = unsafe { WorkRecord::construct(ptr, vtable, value) };
        if let Err(err) = self.records.push(record) {
            // SAFETY: the record was never published.
            unsafe {
                WorkRecord::destroy(record);
                self.allocator().deallocate(ptr, layout);
            }
            return Err(err);
        }

        self.size += size;
        Ok(())
    }

    fn iter(&self) -> impl DoubleEndedIterator<Item = RecordRef<'_, R, A>> + ExactSizeIterator {
        // SAFETY: every stored pointer is a live record owned by `self`.
        self.records
            .iter()
            .map(|&record| unsafe { RecordRef::new(record) })
    }

    fn clear(&mut self) {
        while let Some(record) = self.records.pop() {
            // SAFETY: popped records are live and no longer reachable from the table.
            unsafe {
                let size = record.as_ref().size();
                WorkRecord::destroy(record);
                if let Ok(layout) = arena_layout(size) {
                    self.allocator().deallocate(record.cast(), layout);
                }
            }
        }
        self.records.clear();
        self.size = 0;
    }
}

impl<R: 'static, A: 'static, Al: Allocator> Drop for PointerStorage<R, A, Al> {
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

    use super::PointerStorage;
    use crate::loom::{
        alloc::{Heap, Tracked},
        storage::{
            WorkStorage,
            tests::{Log, emplace_mixed},
        },
    };

    #[test]
    fn test_addresses_stable() -> Result<(), Box<dyn std::error::Error>> {
        let alloc = Tracked::new(Heap);
        let token = Arc::new(AtomicUsize::new(0));
        let mut storage = PointerStorage::<(), Log, _>::new(alloc.clone());

        emplace_mixed(&mut storage, 0..4, &token)?;
        let before: Vec<_> = storage.iter().map(|record| record.as_ptr()).collect();
        emplace_mixed(&mut storage, 4..100, &token)?;
        let after: Vec<_> = storage.iter().take(4).map(|record| record.as_ptr()).collect();
        assert_eq!(before, after);

        // one block per record plus the pointer table
        assert_eq!(alloc.live(), 101);
        assert_eq!(
            storage.storage_size(),
            storage.iter().map(|record| record.size()).sum::<usize>()
        );

        let log = Log::default();
        storage.iter().rev().for_each(|record| record.call(&(), &log));
        assert!(log.into_inner().unwrap().into_iter().eq((0..100).rev()));
        assert_eq!(token.load(Ordering::Relaxed), 100);
        Ok(())
    }
}
