use std::ptr::NonNull;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    alloc::{AllocError, Allocator},
    record::{RecordRef, WorkRecord},
    vtable::{Vtable, Work},
};

pub use pointers::PointerStorage;
pub use ragged::RaggedStorage;
pub use strided::StrideStorage;

pub mod pointers;
pub mod ragged;
pub mod strided;

/// An owning collection of type-erased work records.
///
/// A storage is filled by a single writer and only read while running. Records are visited in
/// insertion order, and are destroyed before their memory is released.
pub trait WorkStorage<R: 'static, A: 'static>: Send + Sync + Sized {
    type Allocator: Allocator;

    fn new(alloc: Self::Allocator) -> Self;

    fn allocator(&self) -> &Self::Allocator;

    /// Prepares room for `num_loops` records spanning `bytes` bytes in total.
    fn reserve(&mut self, num_loops: usize, bytes: usize) -> Result<(), AllocError>;

    /// Number of live records.
    fn len(&self) -> usize;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently occupied by records.
    fn storage_size(&self) -> usize;

    /// Bytes the storage can hold before it must allocate again.
    fn capacity(&self) -> usize;

    /// Constructs a record holding `value` and appends it.
    fn emplace<T: Work<R, A>>(
        &mut self,
        vtable: &'static Vtable<R, A>,
        value: T,
    ) -> Result<(), AllocError>;

    /// Live records in insertion order.
    fn iter(&self) -> impl DoubleEndedIterator<Item = RecordRef<'_, R, A>> + ExactSizeIterator;

    /// Destroys all records and releases memory.
    fn clear(&mut self);
}

/// Selects a [`WorkStorage`] layout.
pub trait StoragePolicy: Send + Sync + 'static {
    type Storage<R: 'static, A: 'static, Al: Allocator>: WorkStorage<R, A, Allocator = Al>;
}

/// One heap block per record; record addresses never change.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArrayOfPointers;

/// One contiguous arena with an offset table; records are packed at their own sizes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RaggedArray;

/// One contiguous arena where every record occupies the largest record size seen.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConstantStride;

impl StoragePolicy for ArrayOfPointers {
    type Storage<R: 'static, A: 'static, Al: Allocator> = PointerStorage<R, A, Al>;
}

impl StoragePolicy for RaggedArray {
    type Storage<R: 'static, A: 'static, Al: Allocator> = RaggedStorage<R, A, Al>;
}

impl StoragePolicy for ConstantStride {
    type Storage<R: 'static, A: 'static, Al: Allocator> = StrideStorage<R, A, Al>;
}

/// Counts of relocation passes that actually moved records.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Relocations {
    /// Passes caused by running out of bytes at the current stride.
    pub capacity: usize,
    /// Passes caused by a record larger than the current stride.
    pub stride: usize,
}

/// Moves records from the arena at `src` into the arena at `dst`.
///
/// Each item of `moves` is a `(from, to)` pair of byte offsets; records are moved in the order
/// given. Afterwards every source record is dead.
///
/// # Safety
/// Every `from` must be the offset of a live record in `src`, every `to` must leave room for
/// that record inside `dst`, and the two arenas must not overlap.
pub(crate) unsafe fn relocate<R: 'static, A: 'static>(
    dst: NonNull<u8>,
    src: NonNull<u8>,
    moves: impl IntoIterator<Item = (usize, usize)>,
) {
    for (from, to) in moves {
        unsafe {
            let record = src.add(from).cast::<WorkRecord<R, A>>();
            WorkRecord::move_destroy(dst.add(to), record);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use itertools::Itertools;

    use super::{ArrayOfPointers, ConstantStride, RaggedArray, StoragePolicy, WorkStorage};
    use crate::loom::{
        alloc::{AllocError, Heap, Tracked},
        vtable::{Vtable, Work},
    };

    pub type Log = Mutex<Vec<usize>>;

    /// Appends its id to the log; `N` pads the payload to vary record sizes.
    pub struct Push<const N: usize> {
        pub id: usize,
        pub pad: [u8; N],
        pub token: Arc<AtomicUsize>,
    }

    impl<const N: usize> Push<N> {
        pub fn new(id: usize, token: &Arc<AtomicUsize>) -> Self {
            let pad = [id as u8; N];
            let token = token.clone();
            Self { id, pad, token }
        }
    }

    impl<const N: usize> Work<(), Log> for Push<N> {
        fn call(&self, _: &(), log: &Log) {
            assert!(self.pad.iter().all(|&x| x == self.id as u8));
            self.token.fetch_add(1, Ordering::Relaxed);
            log.lock().unwrap().push(self.id);
        }
    }

    pub fn emplace_mixed<S: WorkStorage<(), Log>>(
        storage: &mut S,
        ids: impl IntoIterator<Item = usize>,
        token: &Arc<AtomicUsize>,
    ) -> Result<(), AllocError> {
        for id in ids {
            match id % 3 {
                0 => storage.emplace(Vtable::of::<Push<1>>(), Push::<1>::new(id, token))?,
                1 => storage.emplace(Vtable::of::<Push<40>>(), Push::<40>::new(id, token))?,
                _ => storage.emplace(Vtable::of::<Push<200>>(), Push::<200>::new(id, token))?,
            }
        }
        Ok(())
    }

    fn run<S: WorkStorage<(), Log>>(storage: &S) -> Vec<usize> {
        let log = Log::default();
        storage.iter().for_each(|record| record.call(&(), &log));
        log.into_inner().unwrap()
    }

    fn check_storage<P: StoragePolicy>() -> Result<(), Box<dyn std::error::Error>> {
        let alloc = Tracked::new(Heap);
        let token = Arc::new(AtomicUsize::new(0));
        let mut storage: P::Storage<(), Log, Tracked> = WorkStorage::new(alloc.clone());

        emplace_mixed(&mut storage, 0..50, &token)?;
        assert_eq!(storage.len(), 50);
        assert!(storage.storage_size() <= storage.capacity());
        assert!(storage.iter().map(|record| record.size()).sum::<usize>() <= storage.storage_size());
        assert_eq!(run(&storage), (0..50).collect_vec());
        assert_eq!(storage.iter().rev().count(), 50);
        assert_eq!(Arc::strong_count(&token), 51);

        storage.clear();
        assert_eq!(storage.len(), 0);
        assert_eq!(storage.storage_size(), 0);
        assert_eq!(Arc::strong_count(&token), 1);
        assert_eq!(alloc.live(), 0);

        // behaves as if freshly constructed
        storage.clear();
        emplace_mixed(&mut storage, 0..7, &token)?;
        assert_eq!(run(&storage), (0..7).collect_vec());

        drop(storage);
        assert_eq!(Arc::strong_count(&token), 1);
        assert_eq!(alloc.live_bytes(), 0);
        assert_eq!(token.load(Ordering::Relaxed), 57);
        Ok(())
    }

    fn check_alloc_failure<P: StoragePolicy>() {
        let alloc = Tracked::new(Heap).with_limit(64);
        let token = Arc::new(AtomicUsize::new(0));
        let mut storage: P::Storage<(), Log, Tracked> = WorkStorage::new(alloc.clone());

        let result = storage.emplace(Vtable::of::<Push<200>>(), Push::<200>::new(2, &token));
        assert!(matches!(result, Err(AllocError::OutOfMemory { .. })));
        assert_eq!(storage.len(), 0);
        assert_eq!(Arc::strong_count(&token), 1);
        drop(storage);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn test_array_of_pointers() -> Result<(), Box<dyn std::error::Error>> {
        check_alloc_failure::<ArrayOfPointers>();
        check_storage::<ArrayOfPointers>()
    }

    #[test]
    fn test_ragged_array() -> Result<(), Box<dyn std::error::Error>> {
        check_alloc_failure::<RaggedArray>();
        check_storage::<RaggedArray>()
    }

    #[test]
    fn test_constant_stride() -> Result<(), Box<dyn std::error::Error>> {
        check_alloc_failure::<ConstantStride>();
        check_storage::<ConstantStride>()
    }

    /// Returns the allocations made by 16 emplaces after reserving for them.
    fn check_reserve<P: StoragePolicy>() -> Result<usize, Box<dyn std::error::Error>> {
        let alloc = Tracked::new(Heap);
        let token = Arc::new(AtomicUsize::new(0));
        let mut storage: P::Storage<(), Log, Tracked> = WorkStorage::new(alloc.clone());
        storage.reserve(16, 16 * 256)?;
        let allocations = alloc.allocations();

        for id in 0..16 {
            storage.emplace(Vtable::of::<Push<200>>(), Push::<200>::new(id, &token))?;
        }
        assert_eq!(run(&storage), (0..16).collect_vec());
        Ok(alloc.allocations() - allocations)
    }

    #[test]
    fn test_reserve_up_front() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(check_reserve::<ArrayOfPointers>()?, 16);
        assert_eq!(check_reserve::<RaggedArray>()?, 0);
        assert_eq!(check_reserve::<ConstantStride>()?, 0);
        Ok(())
    }
}
