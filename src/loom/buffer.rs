use std::{alloc::Layout, marker::PhantomData, ptr::NonNull};

use super::alloc::{AllocError, Allocator, Heap};

/// A minimal growable array over an explicit [`Allocator`].
///
/// The buffer is move-only: it never clones its elements, and relocating them on growth is a
/// plain bitwise move. Dropping the buffer drops every live element before releasing memory.
pub struct Buffer<T, A: Allocator = Heap> {
    alloc: A,
    ptr: NonNull<T>,
    len: usize,
    cap: usize,
    phantom: PhantomData<T>,
}

// SAFETY: the buffer uniquely owns its elements, like `Vec<T>`.
unsafe impl<T: Send, A: Allocator> Send for Buffer<T, A> {}
unsafe impl<T: Sync, A: Allocator> Sync for Buffer<T, A> {}

impl<T, A: Allocator + Default> Default for Buffer<T, A> {
    fn default() -> Self {
        Self::new(A::default())
    }
}

impl<T: std::fmt::Debug, A: Allocator> std::fmt::Debug for Buffer<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T, A: Allocator> Buffer<T, A> {
    const IS_ZST: bool = size_of::<T>() == 0;

    pub fn new(alloc: A) -> Self {
        let cap = if Self::IS_ZST { usize::MAX } else { 0 };
        Self {
            alloc,
            ptr: NonNull::dangling(),
            len: 0,
            cap,
            phantom: PhantomData,
        }
    }

    #[inline]
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` slots are initialized.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: the first `len` slots are initialized and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Grows the capacity to at least `count` elements, relocating existing elements.
    /// Does nothing if the capacity already suffices.
    pub fn reserve(&mut self, count: usize) -> Result<(), AllocError> {
        if count <= self.cap {
            return Ok(());
        }
        let layout = Self::layout(count)?;
        let ptr = self.alloc.allocate(layout)?.cast::<T>();

        // SAFETY: the new block holds at least `len` elements and does not overlap the old.
        // The old slots are left logically uninitialized and are never dropped.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), ptr.as_ptr(), self.len) };
        self.release();

        self.ptr = ptr;
        self.cap = count;
        Ok(())
    }

    /// Appends an element, doubling the capacity when full.
    pub fn push(&mut self, value: T) -> Result<(), AllocError> {
        if self.len == self.cap {
            let count = match self.cap {
                0 => 1,
                _ => self.len.saturating_mul(2),
            };
            self.reserve(count)?;
        }
        // SAFETY: `len < cap` after the reservation.
        unsafe { self.ptr.as_ptr().add(self.len).write(value) };
        self.len += 1;
        Ok(())
    }

    /// Moves the last element out of the buffer.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // SAFETY: slot `len` was initialized and is now outside the live range.
        Some(unsafe { self.ptr.as_ptr().add(self.len).read() })
    }

    /// Drops every element and releases the memory.
    pub fn clear(&mut self) {
        let len = std::mem::replace(&mut self.len, 0);
        // SAFETY: the first `len` slots were initialized; `len` is already reset so a
        // panicking destructor cannot cause a double drop.
        unsafe {
            std::ptr::drop_in_place(std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), len))
        };
        self.release();
        self.ptr = NonNull::dangling();
        if !Self::IS_ZST {
            self.cap = 0;
        }
    }

    fn layout(count: usize) -> Result<Layout, AllocError> {
        Layout::array::<T>(count).map_err(|_| AllocError::Layout(count.saturating_mul(size_of::<T>())))
    }

    /// Returns the current block to the allocator without touching its contents.
    fn release(&mut self) {
        if Self::IS_ZST || self.cap == 0 {
            return;
        }
        if let Ok(layout) = Self::layout(self.cap) {
            // SAFETY: the block was allocated with exactly this layout.
            unsafe { self.alloc.deallocate(self.ptr.cast(), layout) };
        }
    }
}

impl<T, A: Allocator> std::ops::Deref for Buffer<T, A> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl<T, A: Allocator> std::ops::DerefMut for Buffer<T, A> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl<T, A: Allocator> Drop for Buffer<T, A> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::Buffer;
    use crate::loom::alloc::{Heap, Tracked};

    #[test]
    fn test_push_pop() -> Result<(), Box<dyn std::error::Error>> {
        let mut buffer = Buffer::new(Heap);
        for x in 0..100 {
            buffer.push(x)?;
        }
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.capacity(), 128);
        assert!(buffer.iter().copied().eq(0..100));

        assert_eq!(buffer.pop(), Some(99));
        assert_eq!(buffer.pop(), Some(98));
        assert_eq!(buffer.len(), 98);
        Ok(())
    }

    #[test]
    fn test_reserve_only_grows() -> Result<(), Box<dyn std::error::Error>> {
        let alloc = Tracked::new(Heap);
        let mut buffer = Buffer::<u64, _>::new(alloc.clone());
        buffer.reserve(10)?;
        buffer.reserve(4)?;
        assert_eq!(buffer.capacity(), 10);
        assert_eq!(alloc.allocations(), 1);

        buffer.extend_from(0..10)?;
        buffer.reserve(32)?;
        assert_eq!(alloc.live(), 1);
        assert!(buffer.iter().copied().eq(0..10));
        Ok(())
    }

    #[test]
    fn test_drop_releases() -> Result<(), Box<dyn std::error::Error>> {
        let alloc = Tracked::new(Heap);
        let token = Arc::new(());
        {
            let mut buffer = Buffer::new(alloc.clone());
            for _ in 0..17 {
                buffer.push(token.clone())?;
            }
            let last = buffer.pop();
            assert_eq!(Arc::strong_count(&token), 18);
            drop(last);
            assert_eq!(Arc::strong_count(&token), 17);
        }
        assert_eq!(Arc::strong_count(&token), 1);
        assert_eq!(alloc.live(), 0);
        assert_eq!(alloc.live_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_move_leaves_source_empty() -> Result<(), Box<dyn std::error::Error>> {
        let mut buffer = Buffer::<String, Heap>::default();
        buffer.push("a".into())?;
        buffer.push("b".into())?;

        let moved = std::mem::take(&mut buffer);
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 0);
        assert_eq!(moved.as_slice(), ["a", "b"]);
        Ok(())
    }

    #[test]
    fn test_zero_sized() -> Result<(), Box<dyn std::error::Error>> {
        let alloc = Tracked::new(Heap);
        let mut buffer = Buffer::new(alloc.clone());
        for _ in 0..1000 {
            buffer.push(())?;
        }
        assert_eq!(buffer.len(), 1000);
        assert_eq!(alloc.allocations(), 0);
        Ok(())
    }

    impl<T, A: crate::loom::alloc::Allocator> Buffer<T, A> {
        fn extend_from(
            &mut self,
            iter: impl IntoIterator<Item = T>,
        ) -> Result<(), crate::loom::alloc::AllocError> {
            iter.into_iter().try_for_each(|x| self.push(x))
        }
    }
}
