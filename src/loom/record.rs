use std::{marker::PhantomData, ptr::NonNull};

use super::{
    alloc::MAX_ALIGN,
    vtable::{CallFn, Vtable, Work},
};

/// Offset of the payload from the start of every record.
pub const HEADER_SIZE: usize = MAX_ALIGN;

/// Header of a type-erased work record.
///
/// In memory a record is this header followed, at [`HEADER_SIZE`], by the concrete payload.
/// The payload offset does not depend on the payload type, so any record can be addressed
/// through a pointer to the header alone. Records are only ever created in place inside
/// storage-owned memory and are moved with [`WorkRecord::move_destroy`].
#[repr(C, align(16))]
pub struct WorkRecord<R: 'static, A: 'static> {
    vtable: &'static Vtable<R, A>,
    /// Copy of `vtable.call`, saving one indirection per call.
    call: CallFn<R, A>,
}

impl<R: 'static, A: 'static> WorkRecord<R, A> {
    /// Bytes occupied by a record whose payload is `payload` bytes.
    #[inline]
    pub const fn size_for(payload: usize) -> usize {
        HEADER_SIZE + payload.next_multiple_of(MAX_ALIGN)
    }

    /// Bytes occupied by a record holding a `T`.
    #[inline]
    pub const fn size_of<T: Work<R, A>>() -> usize {
        Self::size_for(size_of::<T>())
    }

    /// Constructs a record holding `value` at `dst` and returns it.
    ///
    /// # Safety
    /// `dst` must be aligned to [`MAX_ALIGN`], valid for writes of
    /// [`WorkRecord::size_of::<T>()`](WorkRecord::size_of) bytes, and `vtable` must be the
    /// table of `T`.
    pub unsafe fn construct<T: Work<R, A>>(
        dst: NonNull<u8>,
        vtable: &'static Vtable<R, A>,
        value: T,
    ) -> NonNull<Self> {
        const {
            assert!(
                size_of::<WorkRecord<R, A>>() == HEADER_SIZE,
                "record header must span exactly the payload offset"
            );
            assert!(
                align_of::<T>() <= MAX_ALIGN,
                "work payload must not be aligned stricter than the record"
            );
        }
        debug_assert_eq!(vtable.size, size_of::<T>());

        let record = dst.cast::<Self>();
        let call = vtable.call;
        unsafe {
            record.write(Self { vtable, call });
            dst.add(HEADER_SIZE).cast::<T>().write(value);
        }
        record
    }

    /// Relocates the record at `src` into `dst` and returns the new record.
    ///
    /// The payload is moved through its vtable; afterwards the source bytes are dead and must
    /// be neither called nor destroyed.
    ///
    /// # Safety
    /// `src` must be a live record, and `dst` must be aligned to [`MAX_ALIGN`], valid for
    /// writes of the record's size and not overlap `src`.
    pub unsafe fn move_destroy(dst: NonNull<u8>, src: NonNull<Self>) -> NonNull<Self> {
        unsafe {
            let Self { vtable, call } = src.read();
            let record = dst.cast::<Self>();
            record.write(Self { vtable, call });
            (vtable.move_construct)(
                dst.add(HEADER_SIZE).as_ptr(),
                src.cast::<u8>().add(HEADER_SIZE).as_ptr(),
            );
            record
        }
    }

    /// Drops the payload of the record at `record`.
    ///
    /// # Safety
    /// `record` must be live and is dead afterwards.
    pub unsafe fn destroy(record: NonNull<Self>) {
        unsafe {
            let vtable = record.as_ref().vtable;
            (vtable.destroy)(record.cast::<u8>().add(HEADER_SIZE).as_ptr());
        }
    }

    /// Invokes the payload of the record at `record`.
    ///
    /// # Safety
    /// `record` must be live, and its pointer must carry provenance over the whole record.
    #[inline]
    pub unsafe fn call(record: NonNull<Self>, resource: &R, args: &A) {
        unsafe {
            let call = record.as_ref().call;
            call(record.cast::<u8>().add(HEADER_SIZE).as_ptr(), resource, args)
        }
    }

    #[inline]
    pub fn vtable(&self) -> &'static Vtable<R, A> {
        self.vtable
    }

    /// Bytes this record occupies, header included.
    #[inline]
    pub fn size(&self) -> usize {
        Self::size_for(self.vtable.size)
    }
}

/// A shared view of a live record inside some storage.
pub struct RecordRef<'a, R: 'static, A: 'static> {
    ptr: NonNull<WorkRecord<R, A>>,
    phantom: PhantomData<&'a WorkRecord<R, A>>,
}

impl<R: 'static, A: 'static> Clone for RecordRef<'_, R, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: 'static, A: 'static> Copy for RecordRef<'_, R, A> {}

impl<'a, R: 'static, A: 'static> RecordRef<'a, R, A> {
    /// # Safety
    /// `ptr` must point to a live record that outlives `'a` and is not mutated meanwhile.
    #[inline]
    pub(crate) unsafe fn new(ptr: NonNull<WorkRecord<R, A>>) -> Self {
        let phantom = PhantomData;
        Self { ptr, phantom }
    }

    #[inline]
    pub fn call(&self, resource: &R, args: &A) {
        // SAFETY: guaranteed live by construction.
        unsafe { WorkRecord::call(self.ptr, resource, args) }
    }

    #[inline]
    pub fn size(&self) -> usize {
        // SAFETY: guaranteed live by construction.
        unsafe { self.ptr.as_ref().size() }
    }

    #[inline]
    pub fn payload_size(&self) -> usize {
        unsafe { self.ptr.as_ref().vtable().size }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const WorkRecord<R, A> {
        self.ptr.as_ptr()
    }
}
