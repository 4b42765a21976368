use std::marker::PhantomData;

/// A unit of deferred work callable with an execution resource and runtime arguments.
///
/// Types implementing this are stored type-erased inside work storages and must therefore
/// own everything they capture.
pub trait Work<R, A>: Send + Sync + 'static {
    fn call(&self, resource: &R, args: &A);
}

/// Relocates a payload from `src` into the uninitialized `dst`.
pub type MoveFn = unsafe fn(dst: *mut u8, src: *mut u8);
/// Invokes the payload at `obj`.
pub type CallFn<R, A> = unsafe fn(obj: *const u8, resource: &R, args: &A);
/// Drops the payload at `obj` in place.
pub type DestroyFn = unsafe fn(obj: *mut u8);

/// Hand-built dispatch table for one concrete [`Work`] type.
///
/// One table exists per `(T, R, A)` and lives for the whole program; records only borrow it.
pub struct Vtable<R, A> {
    pub move_construct: MoveFn,
    pub call: CallFn<R, A>,
    pub destroy: DestroyFn,
    /// Size in bytes of the concrete payload.
    pub size: usize,
}

impl<R, A> std::fmt::Debug for Vtable<R, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vtable")
            .field("move_construct", &(self.move_construct as *const ()))
            .field("call", &(self.call as *const ()))
            .field("destroy", &(self.destroy as *const ()))
            .field("size", &self.size)
            .finish()
    }
}

impl<R: 'static, A: 'static> Vtable<R, A> {
    /// Returns the static table of `T`.
    #[inline]
    pub fn of<T: Work<R, A>>() -> &'static Self {
        Table::<T, R, A>::VTABLE
    }
}

struct Table<T, R, A>(PhantomData<fn() -> (T, R, A)>);

impl<T: Work<R, A>, R: 'static, A: 'static> Table<T, R, A> {
    const VTABLE: &'static Vtable<R, A> = &Vtable {
        move_construct: move_construct::<T>,
        call: call::<T, R, A>,
        destroy: destroy::<T>,
        size: size_of::<T>(),
    };
}

unsafe fn move_construct<T>(dst: *mut u8, src: *mut u8) {
    // SAFETY: the caller guarantees both point to suitably aligned slots for `T`, `src`
    // being initialized and `dst` not. After this `src` is logically uninitialized.
    unsafe { dst.cast::<T>().write(src.cast::<T>().read()) }
}

unsafe fn call<T: Work<R, A>, R, A>(obj: *const u8, resource: &R, args: &A) {
    // SAFETY: the caller guarantees `obj` points to a live `T`.
    let obj = unsafe { &*obj.cast::<T>() };
    obj.call(resource, args)
}

unsafe fn destroy<T>(obj: *mut u8) {
    // SAFETY: the caller guarantees `obj` points to a live `T` that is never used again.
    unsafe { obj.cast::<T>().drop_in_place() }
}

#[cfg(test)]
mod tests {
    use std::{
        mem::MaybeUninit,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::{Vtable, Work};

    struct Add(Arc<AtomicUsize>, usize);

    impl Work<(), usize> for Add {
        fn call(&self, _: &(), args: &usize) {
            self.0.fetch_add(self.1 * args, Ordering::Relaxed);
        }
    }

    struct Noop;

    impl Work<(), usize> for Noop {
        fn call(&self, _: &(), _: &usize) {}
    }

    #[test]
    fn test_vtable_sizes() {
        let x = Vtable::<(), usize>::of::<Add>();
        let z = Vtable::<(), usize>::of::<Noop>();
        assert_eq!(x.size, size_of::<Add>());
        assert_eq!(z.size, 0);
    }

    #[test]
    fn test_vtable_roundtrip() {
        let vtable = Vtable::<(), usize>::of::<Add>();
        let counter = Arc::new(AtomicUsize::new(0));

        let mut src = MaybeUninit::new(Add(counter.clone(), 3));
        let mut dst = MaybeUninit::<Add>::uninit();
        unsafe {
            (vtable.call)(src.as_ptr().cast(), &(), &2);
            (vtable.move_construct)(dst.as_mut_ptr().cast(), src.as_mut_ptr().cast());
            (vtable.call)(dst.as_ptr().cast(), &(), &5);
            assert_eq!(Arc::strong_count(&counter), 2);
            (vtable.destroy)(dst.as_mut_ptr().cast());
        }
        assert_eq!(counter.load(Ordering::Relaxed), 21);
        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
