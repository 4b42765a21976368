use std::{marker::PhantomData, sync::Arc};

use super::{
    alloc::AllocError,
    index::{Index, RangeSegment},
    storage::WorkStorage,
    vtable::{Vtable, Work},
};
use crate::hal::{Event, ExecPolicy, Resource};

/// The order in which a runner visits stored loops.
pub trait OrderPolicy: Send + Sync + 'static {
    const REVERSE: bool;
}

/// Loops run in insertion order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ordered;

/// Loops run in exact reverse insertion order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reverse;

impl OrderPolicy for Ordered {
    const REVERSE: bool = false;
}

impl OrderPolicy for Reverse {
    const REVERSE: bool = true;
}

/// One stored loop: a segment and a body, launched through `E` when called.
///
/// The body lives inline in the record, so a record is as large as the closure it holds.
pub struct HoldForall<E, I, F> {
    segment: RangeSegment<I>,
    body: F,
    phantom: PhantomData<fn() -> E>,
}

impl<E, I, F> HoldForall<E, I, F> {
    pub fn new(segment: RangeSegment<I>, body: F) -> Self {
        Self {
            segment,
            body,
            phantom: PhantomData,
        }
    }
}

impl<E, I, A, F> Work<E::Resource, Arc<A>> for HoldForall<E, I, F>
where
    E: ExecPolicy,
    I: Index,
    A: Send + Sync + 'static,
    F: Fn(I, &A) + Clone + Send + Sync + 'static,
{
    fn call(&self, resource: &E::Resource, args: &Arc<A>) {
        E::forall_with(resource, self.segment, &self.body, args);
    }
}

/// Binds an execution policy and an order policy; operates on a storage it does not own.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkRunner<E, O>(PhantomData<fn() -> (E, O)>);

impl<E: ExecPolicy, O: OrderPolicy> WorkRunner<E, O> {
    /// Wraps `(segment, body)` into a record of `storage`.
    pub fn enqueue<S, I, A, F>(
        storage: &mut S,
        segment: RangeSegment<I>,
        body: F,
    ) -> Result<(), AllocError>
    where
        S: WorkStorage<E::Resource, Arc<A>>,
        I: Index,
        A: Send + Sync + 'static,
        F: Fn(I, &A) + Clone + Send + Sync + 'static,
    {
        let vtable = Vtable::<E::Resource, Arc<A>>::of::<HoldForall<E, I, F>>();
        storage.emplace(vtable, HoldForall::<E, I, F>::new(segment, body))
    }

    /// Launches every stored loop on `resource` and returns the event of the last one.
    ///
    /// Loops never overlap each other on an in-order resource; parallelism, if any, is within
    /// a single loop.
    pub fn run<S, A>(storage: &S, resource: &E::Resource, args: &Arc<A>) -> Event
    where
        S: WorkStorage<E::Resource, Arc<A>>,
        A: 'static,
    {
        if O::REVERSE {
            storage.iter().rev().for_each(|record| record.call(resource, args));
        } else {
            storage.iter().for_each(|record| record.call(resource, args));
        }
        resource.get_event()
    }
}
