//! Execution backends.
//!
//! An [`ExecPolicy`] is the opaque loop launcher: given a [`Resource`], an index segment and a
//! body, it invokes the body once per index. Host policies run synchronously and return a
//! completed [`Event`]; [`StreamAsync`] queues the loop on a [`Stream`] and returns at once.

use std::ops::Deref;

use crate::loom::index::{Index, RangeSegment};

pub use resource::{Event, EventSignal, Host, Resource, ResourceError, ResourceKey, Stream, StreamId};

pub mod resource;

pub trait ExecPolicy: Send + Sync + 'static {
    type Resource: Resource;

    /// Invokes `body(index, &args)` once for every index of `segment` on `resource`.
    ///
    /// Synchronous policies only borrow `body` and `args`. Asynchronous policies clone both
    /// into the launch, which may outlive the call.
    fn forall_with<I, A, S, F>(
        resource: &Self::Resource,
        segment: RangeSegment<I>,
        body: &F,
        args: &S,
    ) -> Event
    where
        I: Index,
        A: ?Sized + Sync + 'static,
        S: Deref<Target = A> + Clone + Send + Sync + 'static,
        F: Fn(I, &A) + Clone + Send + Sync + 'static;

    /// Invokes `body` once for every index of `segment` on `resource`.
    fn forall<I, F>(resource: &Self::Resource, segment: RangeSegment<I>, body: F) -> Event
    where
        I: Index,
        F: Fn(I) + Clone + Send + Sync + 'static,
    {
        let body = move |index: I, _: &()| body(index);
        Self::forall_with(resource, segment, &body, &&())
    }
}

/// A plain loop on the calling thread.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Seq;

/// A loop on the calling thread, walked in groups of [`Simd::LANES`] indices.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Simd;

/// A multi-threaded loop. Falls back to [`Seq`] without the `rayon` feature.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Par;

/// A loop queued on a [`Stream`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamAsync;

impl Simd {
    pub const LANES: usize = 8;
}

impl ExecPolicy for Seq {
    type Resource = Host;

    fn forall_with<I, A, S, F>(_: &Host, segment: RangeSegment<I>, body: &F, args: &S) -> Event
    where
        I: Index,
        A: ?Sized + Sync + 'static,
        S: Deref<Target = A> + Clone + Send + Sync + 'static,
        F: Fn(I, &A) + Clone + Send + Sync + 'static,
    {
        let args: &A = args;
        segment.iter().for_each(|index| body(index, args));
        Event::ready()
    }
}

impl ExecPolicy for Simd {
    type Resource = Host;

    fn forall_with<I, A, S, F>(_: &Host, segment: RangeSegment<I>, body: &F, args: &S) -> Event
    where
        I: Index,
        A: ?Sized + Sync + 'static,
        S: Deref<Target = A> + Clone + Send + Sync + 'static,
        F: Fn(I, &A) + Clone + Send + Sync + 'static,
    {
        let args: &A = args;
        let len = segment.len();
        let body_len = len - len % Self::LANES;
        for base in (0..body_len).step_by(Self::LANES) {
            let lanes: [I; Simd::LANES] = std::array::from_fn(|lane| segment.at(base + lane));
            lanes.into_iter().for_each(|index| body(index, args));
        }
        (body_len..len).for_each(|n| body(segment.at(n), args));
        Event::ready()
    }
}

impl ExecPolicy for Par {
    type Resource = Host;

    fn forall_with<I, A, S, F>(_: &Host, segment: RangeSegment<I>, body: &F, args: &S) -> Event
    where
        I: Index,
        A: ?Sized + Sync + 'static,
        S: Deref<Target = A> + Clone + Send + Sync + 'static,
        F: Fn(I, &A) + Clone + Send + Sync + 'static,
    {
        let args: &A = args;
        par_forall(segment, &|index: I| body(index, args));
        Event::ready()
    }
}

impl ExecPolicy for StreamAsync {
    type Resource = Stream;

    fn forall_with<I, A, S, F>(stream: &Stream, segment: RangeSegment<I>, body: &F, args: &S) -> Event
    where
        I: Index,
        A: ?Sized + Sync + 'static,
        S: Deref<Target = A> + Clone + Send + Sync + 'static,
        F: Fn(I, &A) + Clone + Send + Sync + 'static,
    {
        // the launch outlives the caller's borrows
        let body = body.clone();
        let args = args.clone();
        stream.launch(move || {
            let args: &A = &args;
            par_forall(segment, &|index: I| body(index, args))
        });
        stream.get_event()
    }
}

fn par_forall<I: Index>(segment: RangeSegment<I>, body: &(impl Fn(I) + Sync)) {
    #[cfg(not(feature = "rayon"))]
    {
        segment.iter().for_each(body);
    }
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;

        (0..segment.len())
            .into_par_iter()
            .for_each(|n| body(segment.at(n)));
    }
}
