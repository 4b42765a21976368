use std::{any::Any, marker::PhantomData, sync::Arc};

use crate::{
    hal::{Event, ExecPolicy, Host, Resource},
    loom::{
        alloc::{AllocError, Allocator, Heap},
        group::{ResourceOf, WorkGroup, WorkPolicy, WorkPool, WorkSite},
        index::{Index, RangeSegment},
    },
};

pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }

    #[inline]
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A unit of work scheduled by a graph running on resource `R`.
pub trait Node<R: Resource>: AsAny + Send {
    /// Runs the node once. Returns an event on `R` completing with the node.
    fn exec(&mut self, resource: &R) -> Event;
}

/// Runs `f` on `local`, synchronizing with `graph` at both ends when they are different queues.
pub fn exec_on<R, L>(graph: &R, local: &L, f: impl FnOnce(&L) -> Event) -> Event
where
    R: Resource,
    L: Resource,
{
    if graph.key() == local.key() {
        return f(local);
    }
    graph.wait();
    let event = f(local);
    graph.wait_for(&event);
    graph.get_event()
}

/// Does nothing; useful as a join point.
#[derive(Debug, Default, Clone, Copy)]
pub struct Empty;

impl<R: Resource> Node<R> for Empty {
    #[inline]
    fn exec(&mut self, _: &R) -> Event {
        Event::ready()
    }
}

/// Calls a host function.
pub struct Function<F>(pub F);

impl<F> Function<F>
where
    F: FnMut() + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<R, F> Node<R> for Function<F>
where
    R: Resource,
    F: FnMut() + Send + 'static,
{
    fn exec(&mut self, resource: &R) -> Event {
        exec_on(resource, &Host, |_| {
            (self.0)();
            Event::ready()
        })
    }
}

/// Runs one loop through `E` on its own resource.
pub struct Forall<E: ExecPolicy, I, F> {
    resource: E::Resource,
    segment: RangeSegment<I>,
    body: F,
    phantom: PhantomData<fn() -> E>,
}

impl<E, I, F> Forall<E, I, F>
where
    E: ExecPolicy,
    I: Index,
    F: Fn(I) + Clone + Send + Sync + 'static,
{
    /// A loop on the default resource of `E`.
    pub fn new(segment: impl Into<RangeSegment<I>>, body: F) -> Self {
        Self::with_resource(<E::Resource as Resource>::get_default(), segment, body)
    }

    pub fn with_resource(
        resource: E::Resource,
        segment: impl Into<RangeSegment<I>>,
        body: F,
    ) -> Self {
        Self {
            resource,
            segment: segment.into(),
            body,
            phantom: PhantomData,
        }
    }
}

impl<R, E, I, F> Node<R> for Forall<E, I, F>
where
    R: Resource,
    E: ExecPolicy,
    I: Index,
    F: Fn(I) + Clone + Send + Sync + 'static,
{
    fn exec(&mut self, resource: &R) -> Event {
        let segment = self.segment;
        exec_on(resource, &self.resource, |local| {
            E::forall(local, segment, self.body.clone())
        })
    }
}

/// A whole work pool as one node.
///
/// Loops enqueued between runs are instantiated lazily on the next run; otherwise the previous
/// group runs again with the current arguments.
pub struct WorkGroupNode<P: WorkPolicy, I, A: 'static = (), Al: Allocator = Heap> {
    resource: ResourceOf<P>,
    pool: WorkPool<P, I, A, Al>,
    group: WorkGroup<P, I, A, Al>,
    site: WorkSite,
    args: Arc<A>,
    instantiated: bool,
}

impl<P, I, A, Al> Default for WorkGroupNode<P, I, A, Al>
where
    P: WorkPolicy,
    I: Index,
    A: Default + Send + Sync + 'static,
    Al: Allocator + Default,
{
    fn default() -> Self {
        Self::new(Al::default())
    }
}

impl<P, I, A, Al> WorkGroupNode<P, I, A, Al>
where
    P: WorkPolicy,
    I: Index,
    A: Default + Send + Sync + 'static,
    Al: Allocator,
{
    pub fn new(alloc: Al) -> Self {
        let resource = <ResourceOf<P> as Resource>::get_default();
        let mut pool = WorkPool::new(alloc);
        let group = pool.instantiate();
        Self {
            resource,
            pool,
            group,
            site: WorkSite::default(),
            args: Default::default(),
            instantiated: true,
        }
    }

    /// Runs on `resource` instead of the default resource of the execution policy.
    pub fn with_resource(mut self, resource: ResourceOf<P>) -> Self {
        self.resource = resource;
        self
    }

    #[inline]
    pub fn num_loops(&self) -> usize {
        self.pool.num_loops()
    }

    #[inline]
    pub fn storage_bytes(&self) -> usize {
        self.pool.storage_bytes()
    }

    pub fn reserve(&mut self, num_loops: usize, storage_bytes: usize) -> Result<(), AllocError> {
        self.pool.reserve(num_loops, storage_bytes)
    }

    pub fn enqueue<F>(
        &mut self,
        segment: impl Into<RangeSegment<I>>,
        body: F,
    ) -> Result<(), AllocError>
    where
        F: Fn(I, &A) + Clone + Send + Sync + 'static,
    {
        self.instantiated = false;
        self.pool.enqueue(segment, body)
    }

    /// Turns pending loops into the group the node runs.
    pub fn instantiate(&mut self) {
        if !self.instantiated {
            self.instantiated = true;
            self.group = self.pool.instantiate();
        }
    }

    pub fn set_args(&mut self, args: A) {
        self.args = Arc::new(args);
    }

    /// Drops every loop and resets the arguments.
    pub fn clear(&mut self) {
        self.instantiated = true;
        self.site.clear();
        self.group.clear();
        self.pool.clear();
        self.args = Default::default();
    }

    /// The token of the latest run.
    #[inline]
    pub fn site(&self) -> &WorkSite {
        &self.site
    }
}

impl<R, P, I, A, Al> Node<R> for WorkGroupNode<P, I, A, Al>
where
    R: Resource,
    P: WorkPolicy,
    I: Index,
    A: Default + Send + Sync + 'static,
    Al: Allocator + 'static,
{
    fn exec(&mut self, resource: &R) -> Event {
        self.instantiate();
        let Self {
            resource: local,
            group,
            site,
            args,
            ..
        } = self;
        exec_on(resource, &*local, |local| {
            *site = group.run_shared(local, args.clone());
            site.event().clone()
        })
    }
}
