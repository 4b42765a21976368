//! Owning wrappers around the runner: a pool collects loops, a group runs them, and a site is
//! the token of one run.

use std::{marker::PhantomData, sync::Arc};

use super::{
    alloc::{AllocError, Allocator, Heap},
    index::{Index, RangeSegment},
    runner::{OrderPolicy, WorkRunner},
    storage::{StoragePolicy, WorkStorage},
};
use crate::hal::{Event, ExecPolicy, Resource};

/// Bundles the execution, order and storage choices of a work pool.
pub trait WorkPolicy: Send + Sync + 'static {
    type Exec: ExecPolicy;
    type Order: OrderPolicy;
    type Storage: StoragePolicy;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Policy<E, O, S>(PhantomData<fn() -> (E, O, S)>);

impl<E: ExecPolicy, O: OrderPolicy, S: StoragePolicy> WorkPolicy for Policy<E, O, S> {
    type Exec = E;
    type Order = O;
    type Storage = S;
}

pub type ResourceOf<P> = <<P as WorkPolicy>::Exec as ExecPolicy>::Resource;
pub type StorageOf<P, A, Al> =
    <<P as WorkPolicy>::Storage as StoragePolicy>::Storage<ResourceOf<P>, Arc<A>, Al>;
type RunnerOf<P> = WorkRunner<<P as WorkPolicy>::Exec, <P as WorkPolicy>::Order>;

/// Collects loops over indices of type `I` whose bodies take runtime arguments `A`.
pub struct WorkPool<P: WorkPolicy, I, A: 'static = (), Al: Allocator = Heap> {
    storage: StorageOf<P, A, Al>,
    max_loops: usize,
    max_bytes: usize,
    phantom: PhantomData<fn(I)>,
}

impl<P, I, A, Al> Default for WorkPool<P, I, A, Al>
where
    P: WorkPolicy,
    I: Index,
    A: Send + Sync + 'static,
    Al: Allocator + Default,
{
    fn default() -> Self {
        Self::new(Al::default())
    }
}

impl<P, I, A, Al> std::fmt::Debug for WorkPool<P, I, A, Al>
where
    P: WorkPolicy,
    I: Index,
    A: Send + Sync + 'static,
    Al: Allocator,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkPool")
            .field("num_loops", &self.num_loops())
            .field("storage_bytes", &self.storage_bytes())
            .field("max_loops", &self.max_loops)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl<P, I, A, Al> WorkPool<P, I, A, Al>
where
    P: WorkPolicy,
    I: Index,
    A: Send + Sync + 'static,
    Al: Allocator,
{
    pub fn new(alloc: Al) -> Self {
        Self {
            storage: WorkStorage::new(alloc),
            max_loops: 0,
            max_bytes: 0,
            phantom: PhantomData,
        }
    }

    /// Adds a loop running `body` over `segment`. The body is stored inline in the record.
    ///
    /// The first loop after [`WorkPool::instantiate`] reserves room for as many loops and bytes
    /// as the largest instantiation seen so far.
    pub fn enqueue<F>(
        &mut self,
        segment: impl Into<RangeSegment<I>>,
        body: F,
    ) -> Result<(), AllocError>
    where
        F: Fn(I, &A) + Clone + Send + Sync + 'static,
    {
        if self.storage.is_empty() && self.max_loops > 0 {
            self.storage.reserve(self.max_loops, self.max_bytes)?;
        }
        RunnerOf::<P>::enqueue(&mut self.storage, segment.into(), body)
    }

    pub fn reserve(&mut self, num_loops: usize, storage_bytes: usize) -> Result<(), AllocError> {
        self.storage.reserve(num_loops, storage_bytes)
    }

    #[inline]
    pub fn num_loops(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn storage_bytes(&self) -> usize {
        self.storage.storage_size()
    }

    #[inline]
    pub fn storage(&self) -> &StorageOf<P, A, Al> {
        &self.storage
    }

    /// Moves every collected loop into a runnable group, leaving the pool empty.
    pub fn instantiate(&mut self) -> WorkGroup<P, I, A, Al> {
        self.max_loops = self.max_loops.max(self.storage.len());
        self.max_bytes = self.max_bytes.max(self.storage.storage_size());
        log::debug!(
            "instantiate work group: {} loops, {} bytes",
            self.storage.len(),
            self.storage.storage_size()
        );

        let alloc = self.storage.allocator().clone();
        let storage = std::mem::replace(&mut self.storage, WorkStorage::new(alloc));
        WorkGroup {
            storage,
            phantom: PhantomData,
        }
    }

    /// Destroys every collected loop. Reservation statistics are kept.
    pub fn clear(&mut self) {
        self.storage.clear();
    }
}

/// Loops ready to run, possibly many times.
pub struct WorkGroup<P: WorkPolicy, I, A: 'static = (), Al: Allocator = Heap> {
    storage: StorageOf<P, A, Al>,
    phantom: PhantomData<fn(I)>,
}

impl<P, I, A, Al> std::fmt::Debug for WorkGroup<P, I, A, Al>
where
    P: WorkPolicy,
    I: Index,
    A: Send + Sync + 'static,
    Al: Allocator,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGroup")
            .field("num_loops", &self.num_loops())
            .finish()
    }
}

impl<P, I, A, Al> WorkGroup<P, I, A, Al>
where
    P: WorkPolicy,
    I: Index,
    A: Send + Sync + 'static,
    Al: Allocator,
{
    /// Launches every loop on `resource` with `args`.
    pub fn run(&self, resource: &ResourceOf<P>, args: A) -> WorkSite {
        self.run_shared(resource, Arc::new(args))
    }

    /// Like [`WorkGroup::run`], with arguments already shared.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn run_shared(&self, resource: &ResourceOf<P>, args: Arc<A>) -> WorkSite {
        let event = RunnerOf::<P>::run(&self.storage, resource, &args);
        WorkSite { event }
    }

    /// Launches every loop on the default resource.
    pub fn run_default(&self, args: A) -> WorkSite {
        self.run(&<ResourceOf<P> as Resource>::get_default(), args)
    }

    #[inline]
    pub fn num_loops(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn storage_bytes(&self) -> usize {
        self.storage.storage_size()
    }

    pub fn clear(&mut self) {
        self.storage.clear();
    }
}

/// The token of one [`WorkGroup::run`].
#[derive(Debug, Default, Clone)]
pub struct WorkSite {
    event: Event,
}

impl WorkSite {
    #[inline]
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Blocks until the run has completed.
    #[inline]
    pub fn wait(&self) {
        self.event.wait()
    }

    /// Forgets the run without waiting for it.
    #[inline]
    pub fn clear(&mut self) {
        self.event = Event::ready();
    }
}
