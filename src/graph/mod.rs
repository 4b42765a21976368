//! Dependency graphs of work nodes.
//!
//! A [`Dag`] is built once from nodes and edges, then instantiated under a [`GraphPolicy`]
//! into a [`DagExec`] that can run it any number of times. Every run executes each node
//! exactly once, and never before all of its parents have completed.

use std::{
    collections::VecDeque,
    marker::PhantomData,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use derive_more::{Display, From, Into};
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hal::{Event, Resource};

pub use depend::{Access, DependScheduler, TaskDependGraph};
pub use exec::{SeqGraph, TaskAtomicGraph};
pub use node::{AsAny, Empty, Forall, Function, Node, WorkGroupNode, exec_on};

pub mod depend;
pub mod exec;
pub mod node;

/// User-chosen identifier of a node, stable for the lifetime of its graph.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("graph node error: node {0} already exists")]
    DuplicateNode(NodeId),
    #[error("graph node error: node {0} does not exist")]
    MissingNode(NodeId),
    #[error("graph edge error: node {0} cannot depend on itself")]
    SelfEdge(NodeId),
    #[error("graph cycle error: nodes {0:?} form or depend on a cycle")]
    Cycle(Vec<NodeId>),
    #[error("graph node error: node {0} is not of the requested type")]
    NodeType(NodeId),
}

type SharedNode<R> = Arc<Mutex<Box<dyn Node<R>>>>;

/// Nodes never hold invariants across a panic, so a poisoned lock is still usable.
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct NodeData<R: Resource> {
    id: NodeId,
    node: SharedNode<R>,
    parents: Vec<usize>,
    children: Vec<usize>,
}

/// A directed acyclic graph of nodes running on resource `R`.
pub struct Dag<R: Resource> {
    nodes: Vec<NodeData<R>>,
    index: HashMap<NodeId, usize>,
}

impl<R: Resource> Default for Dag<R> {
    fn default() -> Self {
        Self {
            nodes: vec![],
            index: HashMap::default(),
        }
    }
}

impl<R: Resource> std::fmt::Debug for Dag<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let edges = self
            .nodes
            .iter()
            .flat_map(|data| {
                data.children
                    .iter()
                    .map(move |&child| (data.id, self.nodes[child].id))
            })
            .collect_vec();
        f.debug_struct("Dag")
            .field("nodes", &self.nodes.iter().map(|data| data.id).collect_vec())
            .field("edges", &edges)
            .finish()
    }
}

impl<R: Resource> Dag<R> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    fn position(&self, id: NodeId) -> Result<usize, GraphError> {
        self.index
            .get(&id)
            .copied()
            .ok_or(GraphError::MissingNode(id))
    }

    pub fn add_node(&mut self, id: NodeId, node: impl Node<R>) -> Result<(), GraphError> {
        if self.index.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        let node: Box<dyn Node<R>> = Box::new(node);
        self.index.insert(id, self.nodes.len());
        self.nodes.push(NodeData {
            id,
            node: Arc::new(Mutex::new(node)),
            parents: vec![],
            children: vec![],
        });
        Ok(())
    }

    /// Makes `to` wait for `from`. Adding an existing edge again has no effect.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        let (x, y) = (self.position(from)?, self.position(to)?);
        if x == y {
            return Err(GraphError::SelfEdge(from));
        }
        if self.nodes[x].children.contains(&y) {
            log::warn!("duplicate graph edge {from} -> {to}");
            return Ok(());
        }
        self.nodes[x].children.push(y);
        self.nodes[y].parents.push(x);
        Ok(())
    }

    pub fn parents(&self, id: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let index = self.position(id)?;
        let ids = self.nodes[index].parents.iter().map(|&x| self.nodes[x].id);
        Ok(ids.collect())
    }

    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let index = self.position(id)?;
        let ids = self.nodes[index].children.iter().map(|&x| self.nodes[x].id);
        Ok(ids.collect())
    }

    /// Borrows node `id` as its concrete type `N`, e.g. to enqueue more loops into it.
    pub fn with_node<N, T>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut N) -> T,
    ) -> Result<T, GraphError>
    where
        N: Node<R>,
    {
        let index = self.position(id)?;
        let mut guard = lock(&self.nodes[index].node);
        let node: &mut dyn Node<R> = &mut **guard;
        match node.as_any_mut().downcast_mut::<N>() {
            Some(node) => Ok(f(node)),
            None => Err(GraphError::NodeType(id)),
        }
    }

    /// Node positions in a topological order, by Kahn's algorithm.
    fn topological_order(&self) -> Result<Vec<usize>, GraphError> {
        let mut degrees = self.nodes.iter().map(|data| data.parents.len()).collect_vec();
        let mut queue: VecDeque<usize> = degrees
            .iter()
            .positions(|&degree| degree == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(index) = queue.pop_front() {
            order.push(index);
            for &child in &self.nodes[index].children {
                degrees[child] -= 1;
                if degrees[child] == 0 {
                    queue.push_back(child);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = degrees
                .iter()
                .positions(|&degree| degree > 0)
                .map(|index| self.nodes[index].id)
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Freezes the current structure into an executable graph.
    ///
    /// Nodes are shared with the executable graph; adding nodes or edges afterwards does not
    /// affect it.
    pub fn instantiate<P: GraphPolicy>(&self) -> Result<DagExec<P, R>, GraphError> {
        let order = self.topological_order()?;
        let mut rank = vec![0; order.len()];
        for (position, &index) in order.iter().enumerate() {
            rank[index] = position;
        }

        let nodes = order.iter().map(|&index| self.nodes[index].node.clone()).collect();
        let ids = order.iter().map(|&index| self.nodes[index].id).collect();
        let remap = |edges: &[usize]| edges.iter().map(|&x| rank[x]).sorted().collect_vec();
        let parents = order
            .iter()
            .map(|&index| remap(&self.nodes[index].parents))
            .collect_vec();
        let children = order
            .iter()
            .map(|&index| remap(&self.nodes[index].children))
            .collect_vec();
        let counters = order.iter().map(|_| AtomicUsize::new(0)).collect();

        log::debug!(
            "instantiate graph: {} nodes, {} edges",
            order.len(),
            children.iter().map(Vec::len).sum::<usize>()
        );

        let schedule = Schedule {
            nodes,
            ids,
            parents,
            children,
            counters,
        };
        Ok(DagExec {
            schedule,
            phantom: PhantomData,
        })
    }

    /// Removes every node and edge.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
    }
}

/// The frozen, topologically ordered view of a graph that policies traverse.
///
/// Nodes are addressed by their position in the topological order, so parents always come
/// before their children.
pub struct Schedule<R: Resource> {
    nodes: Vec<SharedNode<R>>,
    ids: Vec<NodeId>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    counters: Vec<AtomicUsize>,
}

impl<R: Resource> Schedule<R> {
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn id(&self, index: usize) -> NodeId {
        self.ids[index]
    }

    #[inline]
    pub fn parents(&self, index: usize) -> &[usize] {
        &self.parents[index]
    }

    #[inline]
    pub fn children(&self, index: usize) -> &[usize] {
        &self.children[index]
    }

    /// Nodes without parents.
    pub fn roots(&self) -> impl Iterator<Item = usize> + '_ {
        self.parents.iter().positions(|parents| parents.is_empty())
    }

    /// Records that one parent of `index` has completed; roots have a single virtual parent.
    ///
    /// Returns `true` for exactly one caller per run: the one completing the last parent. The
    /// counter is then reset for the next run.
    pub fn trigger(&self, index: usize) -> bool {
        let threshold = self.parents[index].len().max(1);
        let count = self.counters[index].fetch_add(1, Ordering::AcqRel) + 1;
        if count == threshold {
            self.counters[index].store(0, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Executes node `index` on `resource`.
    pub fn run(&self, index: usize, resource: &R) -> Event {
        log::trace!("exec graph node {}", self.ids[index]);
        let mut node = lock(&self.nodes[index]);
        node.exec(resource)
    }

    fn reset(&self) {
        self.counters
            .iter()
            .for_each(|counter| counter.store(0, Ordering::Relaxed));
    }
}

/// A strategy for traversing a [`Schedule`].
pub trait GraphPolicy: Send + Sync + 'static {
    /// Runs every node once, parents before children. Returns after all nodes were launched.
    fn exec<R: Resource>(schedule: &Schedule<R>, resource: &R);
}

/// An instantiated graph.
pub struct DagExec<P: GraphPolicy, R: Resource> {
    schedule: Schedule<R>,
    phantom: PhantomData<fn() -> P>,
}

impl<P: GraphPolicy, R: Resource> std::fmt::Debug for DagExec<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagExec")
            .field("order", &self.schedule.ids)
            .finish()
    }
}

impl<P: GraphPolicy, R: Resource> DagExec<P, R> {
    #[inline]
    pub fn schedule(&self) -> &Schedule<R> {
        &self.schedule
    }

    /// Node ids in the topological order used by sequential traversal.
    #[inline]
    pub fn order(&self) -> &[NodeId] {
        &self.schedule.ids
    }

    /// Runs the graph on `resource`; the returned event completes with the last node.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn exec(&mut self, resource: &R) -> Event {
        self.schedule.reset();
        resource.wait();
        P::exec(&self.schedule, resource);
        resource.get_event()
    }

    pub fn exec_default(&mut self) -> Event {
        self.exec(&R::get_default())
    }
}
