use std::hash::Hash;
#[cfg(feature = "rayon")]
use std::sync::atomic::{AtomicUsize, Ordering};

use derive_more::Display;
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{GraphPolicy, Schedule};
use crate::hal::Resource;

/// How a task touches one of its dependency keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Access {
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

impl Access {
    #[inline]
    pub fn reads(self) -> bool {
        matches!(self, Access::ReadOnly | Access::ReadWrite)
    }

    #[inline]
    pub fn writes(self) -> bool {
        matches!(self, Access::ReadWrite | Access::WriteOnly)
    }
}

/// Orders tasks by the keys they declare, in submission order.
///
/// A task waits for the last earlier writer of each key it touches; a writing task also waits
/// for every reader since that writer. Dependencies always point to earlier tasks, so
/// submission order is one valid execution order.
#[derive(Debug)]
pub struct DependScheduler<K> {
    pending: Vec<usize>,
    successors: Vec<Vec<usize>>,
    writers: HashMap<K, usize>,
    readers: HashMap<K, Vec<usize>>,
}

impl<K> Default for DependScheduler<K> {
    fn default() -> Self {
        Self {
            pending: vec![],
            successors: vec![],
            writers: HashMap::default(),
            readers: HashMap::default(),
        }
    }
}

impl<K: Hash + Eq> DependScheduler<K> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of distinct earlier tasks task `task` waits for.
    #[inline]
    pub fn pending(&self, task: usize) -> usize {
        self.pending[task]
    }

    #[inline]
    pub fn successors(&self, task: usize) -> &[usize] {
        &self.successors[task]
    }

    fn depend(&mut self, from: usize, to: usize) {
        if from == to || self.successors[from].contains(&to) {
            return;
        }
        self.successors[from].push(to);
        self.pending[to] += 1;
    }

    /// Adds a task touching `keys`; returns its index.
    pub fn submit(&mut self, keys: impl IntoIterator<Item = (K, Access)>) -> usize {
        let task = self.pending.len();
        self.pending.push(0);
        self.successors.push(vec![]);

        for (key, access) in keys {
            if let Some(&writer) = self.writers.get(&key) {
                self.depend(writer, task);
            }
            if access.writes() {
                let readers = self.readers.remove(&key).unwrap_or_default();
                for reader in readers {
                    self.depend(reader, task);
                }
                self.writers.insert(key, task);
            } else {
                self.readers.entry(key).or_default().push(task);
            }
        }
        task
    }

    /// Calls `f` once per task, never before the tasks it waits for have returned.
    pub fn run(&self, f: impl Fn(usize) + Sync)
    where
        K: Sync,
    {
        #[cfg(not(feature = "rayon"))]
        {
            (0..self.len()).for_each(f);
        }
        #[cfg(feature = "rayon")]
        {
            let pending = self.pending.iter().map(|&x| AtomicUsize::new(x)).collect::<Vec<_>>();
            let state = RunState {
                scheduler: self,
                pending: &pending,
                f: &f,
            };
            rayon::scope(|scope| {
                for task in (0..self.len()).filter(|&task| self.pending[task] == 0) {
                    let state = &state;
                    scope.spawn(move |scope| state.run(scope, task));
                }
            });
        }
    }
}

#[cfg(feature = "rayon")]
struct RunState<'a, K, F> {
    scheduler: &'a DependScheduler<K>,
    pending: &'a [AtomicUsize],
    f: &'a F,
}

#[cfg(feature = "rayon")]
impl<'a, K, F> RunState<'a, K, F>
where
    K: Sync,
    F: Fn(usize) + Sync,
{
    fn run<'scope>(&'scope self, scope: &rayon::Scope<'scope>, task: usize) {
        (self.f)(task);
        for &next in &self.scheduler.successors[task] {
            if self.pending[next].fetch_sub(1, Ordering::AcqRel) == 1 {
                scope.spawn(move |scope| self.run(scope, next));
            }
        }
    }
}

/// Submits every node as a dependency task: a node reads its own key and writes the key of
/// each child, so a child is released once all of its parents are done.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaskDependGraph;

impl TaskDependGraph {
    pub fn scheduler<R: Resource>(schedule: &Schedule<R>) -> DependScheduler<usize> {
        let mut scheduler = DependScheduler::new();
        for index in 0..schedule.len() {
            let own = std::iter::once((index, Access::ReadOnly));
            let children = schedule
                .children(index)
                .iter()
                .map(|&child| (child, Access::WriteOnly));
            scheduler.submit(own.chain(children));
        }
        scheduler
    }
}

impl GraphPolicy for TaskDependGraph {
    fn exec<R: Resource>(schedule: &Schedule<R>, resource: &R) {
        let scheduler = Self::scheduler(schedule);
        scheduler.run(|index| {
            schedule.run(index, resource);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use itertools::Itertools;

    use super::{Access, DependScheduler, TaskDependGraph};
    use crate::{
        graph::{
            Dag, NodeId,
            tests::{Timeline, check_random},
        },
        hal::Host,
    };

    #[test]
    fn test_access() {
        assert!(Access::ReadOnly.reads() && !Access::ReadOnly.writes());
        assert!(Access::ReadWrite.reads() && Access::ReadWrite.writes());
        assert!(!Access::WriteOnly.reads() && Access::WriteOnly.writes());
        assert_eq!(Access::ReadWrite.to_string(), "ReadWrite");
    }

    #[test]
    fn test_read_after_write() {
        let mut scheduler = DependScheduler::new();
        let w0 = scheduler.submit([("x", Access::WriteOnly)]);
        let r1 = scheduler.submit([("x", Access::ReadOnly)]);
        let r2 = scheduler.submit([("x", Access::ReadOnly), ("y", Access::ReadOnly)]);
        let w3 = scheduler.submit([("x", Access::ReadWrite)]);
        let r4 = scheduler.submit([("y", Access::ReadOnly)]);

        assert_eq!(scheduler.len(), 5);
        assert_eq!(scheduler.pending(w0), 0);
        assert_eq!(scheduler.pending(r1), 1);
        assert_eq!(scheduler.pending(r2), 1);
        // the last writer and both readers since it
        assert_eq!(scheduler.pending(w3), 3);
        assert_eq!(scheduler.pending(r4), 0);
        assert_eq!(scheduler.successors(w0), [r1, r2, w3]);
        assert_eq!(scheduler.successors(r1), [w3]);
    }

    #[test]
    fn test_run_respects_dependencies() {
        const TASKS: usize = 200;
        let mut rng = fastrand::Rng::with_seed(7);
        let mut scheduler = DependScheduler::new();
        for _ in 0..TASKS {
            let task_keys = (0..rng.usize(1..4))
                .map(|_| {
                    let access = match rng.u8(0..3) {
                        0 => Access::ReadOnly,
                        1 => Access::ReadWrite,
                        _ => Access::WriteOnly,
                    };
                    (rng.usize(0..8), access)
                })
                .collect_vec();
            scheduler.submit(task_keys);
        }

        let clock = AtomicUsize::new(0);
        let spans = Mutex::new(vec![(0, 0); TASKS]);
        scheduler.run(|task| {
            let start = clock.fetch_add(1, Ordering::SeqCst);
            let finish = clock.fetch_add(1, Ordering::SeqCst);
            spans.lock().unwrap()[task] = (start, finish);
        });

        let spans = spans.into_inner().unwrap();
        for task in 0..TASKS {
            for &next in scheduler.successors(task) {
                assert!(spans[task].1 < spans[next].0, "{task} -> {next} violated");
            }
        }
        assert_eq!(clock.load(Ordering::SeqCst), 2 * TASKS);
    }

    #[test]
    fn test_graph_annotations() {
        let timeline = Arc::new(Timeline::default());
        let mut dag = Dag::<Host>::new();
        for id in (0..3).map(NodeId) {
            dag.add_node(id, timeline.node(id)).unwrap();
        }
        dag.add_edge(NodeId(0), NodeId(2)).unwrap();
        dag.add_edge(NodeId(1), NodeId(2)).unwrap();

        let exec = dag.instantiate::<TaskDependGraph>().unwrap();
        let scheduler = TaskDependGraph::scheduler(exec.schedule());
        assert_eq!(exec.order()[2], NodeId(2));
        assert_eq!(exec.schedule().parents(2), [0, 1]);
        // parents writing the same child key are chained, the child waits for the last one
        let pending = (0..3).map(|task| scheduler.pending(task)).collect_vec();
        assert_eq!(pending, [0, 1, 1]);
        assert_eq!(scheduler.successors(0), [1]);
        assert_eq!(scheduler.successors(1), [2]);
    }

    #[test]
    fn test_random_graphs() {
        check_random::<TaskDependGraph>(0xd0d0);
    }
}
