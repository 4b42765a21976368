use super::{GraphPolicy, Schedule};
use crate::hal::Resource;

/// Runs nodes one after another in topological order on the calling thread.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeqGraph;

impl GraphPolicy for SeqGraph {
    fn exec<R: Resource>(schedule: &Schedule<R>, resource: &R) {
        (0..schedule.len()).for_each(|index| {
            schedule.run(index, resource);
        });
    }
}

/// Runs nodes as tasks released by per-node atomic counters.
///
/// A node becomes ready when the last of its parents finishes. The finishing task carries on
/// with one ready child itself and hands the others to new tasks. Falls back to a
/// single-threaded depth-first walk without the `rayon` feature.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaskAtomicGraph;

impl GraphPolicy for TaskAtomicGraph {
    #[cfg(feature = "rayon")]
    fn exec<R: Resource>(schedule: &Schedule<R>, resource: &R) {
        rayon::scope(|scope| {
            for root in schedule.roots() {
                if schedule.trigger(root) {
                    scope.spawn(move |scope| walk(scope, schedule, resource, root));
                }
            }
        });
    }

    #[cfg(not(feature = "rayon"))]
    fn exec<R: Resource>(schedule: &Schedule<R>, resource: &R) {
        let mut stack: Vec<usize> = schedule
            .roots()
            .filter(|&root| schedule.trigger(root))
            .collect();
        stack.reverse();
        while let Some(index) = stack.pop() {
            schedule.run(index, resource);
            for &child in schedule.children(index).iter().rev() {
                if schedule.trigger(child) {
                    stack.push(child);
                }
            }
        }
    }
}

#[cfg(feature = "rayon")]
fn walk<'scope, R: Resource>(
    scope: &rayon::Scope<'scope>,
    schedule: &'scope Schedule<R>,
    resource: &'scope R,
    mut index: usize,
) {
    loop {
        schedule.run(index, resource);

        let mut next = None;
        for &child in schedule.children(index) {
            if !schedule.trigger(child) {
                continue;
            }
            match next {
                None => next = Some(child),
                Some(_) => scope.spawn(move |scope| walk(scope, schedule, resource, child)),
            }
        }

        match next {
            Some(child) => index = child,
            None => break,
        }
    }
}
