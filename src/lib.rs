//! `weft` expresses "run this body over this index set" once and dispatches it to a
//! backend chosen through policy types: sequential, lane-chunked, multi-threaded or
//! stream-asynchronous.
//!
//! The heart of the crate is a deferred work queue. Loops of heterogeneous closure types
//! are pushed into a type-erased storage, packed in one of three memory layouts, and later
//! executed in insertion or reverse order. Whole queues can in turn be wrapped as nodes of a
//! dependency graph and scheduled sequentially or in parallel.
//!
//! ```
//! use std::sync::{
//!     Arc,
//!     atomic::{AtomicUsize, Ordering},
//! };
//!
//! use weft::{
//!     hal::{Host, Seq},
//!     loom::{
//!         group::{Policy, WorkPool},
//!         runner::Ordered,
//!         storage::ConstantStride,
//!     },
//! };
//!
//! let counter = Arc::new(AtomicUsize::new(0));
//! let mut pool = WorkPool::<Policy<Seq, Ordered, ConstantStride>, usize>::default();
//! for _ in 0..3 {
//!     let counter = counter.clone();
//!     pool.enqueue(0..10, move |_, _: &()| {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     })?;
//! }
//! let group = pool.instantiate();
//! group.run(&Host, ()).wait();
//! assert_eq!(counter.load(Ordering::Relaxed), 30);
//! # Ok::<(), weft::loom::alloc::AllocError>(())
//! ```

pub mod graph;
pub mod hal;
pub mod loom;

/// Installs a `tracing` subscriber that prints spans of work-group runs and graph executions.
#[cfg(feature = "trace")]
pub fn init_trace() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .try_init()
}
