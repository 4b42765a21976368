//! The deferred work-queue engine.
//!
//! Loops are type-erased into [`record::WorkRecord`]s through hand-built
//! [`vtable::Vtable`]s, packed into one of the [`storage`] layouts, and run in forward or
//! reverse order by a [`runner::WorkRunner`]. [`group`] wraps this in an owning pool/group API.
//!
//! ## Layouts
//! - [`storage::ArrayOfPointers`]: one allocation per record, stable addresses.
//! - [`storage::RaggedArray`]: one arena packed at record sizes, plus an offset table.
//! - [`storage::ConstantStride`]: one arena at the largest record size seen.
//!
//! Memory is drawn from an explicit [`alloc::Allocator`] that travels with its container.
//! Allocation failure is never retried and surfaces as [`alloc::AllocError`].

pub mod alloc;
pub mod buffer;
pub mod group;
pub mod index;
pub mod record;
pub mod runner;
pub mod storage;
pub mod vtable;
