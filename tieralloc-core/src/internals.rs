//! The internals of tieralloc-core.
//!
//! The internals provide all the heavy-lifting.

pub mod arena;
pub mod large_object;
pub mod slab;

pub(crate) mod free_list;
pub(crate) mod region;
pub(crate) mod telemetry;

mod atomic;
