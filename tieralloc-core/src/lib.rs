#![deny(missing_docs)]

//! Building blocks for a tiered, NUMA-aware allocator.
//!
//! tieralloc-core is a set of platform-agnostic building blocks, assembled into a memory manager for a managed-language
//! runtime. It contains:
//! -   A platform trait, used to map large raw regions of memory, and to steer their placement on NUMA nodes.
//! -   An arena allocator, serving each thread from its own chain of blocks with a bump cursor.
//! -   A slab allocator, recycling small objects through per size class, per node, free lists.
//! -   A large-object allocator, mapping each large object individually.
//! -   A memory manager, routing each request to the right allocator, validating it, and keeping statistics.

mod api;
mod internals;
mod utils;

pub use api::*;
