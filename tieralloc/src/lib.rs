#![deny(missing_docs)]

//! A tiered, NUMA-aware memory allocator for a managed-language runtime.
//!
//! The type `TierAllocator` routes each request to one of three tiers:
//! -   Per-thread arenas, for short-lived objects reclaimed in bulk.
//! -   Per-node slabs, for small objects freed individually.
//! -   Individually mapped large objects.
//!
//! Every tier maps its memory from the OS with `mmap`, preferring huge pages, and binds it to the NUMA node of the
//! requesting thread.
//!
//! #   Example
//!
//! ```no_run
//! use tieralloc::{Configuration, ObjectKind};
//!
//! let allocator = tieralloc::create(Configuration::default()).unwrap();
//!
//! let string = allocator.alloc(48, ObjectKind::String).unwrap();
//! let large = allocator.alloc(1 << 20, ObjectKind::Array).unwrap();
//!
//! unsafe { allocator.free(large, 1 << 20).unwrap() };
//! # let _ = string;
//! ```

mod allocator;
mod platform;

pub mod topology;

pub use allocator::{create, create_default, TierAllocator};
pub use platform::LinuxPlatform;

pub use tieralloc_core::{
    AllocError, ArenaKind, ArenaStats, BindError, BlockStats, Category, ConfigError, Configuration, FreeError,
    KindCounters, LargeObjectStats, MapError, MemoryManager, MemoryStats, NodeIndex, NodeUsage, NumaTopology,
    ObjectKind, PageKind, Platform, PowerOf2, SecurityMode, SecurityRejection, SlabClassStats, SlabStats,
    arena_rounded_size, scan, scan_scalar, slab_size_class, CACHE_LINE_SIZE,
};
