//! The API of tieralloc-core.

mod configuration;
mod description;
mod error;
mod manager;
mod platform;
mod security;
mod stats;
mod topology;

pub use configuration::Configuration;
pub use description::{
    ArenaKind, Category, ObjectKind, PowerOf2, ARENA_BLOCK_SLOP, ARENA_SIZE_CLASSES, CACHE_LINE_SIZE,
    SLAB_MAX_OBJECT_SIZE, SLAB_MIN_OBJECTS_PER_REGION, SLAB_SIZE_CLASSES, arena_rounded_size, arena_size_class,
    slab_size_class,
};
pub use error::{AllocError, BindError, ConfigError, FreeError, MapError, SecurityRejection};
pub use manager::MemoryManager;
pub use platform::{PageKind, Platform};
pub use security::{SecurityMode, BASIC_SIZE_LIMIT, ENHANCED_SCAN_LENGTH, SIGNATURES, scan, scan_scalar};
#[cfg(target_arch = "x86_64")]
pub use security::scan_sse2;
pub use stats::{
    ArenaStats, BlockStats, KindCounters, LargeObjectStats, MemoryStats, NodeUsage, SlabClassStats, SlabStats,
};
pub use topology::{NodeIndex, NumaTopology, MAX_CPUS, MAX_NODES, parse_cpu_list, parse_mem_total};

pub use crate::internals::{arena::ArenaAllocator, large_object::LargeObjectAllocator, slab::SlabAllocator};
