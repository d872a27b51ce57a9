//! Statistics snapshots.
//!
//! Snapshots are assembled from relaxed atomic counters, without any global synchronization; each counter is exact,
//! but two counters may be observed at slightly different points in time.

use std::time::Duration;

use super::NodeIndex;

/// Snapshot of an arena allocator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArenaStats {
    /// Number of threads with a thread arena.
    pub threads: usize,
    /// Number of allocations served.
    pub allocations: u64,
    /// Number of bytes requested.
    pub bytes_requested: u64,
    /// Number of bytes consumed since the last reset, including rounding, padding, and abandoned block tails.
    pub bytes_used: u64,
    /// Number of bytes lost to rounding, padding, and abandoned block tails since the last reset.
    pub wasted_bytes: u64,
    /// Number of blocks mapped.
    pub blocks_allocated: u64,
    /// Number of live blocks backed by huge pages.
    pub huge_blocks: u64,
    /// Number of bytes currently mapped.
    pub bytes_reserved: u64,
    /// Number of resets.
    pub resets: u64,
    /// Number of compaction passes.
    pub compactions: u64,
    /// Number of huge pages mappings which fell back to normal pages.
    pub huge_page_fallbacks: u64,
    /// Number of failed NUMA bindings.
    pub bind_failures: u64,
}

impl ArenaStats {
    /// Returns the ratio of wasted bytes over consumed bytes, in `[0, 1]`.
    pub fn fragmentation(&self) -> f64 { ratio(self.wasted_bytes, self.bytes_used) }
}

/// Snapshot of a single arena block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockStats {
    /// Address of the first byte of the block.
    pub start: usize,
    /// Address one past the last byte of the block.
    pub end: usize,
    /// Number of bytes handed out since the last reset.
    pub used: usize,
    /// Node the block was requested for.
    pub node: NodeIndex,
    /// Whether the block is backed by huge pages.
    pub huge_pages: bool,
}

/// Snapshot of a single slab class, on a single node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlabClassStats {
    /// Size of the objects of this class.
    pub object_size: usize,
    /// Node of this class.
    pub node: NodeIndex,
    /// Number of allocations served from the free list.
    pub hits: u64,
    /// Number of allocations carved out of a region.
    pub misses: u64,
    /// Number of objects currently on the free list.
    pub free_objects: usize,
    /// Number of regions mapped.
    pub regions: usize,
}

/// Snapshot of the slab allocator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SlabStats {
    /// Number of allocations served.
    pub allocations: u64,
    /// Number of deallocations.
    pub deallocations: u64,
    /// Number of allocations served from a free list.
    pub hits: u64,
    /// Number of allocations carved out of a region.
    pub misses: u64,
    /// Number of allocations served by another node, after the local one failed to map a region.
    pub remote_fallbacks: u64,
    /// Number of bytes currently mapped.
    pub bytes_reserved: u64,
    /// Number of huge pages mappings which fell back to normal pages.
    pub huge_page_fallbacks: u64,
    /// Number of failed NUMA bindings.
    pub bind_failures: u64,
    /// Per class, per node, statistics; only classes which were used are listed.
    pub classes: Vec<SlabClassStats>,
}

impl SlabStats {
    /// Returns the ratio of allocations served from a free list, in `[0, 1]`.
    pub fn hit_ratio(&self) -> f64 { ratio(self.hits, self.hits + self.misses) }
}

/// Usage of a single node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeUsage {
    /// Number of live objects.
    pub objects: u64,
    /// Number of live bytes.
    pub bytes: u64,
}

/// Snapshot of the large-object allocator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LargeObjectStats {
    /// Number of live objects.
    pub objects: u64,
    /// Number of live bytes, as requested.
    pub bytes: u64,
    /// Number of allocations served.
    pub allocations: u64,
    /// Number of deallocations.
    pub deallocations: u64,
    /// Number of live objects backed by huge pages.
    pub huge_objects: u64,
    /// Number of huge pages mappings which fell back to normal pages.
    pub huge_page_fallbacks: u64,
    /// Number of failed NUMA bindings.
    pub bind_failures: u64,
    /// Per node usage, indexed by node.
    pub nodes: Vec<NodeUsage>,
}

/// Per object kind allocation counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KindCounters {
    /// Generic objects, instances and functions.
    pub object: u64,
    /// Strings.
    pub string: u64,
    /// Arrays.
    pub array: u64,
    /// Hash maps.
    pub hash_map: u64,
    /// Objects served by the large-object allocator, of any kind.
    pub large: u64,
}

impl KindCounters {
    /// Returns the sum of all counters.
    pub fn total(&self) -> u64 { self.object + self.string + self.array + self.hash_map + self.large }
}

/// Snapshot of the memory manager.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryStats {
    /// Number of successful allocations.
    pub total_allocations: u64,
    /// Number of bytes requested by successful allocations.
    pub total_bytes_allocated: u64,
    /// Number of bytes currently in use.
    pub current_memory_usage: u64,
    /// Highest value of `current_memory_usage`.
    pub peak_memory_usage: u64,
    /// Allocations served by the node of the requesting thread.
    pub numa_local_allocations: u64,
    /// Allocations served by another node.
    pub numa_remote_allocations: u64,
    /// Number of requests denied.
    pub failed_allocations: u64,
    /// Number of requests rejected by the security validator.
    pub security_rejections: u64,
    /// Cumulative time spent in successful allocations.
    pub allocation_time: Duration,
    /// Number of compaction passes.
    pub compactions: u64,
    /// Cumulative time spent compacting.
    pub compaction_time: Duration,
    /// Per kind allocation counters.
    pub kinds: KindCounters,
    /// Advisory pressure signal for the collector, in `[0, 1]`.
    pub gc_pressure: f64,
    /// Whether the memory usage is above the pressure threshold, as of the last check.
    pub under_pressure: bool,
    /// Arena of everything without a dedicated arena.
    pub general_arena: ArenaStats,
    /// Arena of containers.
    pub object_arena: ArenaStats,
    /// Arena of strings.
    pub string_arena: ArenaStats,
    /// Slab allocator.
    pub slab: SlabStats,
    /// Large-object allocator.
    pub large: LargeObjectStats,
}

impl MemoryStats {
    /// Returns the ratio of allocations served by the node of the requesting thread, in `[0, 1]`.
    pub fn locality_ratio(&self) -> f64 {
        ratio(self.numa_local_allocations, self.numa_local_allocations + self.numa_remote_allocations)
    }

    /// Returns the fragmentation ratio of the arenas, in `[0, 1]`.
    pub fn fragmentation_ratio(&self) -> f64 {
        let arenas = [&self.general_arena, &self.object_arena, &self.string_arena];

        let wasted = arenas.iter().map(|arena| arena.wasted_bytes).sum();
        let used = arenas.iter().map(|arena| arena.bytes_used).sum();

        ratio(wasted, used)
    }

    /// Returns the average latency of successful allocations.
    pub fn average_allocation_latency(&self) -> Duration {
        match u32::try_from(self.total_allocations) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.allocation_time / count,
            Err(_) => Duration::from_secs_f64(self.allocation_time.as_secs_f64() / self.total_allocations as f64),
        }
    }

    /// Returns the number of huge pages mappings which fell back to normal pages, across all allocators.
    pub fn huge_page_fallbacks(&self) -> u64 {
        self.general_arena.huge_page_fallbacks + self.object_arena.huge_page_fallbacks +
            self.string_arena.huge_page_fallbacks + self.slab.huge_page_fallbacks + self.large.huge_page_fallbacks
    }

    /// Returns the number of failed NUMA bindings, across all allocators.
    pub fn bind_failures(&self) -> u64 {
        self.general_arena.bind_failures + self.object_arena.bind_failures + self.string_arena.bind_failures +
            self.slab.bind_failures + self.large.bind_failures
    }
}

//
//  Implementation
//

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 { 0.0 } else { numerator as f64 / denominator as f64 }
}
