//! Memory Manager.
//!
//! The facade of the allocator: validates each request, routes it to an arena, the slabs, or the large-object
//! allocator, and maintains the statistics and pressure signals consumed by the runtime and its collector.
//!
//! Routing, by order of precedence:
//!
//! -   Requests of at least the large object threshold are served by the large-object allocator.
//! -   Requests of at most `SLAB_MAX_OBJECT_SIZE` bytes are served by the slabs, if enabled.
//! -   Everything else is served by the arena of its kind.

use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicU64, Ordering},
};

use std::{sync::Arc, time::Instant};

use log::{debug, info, warn};

use crate::internals::{
    arena::ArenaAllocator,
    large_object::LargeObjectAllocator,
    slab::SlabAllocator,
    telemetry::{Counters, KindSlot, Pressure},
};
use crate::utils::{elapsed_nanos, is_sufficiently_aligned_for, prefetch_write};

use super::security::AtomicSecurityMode;
use super::{
    AllocError, ArenaKind, BindError, CACHE_LINE_SIZE, Category, ConfigError, Configuration, FreeError, MemoryStats,
    NodeIndex, NumaTopology, ObjectKind, Platform, PowerOf2, SecurityMode, SecurityRejection, SLAB_MAX_OBJECT_SIZE,
};

/// Memory Manager.
pub struct MemoryManager<P>
    where
        P: Platform,
{
    platform: Arc<P>,
    configuration: Configuration,
    general: ArenaAllocator<P>,
    objects: ArenaAllocator<P>,
    strings: ArenaAllocator<P>,
    slab: Option<SlabAllocator<P>>,
    large: LargeObjectAllocator<P>,
    security: AtomicSecurityMode,
    counters: Counters,
    pressure: Pressure,
    //  Bytes requested from the arenas since the last reset.
    arena_bytes: AtomicU64,
    origin: Instant,
    //  Nanoseconds since `origin`.
    last_compaction: AtomicU64,
}

impl<P> MemoryManager<P>
    where
        P: Platform,
{
    /// Creates an instance, after validating the configuration.
    pub fn new(platform: Arc<P>, configuration: Configuration) -> Result<Self, ConfigError> {
        configuration.validate()?;

        let block_size = configuration.block_size()?;
        let minimum = Configuration::MINIMUM_BLOCK_SIZE;

        let (huge_pages, numa_aware) = (configuration.huge_pages, configuration.numa_aware);

        let arena = |kind: ArenaKind| {
            ArenaAllocator::new(platform.clone(), kind.block_size(block_size, minimum), huge_pages, numa_aware)
        };

        let general = arena(ArenaKind::General);
        let objects = arena(ArenaKind::Object);
        let strings = arena(ArenaKind::String);

        let slab = configuration.slab_enabled.then(|| SlabAllocator::new(platform.clone(), huge_pages, numa_aware));
        let large = LargeObjectAllocator::new(platform.clone(), huge_pages, numa_aware);

        let pressure = Pressure::new(
            configuration.pressure_threshold,
            configuration.pressure_check_interval,
            block_size.value(),
        );

        debug!("memory manager created over {} NUMA node(s): {:?}", platform.topology().node_count(), configuration);

        Ok(Self {
            security: AtomicSecurityMode::new(configuration.security_mode),
            platform,
            configuration,
            general,
            objects,
            strings,
            slab,
            large,
            counters: Counters::default(),
            pressure,
            arena_bytes: AtomicU64::new(0),
            origin: Instant::now(),
            last_compaction: AtomicU64::new(0),
        })
    }

    /// Returns the configuration.
    pub fn configuration(&self) -> &Configuration { &self.configuration }

    /// Returns the platform.
    pub fn platform(&self) -> &Arc<P> { &self.platform }

    /// Returns the NUMA topology.
    pub fn topology(&self) -> &NumaTopology { self.platform.topology() }

    /// Returns the arena serving `kind`.
    pub fn arena(&self, kind: ArenaKind) -> &ArenaAllocator<P> {
        match kind {
            ArenaKind::General => &self.general,
            ArenaKind::Object => &self.objects,
            ArenaKind::String => &self.strings,
        }
    }

    /// Returns the slab allocator, if enabled.
    pub fn slab(&self) -> Option<&SlabAllocator<P>> { self.slab.as_ref() }

    /// Returns the large-object allocator.
    pub fn large_objects(&self) -> &LargeObjectAllocator<P> { &self.large }

    /// Returns which allocator serves a request of `size` bytes of `kind`.
    pub fn classify(&self, size: usize, kind: ObjectKind) -> Category {
        if size >= self.configuration.large_object_threshold {
            Category::Large
        } else if self.slab.is_some() && size <= SLAB_MAX_OBJECT_SIZE {
            Category::Slab
        } else {
            Category::Arena(kind.arena())
        }
    }

    /// Allocates `size` bytes for an object of `kind`.
    pub fn alloc(&self, size: usize, kind: ObjectKind) -> Result<NonNull<u8>, AllocError> {
        let category = self.classify(size, kind);

        self.allocate(size, kind, category, None, WORD)
    }

    /// Allocates `size` bytes on `node`.
    ///
    /// If `node` cannot map any more memory, the request is retried without any node preference.
    pub fn alloc_numa(&self, size: usize, node: NodeIndex) -> Result<NonNull<u8>, AllocError> {
        if !self.topology().contains(node) {
            return self.fail(AllocError::InvalidNode(node));
        }

        let kind = ObjectKind::Generic;
        let category = self.classify(size, kind);

        match self.allocate(size, kind, category, Some(node), WORD) {
            Err(AllocError::Map(error)) => {
                debug!("allocation of {} bytes on node {} failed ({}), retrying on any node", size, node, error);
                self.allocate(size, kind, category, None, WORD)
            },
            result => result,
        }
    }

    /// Allocates `size` bytes, aligned on `alignment`.
    ///
    /// `alignment` should be a power of 2, no larger than the page size. Below the large object threshold, the
    /// memory is served by the general arena, and is only reclaimed in bulk.
    pub fn alloc_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        self.alloc_aligned_in(size, alignment, ArenaKind::General)
    }

    /// Allocates `size` bytes, aligned on a cache line, from the object arena.
    pub fn alloc_cache_aligned(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.alloc_aligned_in(size, CACHE_LINE_SIZE.value(), ArenaKind::Object)
    }

    /// Allocates `count` elements of `size` bytes each, zeroed.
    pub fn alloc_zeroed(&self, count: usize, size: usize, kind: ObjectKind) -> Result<NonNull<u8>, AllocError> {
        let Some(total) = count.checked_mul(size) else { return self.fail(AllocError::Overflow) };

        let pointer = self.alloc(total, kind)?;

        //  Safety:
        //  -   `pointer` was just allocated, with `total` bytes.
        unsafe { ptr::write_bytes(pointer.as_ptr(), 0, total) };

        Ok(pointer)
    }

    /// Releases an object.
    ///
    /// Objects served by the slabs, or by the large-object allocator, are released individually; arena memory is only
    /// reclaimed in bulk, and `FreeError::ArenaMemory` is returned for it.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `pointer` was returned by `alloc`, `alloc_numa` or `alloc_zeroed` on this instance, for
    ///     `size` bytes in total.
    /// -   Assumes that `pointer` is not freed twice, and not accessed afterwards.
    pub unsafe fn free(&self, pointer: NonNull<u8>, size: usize) -> Result<(), FreeError> {
        let freed = match self.classify(size, ObjectKind::Generic) {
            //  Safety:
            //  -   Served by the large-object allocator, as per pre-conditions and routing.
            Category::Large => unsafe { self.large.free(pointer)? },
            Category::Slab => match &self.slab {
                //  Safety:
                //  -   Served by the slabs, with `size`, as per pre-conditions and routing.
                Some(slab) => unsafe { slab.free(pointer, size).map(|_| size)? },
                None => return Err(FreeError::ArenaMemory),
            },
            Category::Arena(_) => return Err(FreeError::ArenaMemory),
        };

        self.counters.record_free(freed);

        Ok(())
    }

    /// Rewinds all arenas, making all their memory available again.
    ///
    /// #   Safety
    ///
    /// The caller guarantees that no pointer into arena memory obtained prior to the reset is dereferenced
    /// afterwards; `&mut self` guarantees that no allocation is in flight.
    pub fn reset_arenas(&mut self) {
        self.general.reset();
        self.objects.reset();
        self.strings.reset();

        self.counters.record_bulk_free(self.arena_bytes.swap(0, Ordering::Relaxed));

        info!("arenas reset");
    }

    /// Unmaps all arena blocks.
    ///
    /// #   Safety
    ///
    /// The caller guarantees that no pointer into arena memory obtained prior to the destruction is dereferenced
    /// afterwards.
    pub fn destroy_arenas(&mut self) {
        self.general.destroy();
        self.objects.destroy();
        self.strings.destroy();

        self.counters.record_bulk_free(self.arena_bytes.swap(0, Ordering::Relaxed));

        info!("arenas destroyed");
    }

    /// Releases the arenas of the calling thread.
    ///
    /// #   Safety
    ///
    /// The caller guarantees that no pointer into arena memory obtained by this thread is dereferenced afterwards.
    pub fn release_thread(&self) {
        self.general.release_thread();
        self.objects.release_thread();
        self.strings.release_thread();
    }

    /// Runs a compaction pass over every arena, consolidating their fragmentation statistics.
    ///
    /// Returns the aggregated fragmentation ratio.
    pub fn compact(&self) -> f64 {
        let start = Instant::now();

        for arena in [&self.general, &self.objects, &self.strings] {
            arena.compact();
        }

        self.counters.record_compaction(elapsed_nanos(start));
        self.last_compaction.store(elapsed_nanos(self.origin), Ordering::Relaxed);

        let fragmentation = self.fragmentation();

        debug!("compaction completed in {:?}, fragmentation at {:.3}", start.elapsed(), fragmentation);

        fragmentation
    }

    /// Returns the aggregated fragmentation ratio of the arenas.
    pub fn fragmentation(&self) -> f64 {
        let arenas = [&self.general, &self.objects, &self.strings].map(|arena| arena.stats());

        let wasted: u64 = arenas.iter().map(|stats| stats.wasted_bytes).sum();
        let used: u64 = arenas.iter().map(|stats| stats.bytes_used).sum();

        if used == 0 { 0.0 } else { wasted as f64 / used as f64 }
    }

    /// Registers the callback invoked, on the checking thread, when the memory usage crosses the pressure threshold.
    ///
    /// Replaces any previously registered callback.
    pub fn set_pressure_callback<F>(&self, callback: F)
        where
            F: Fn() + Send + Sync + 'static,
    {
        self.pressure.set_callback(Some(Arc::new(callback)));
    }

    /// Removes the pressure callback, if any.
    pub fn clear_pressure_callback(&self) { self.pressure.set_callback(None); }

    /// Evaluates whether the memory usage is above the pressure threshold.
    ///
    /// The evaluation happens at most once per check interval; in between, the last state is returned. A compaction
    /// is also run if the compaction interval elapsed and the fragmentation exceeds the compaction threshold.
    pub fn check_pressure(&self) -> bool {
        let now = elapsed_nanos(self.origin);

        let pressured = self.pressure.check(self.counters.current_bytes(), now);

        self.maybe_compact(now);

        pressured
    }

    /// Reacts to memory pressure: compacts, and raises the GC pressure to its maximum.
    pub fn handle_pressure(&self) {
        let fragmentation = self.compact();

        self.pressure.saturate();

        warn!("handling memory pressure: fragmentation at {:.3}, GC pressure raised to maximum", fragmentation);
    }

    /// Returns the advisory GC pressure, in `[0, 1]`.
    pub fn gc_pressure(&self) -> f64 { self.pressure.gc_pressure() }

    /// Notifies the manager that a collection completed, resetting the GC pressure.
    pub fn gc_completed(&self) { self.pressure.gc_completed(); }

    /// Returns the current security mode.
    pub fn security_mode(&self) -> SecurityMode { self.security.load() }

    /// Sets the security mode, for all subsequent allocations.
    pub fn set_security_mode(&self, mode: SecurityMode) {
        info!("security mode set to {:?}", mode);
        self.security.store(mode);
    }

    /// Sets the memory policy of the calling thread to prefer `node`.
    pub fn bind_thread(&self, node: NodeIndex) -> Result<(), BindError> {
        if !self.topology().contains(node) {
            return Err(BindError::InvalidNode(node));
        }

        self.platform.bind_thread(node)
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats::default();

        self.counters.snapshot(&mut stats);

        stats.gc_pressure = self.pressure.gc_pressure();
        stats.under_pressure = self.pressure.is_under_pressure();
        stats.general_arena = self.general.stats();
        stats.object_arena = self.objects.stats();
        stats.string_arena = self.strings.stats();
        stats.slab = self.slab.as_ref().map(SlabAllocator::stats).unwrap_or_default();
        stats.large = self.large.stats();

        stats
    }

    /// Checks the invariants of the statistics, and the accounting of the large-object registries.
    ///
    /// The counters are updated independently of one another, hence the result is only meaningful while no
    /// allocation is in flight.
    pub fn validate_integrity(&self) -> bool {
        let stats = self.stats();

        let checks = [
            ("current usage exceeds total bytes", stats.current_memory_usage <= stats.total_bytes_allocated),
            ("local and remote allocations do not add up",
                stats.numa_local_allocations + stats.numa_remote_allocations == stats.total_allocations),
            ("per kind allocations do not add up", stats.kinds.total() == stats.total_allocations),
            ("peak usage below current usage", stats.current_memory_usage <= stats.peak_memory_usage),
            ("large object registries are inconsistent", self.large.validate()),
        ];

        checks.iter()
            .filter(|(_, valid)| !valid)
            .inspect(|(violation, _)| warn!("integrity violation: {}", violation))
            .count() == 0
    }

    fn alloc_aligned_in(&self, size: usize, alignment: usize, arena: ArenaKind) -> Result<NonNull<u8>, AllocError> {
        let Some(alignment) = PowerOf2::new(alignment).filter(|alignment| *alignment <= self.platform.page_size())
        else {
            return self.fail(AllocError::InvalidAlignment(alignment));
        };

        let kind = match arena {
            ArenaKind::General => ObjectKind::Generic,
            ArenaKind::Object => ObjectKind::Array,
            ArenaKind::String => ObjectKind::String,
        };

        let category = if size >= self.configuration.large_object_threshold {
            Category::Large
        } else {
            Category::Arena(arena)
        };

        self.allocate(size, kind, category, None, alignment.max(WORD))
    }

    fn allocate(
        &self,
        size: usize,
        kind: ObjectKind,
        category: Category,
        node: Option<NodeIndex>,
        alignment: PowerOf2,
    )
        -> Result<NonNull<u8>, AllocError>
    {
        let start = Instant::now();
        let mode = self.security.load();

        if let Err(rejection) = mode.check_size(size) {
            return self.fail(AllocError::Rejected(rejection));
        }

        let (pointer, served) = match self.dispatch(size, category, node, alignment) {
            Ok(result) => result,
            Err(error) => return self.fail(error),
        };

        debug_assert!(is_sufficiently_aligned_for(pointer, alignment));

        //  Safety:
        //  -   `pointer` was just allocated, with `size` bytes.
        if let Err(rejection) = unsafe { self.inspect(pointer, size, mode) } {
            //  Safety:
            //  -   `pointer` was just allocated, with `size` bytes, and is not handed out.
            unsafe { self.discard(pointer, size, category) };

            return self.fail(AllocError::Rejected(rejection));
        }

        if self.configuration.prefetch && size >= PREFETCH_MINIMUM {
            prefetch_write(pointer, size.min(PREFETCH_LENGTH));
        }

        if let Category::Arena(_) = category {
            self.arena_bytes.fetch_add(size as u64, Ordering::Relaxed);
        }

        let local = served == self.platform.current_node();
        let slot = KindSlot::of(kind, category == Category::Large);

        self.counters.record_allocation(size, slot, local, elapsed_nanos(start));
        self.pressure.record_allocation(size);

        Ok(pointer)
    }

    fn dispatch(&self, size: usize, category: Category, node: Option<NodeIndex>, alignment: PowerOf2)
        -> Result<(NonNull<u8>, NodeIndex), AllocError>
    {
        match (category, &self.slab) {
            (Category::Large, _) => {
                let node = node.unwrap_or_else(|| self.local_node());
                self.large.alloc(size, node).map(|pointer| (pointer, node))
            },
            (Category::Slab, Some(slab)) => slab.allocate(size, node),
            (Category::Slab, None) => self.general.allocate(size, alignment, node),
            (Category::Arena(kind), _) => self.arena(kind).allocate(size, alignment, node),
        }
    }

    //  Scans the memory about to be handed out, and zeroes it in paranoid mode.
    //
    //  Safety:
    //  -   Assumes that `[pointer, pointer + size)` is writable, and not handed out yet.
    unsafe fn inspect(&self, pointer: NonNull<u8>, size: usize, mode: SecurityMode) -> Result<(), SecurityRejection> {
        //  Safety:
        //  -   Readable, as per pre-conditions.
        unsafe { mode.validate(pointer, size)? };

        if mode.zero_fills() {
            //  Safety:
            //  -   Writable, as per pre-conditions.
            unsafe { ptr::write_bytes(pointer.as_ptr(), 0, size) };
        }

        Ok(())
    }

    //  Wipes a rejected allocation, and releases it where possible.
    //
    //  Safety:
    //  -   Assumes that `pointer` was just allocated from `category`, with `size` bytes, and is not handed out.
    #[cold]
    #[inline(never)]
    unsafe fn discard(&self, pointer: NonNull<u8>, size: usize, category: Category) {
        //  Safety:
        //  -   Writable, as per pre-conditions.
        unsafe { ptr::write_bytes(pointer.as_ptr(), 0, size) };

        //  Safety:
        //  -   Allocated from the matching allocator, as per pre-conditions.
        let released = match (category, &self.slab) {
            (Category::Large, _) => unsafe { self.large.free(pointer).map(|_| ()) },
            (Category::Slab, Some(slab)) => unsafe { slab.free(pointer, size) },
            _ => Ok(()),
        };

        if let Err(error) = released {
            warn!("failed to release rejected allocation of {} bytes at {:p}: {}", size, pointer, error);
        }
    }

    fn fail<T>(&self, error: AllocError) -> Result<T, AllocError> {
        self.counters.record_failure(&error);

        debug!("allocation denied: {}", error);

        Err(error)
    }

    fn local_node(&self) -> NodeIndex {
        if self.configuration.numa_aware { self.platform.current_node() } else { NodeIndex::default() }
    }

    fn maybe_compact(&self, now: u64) {
        let interval = u64::try_from(self.configuration.compaction_interval.as_nanos()).unwrap_or(u64::MAX);
        let last = self.last_compaction.load(Ordering::Relaxed);

        if now.saturating_sub(last) < interval {
            return;
        }

        let fragmentation = self.fragmentation();

        if fragmentation > self.configuration.compaction_threshold {
            debug!("fragmentation at {:.3} exceeds {:.3}, compacting", fragmentation, self.configuration.compaction_threshold);
            self.compact();
        }
    }
}

//
//  Implementation
//

const WORD: PowerOf2 = unsafe { PowerOf2::new_unchecked(8) };

const PREFETCH_MINIMUM: usize = 64;

const PREFETCH_LENGTH: usize = 256;
