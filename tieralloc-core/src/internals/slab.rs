//! Slab Allocator.
//!
//! Segregated free lists, one per size class and per NUMA node. Each class carves fresh objects out of its current
//! region, and recycles freed objects through an intrusive LIFO free list.
//!
//! Each class is guarded by its own lock; no two locks are ever held at once.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    AllocError, FreeError, MapError, NodeIndex, Platform, SlabClassStats, SlabStats,
    SLAB_MIN_OBJECTS_PER_REGION, SLAB_SIZE_CLASSES, slab_size_class,
};
use crate::internals::{free_list::{FreeList, MINIMUM_OBJECT_SIZE}, region::{Region, RegionMapper}};

/// Slab Allocator.
pub struct SlabAllocator<P>
    where
        P: Platform,
{
    platform: Arc<P>,
    mapper: RegionMapper,
    //  Node-major: the classes of node N are `classes[N * CLASSES..(N + 1) * CLASSES]`.
    classes: Vec<SlabClass>,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    remote_fallbacks: AtomicU64,
}

impl<P> SlabAllocator<P>
    where
        P: Platform,
{
    /// Creates an instance, with one set of size classes per node of the platform topology.
    pub fn new(platform: Arc<P>, huge_pages: bool, numa_aware: bool) -> Self {
        let mapper = RegionMapper::new(huge_pages, numa_aware);

        let classes = platform.topology().nodes()
            .flat_map(|node| SLAB_SIZE_CLASSES.iter().map(move |object_size| SlabClass::new(*object_size, node)))
            .collect();

        Self {
            platform,
            mapper,
            classes,
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            remote_fallbacks: AtomicU64::new(0),
        }
    }

    /// Allocates an object of at least `size` bytes, from the node of the calling thread.
    ///
    /// The object is aligned on its size class, up to the page size.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate(size, None).map(|(pointer, _)| pointer)
    }

    /// Allocates an object of at least `size` bytes, from `node`.
    pub fn alloc_numa(&self, size: usize, node: NodeIndex) -> Result<NonNull<u8>, AllocError> {
        self.allocate(size, Some(node)).map(|(pointer, _)| pointer)
    }

    /// Allocates an object of at least `size` bytes, from `node` or the node of the calling thread.
    ///
    /// If the node is exhausted and no region can be mapped for it, the free lists of the other nodes are tried.
    ///
    /// Returns the pointer, and the node it was served from.
    pub(crate) fn allocate(&self, size: usize, node: Option<NodeIndex>) -> Result<(NonNull<u8>, NodeIndex), AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        let class = slab_size_class(size).ok_or(AllocError::NoSizeClass(size))?;

        let node = match node {
            Some(node) if self.platform.topology().contains(node) => node,
            Some(node) => return Err(AllocError::InvalidNode(node)),
            None => self.local_node(),
        };

        let result = match self.class(node, class).allocate(&*self.platform, &self.mapper) {
            Ok(pointer) => Ok((pointer, node)),
            Err(error) => self.allocate_remote(class, node).ok_or(AllocError::Map(error)),
        };

        if result.is_ok() {
            self.allocations.fetch_add(1, Ordering::Relaxed);
        }

        result
    }

    /// Returns an object to the free list of its size class, on the node whose region it was carved from.
    ///
    /// #   Errors
    ///
    /// If no size class can hold `size` bytes, or if no region of that class holds `pointer`; the object is then
    /// left untouched.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `pointer` was allocated by this instance, with the same `size`.
    /// -   Assumes that `pointer` is not freed twice, and not accessed afterwards.
    pub unsafe fn free(&self, pointer: NonNull<u8>, size: usize) -> Result<(), FreeError> {
        let class = slab_size_class(size).ok_or(FreeError::UnknownSizeClass(size))?;

        let local = self.local_node();

        //  The local node owns the object in the common case, hence is checked first.
        let mut nodes = core::iter::once(local)
            .chain(self.platform.topology().nodes().filter(|node| *node != local));

        //  Safety:
        //  -   `pointer` was allocated from the same size class, as per pre-conditions, hence is large enough and
        //      suitably aligned.
        //  -   `pointer` is no longer accessed by the caller, as per pre-conditions.
        if !nodes.any(|node| unsafe { self.class(node, class).reclaim(pointer) }) {
            return Err(FreeError::UnknownPointer(pointer.as_ptr() as usize));
        }

        self.deallocations.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Returns the number of objects currently on the free list of the class of `size`, on `node`.
    pub fn free_objects(&self, size: usize, node: NodeIndex) -> usize {
        let Some(class) = slab_size_class(size) else { return 0 };

        if !self.platform.topology().contains(node) {
            return 0;
        }

        self.class(node, class).state.lock().free.len()
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> SlabStats {
        let classes: Vec<_> = self.classes.iter()
            .map(SlabClass::stats)
            .filter(|class| class.hits + class.misses > 0 || class.regions > 0)
            .collect();

        SlabStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            hits: classes.iter().map(|class| class.hits).sum(),
            misses: classes.iter().map(|class| class.misses).sum(),
            remote_fallbacks: self.remote_fallbacks.load(Ordering::Relaxed),
            bytes_reserved: self.mapper.mapped_bytes(),
            huge_page_fallbacks: self.mapper.huge_page_fallbacks(),
            bind_failures: self.mapper.bind_failures(),
            classes,
        }
    }

    fn local_node(&self) -> NodeIndex {
        if self.mapper.is_numa_aware() { self.platform.current_node() } else { NodeIndex::default() }
    }

    fn class(&self, node: NodeIndex, class: usize) -> &SlabClass {
        &self.classes[node.index() * SLAB_SIZE_CLASSES.len() + class]
    }

    #[cold]
    #[inline(never)]
    fn allocate_remote(&self, class: usize, local: NodeIndex) -> Option<(NonNull<u8>, NodeIndex)> {
        let (pointer, node) = self.platform.topology().nodes()
            .filter(|node| *node != local)
            .find_map(|node| self.class(node, class).pop().map(|pointer| (pointer, node)))?;

        self.remote_fallbacks.fetch_add(1, Ordering::Relaxed);

        debug!("slab class {} of node {} exhausted, served by node {}", SLAB_SIZE_CLASSES[class], local, node);

        Some((pointer, node))
    }
}

impl<P> Drop for SlabAllocator<P>
    where
        P: Platform,
{
    fn drop(&mut self) {
        for class in &mut self.classes {
            let state = class.state.get_mut();

            state.free.clear();

            for region in state.regions.drain(..) {
                //  Safety:
                //  -   Mapped by `self.mapper`, on `self.platform`.
                //  -   `&mut self` guarantees that no object is in use any longer.
                unsafe { self.mapper.unmap(&*self.platform, region) };
            }
        }
    }
}

//
//  Implementation
//

struct SlabClass {
    object_size: usize,
    node: NodeIndex,
    state: Mutex<SlabClassState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Default)]
struct SlabClassState {
    free: FreeList,
    regions: Vec<Region>,
    //  Number of bytes carved out of the last region.
    carved: usize,
}

impl SlabClass {
    fn new(object_size: usize, node: NodeIndex) -> Self {
        debug_assert!(object_size >= MINIMUM_OBJECT_SIZE);

        Self {
            object_size,
            node,
            state: Mutex::new(SlabClassState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn allocate<P>(&self, platform: &P, mapper: &RegionMapper) -> Result<NonNull<u8>, MapError>
        where
            P: Platform,
    {
        let mut state = self.state.lock();

        if let Some(pointer) = state.free.pop() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(pointer);
        }

        let exhausted = state.regions.last().map_or(true, |region| state.carved + self.object_size > region.length());

        if exhausted {
            let region = mapper.map(platform, self.region_length(platform), self.node)?;

            trace!("new slab region of {} bytes for class {} on node {}", region.length(), self.object_size, self.node);

            state.regions.push(region);
            state.carved = 0;
        }

        let offset = state.carved;
        state.carved += self.object_size;

        let Some(region) = state.regions.last() else { return Err(MapError::OutOfMemory) };

        //  Safety:
        //  -   `offset + object_size <= region.length()`, hence within the region.
        let pointer = unsafe { NonNull::new_unchecked(region.pointer().as_ptr().add(offset)) };

        self.misses.fetch_add(1, Ordering::Relaxed);

        Ok(pointer)
    }

    //  Pushes `pointer` onto the free list, if it was carved from one of the regions of this class.
    //
    //  Safety:
    //  -   Assumes that `pointer`, if carved from this class, is no longer in use.
    unsafe fn reclaim(&self, pointer: NonNull<u8>) -> bool {
        let address = pointer.as_ptr() as usize;

        let mut state = self.state.lock();

        if !state.regions.iter().any(|region| region.contains(address)) {
            return false;
        }

        //  Safety:
        //  -   Carved from this class, hence large enough and suitably aligned.
        //  -   No longer in use, as per pre-conditions.
        unsafe { state.free.push(pointer) };

        true
    }

    fn pop(&self) -> Option<NonNull<u8>> {
        let pointer = self.state.lock().free.pop()?;

        self.hits.fetch_add(1, Ordering::Relaxed);

        Some(pointer)
    }

    fn region_length<P>(&self, platform: &P) -> usize
        where
            P: Platform,
    {
        let objects = (platform.page_size().value() / self.object_size).max(SLAB_MIN_OBJECTS_PER_REGION);

        self.object_size * objects
    }

    fn stats(&self) -> SlabClassStats {
        let (free_objects, regions) = {
            let state = self.state.lock();
            (state.free.len(), state.regions.len())
        };

        SlabClassStats {
            object_size: self.object_size,
            node: self.node,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            free_objects,
            regions,
        }
    }
}
