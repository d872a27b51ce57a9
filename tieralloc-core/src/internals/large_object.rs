//! Large-Object Allocator.
//!
//! Each large object is a dedicated mapping, recorded in the registry of its node: a singly linked list with head
//! insertion, scanned linearly on free.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use std::{sync::Arc, time::Instant};

use log::debug;
use parking_lot::Mutex;

use crate::{AllocError, FreeError, LargeObjectStats, NodeIndex, NodeUsage, Platform};
use crate::internals::region::{Region, RegionMapper};

/// Large-Object Allocator.
pub struct LargeObjectAllocator<P>
    where
        P: Platform,
{
    platform: Arc<P>,
    mapper: RegionMapper,
    registries: Vec<Mutex<Registry>>,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    huge_objects: AtomicU64,
}

impl<P> LargeObjectAllocator<P>
    where
        P: Platform,
{
    /// Creates an instance, with one registry per node of the platform topology.
    pub fn new(platform: Arc<P>, huge_pages: bool, numa_aware: bool) -> Self {
        let mapper = RegionMapper::new(huge_pages, numa_aware);
        let registries = platform.topology().nodes().map(|_| Mutex::new(Registry::default())).collect();

        Self {
            platform,
            mapper,
            registries,
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            huge_objects: AtomicU64::new(0),
        }
    }

    /// Maps a dedicated region of at least `size` bytes, bound to `node`.
    ///
    /// The memory is zeroed, and aligned on the page size.
    pub fn alloc(&self, size: usize, node: NodeIndex) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        let registry = self.registries.get(node.index()).ok_or(AllocError::InvalidNode(node))?;

        let region = self.mapper.map(&*self.platform, size, node)?;
        let pointer = region.pointer();

        debug!("mapped large object of {} bytes at {:p} on node {}", size, pointer, node);

        if region.is_huge() {
            self.huge_objects.fetch_add(1, Ordering::Relaxed);
        }

        let object = Box::new(LargeObject { region, size, allocation_time: Instant::now(), next: None });

        registry.lock().push(object);

        self.allocations.fetch_add(1, Ordering::Relaxed);

        Ok(pointer)
    }

    /// Unlinks the large object starting at `pointer` from its registry, and unmaps it.
    ///
    /// Returns the size it was allocated with.
    ///
    /// #   Errors
    ///
    /// If `pointer` is not the start of a live large object; nothing is unmapped then.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the object is not accessed afterwards.
    pub unsafe fn free(&self, pointer: NonNull<u8>) -> Result<usize, FreeError> {
        let address = pointer.as_ptr() as usize;

        let object = self.registries.iter()
            .find_map(|registry| registry.lock().remove(address))
            .ok_or(FreeError::UnknownPointer(address))?;

        let LargeObject { region, size, allocation_time, .. } = *object;

        debug!("unmapping large object of {} bytes at {:p} on node {}, allocated {:?} ago",
            size, pointer, region.node(), allocation_time.elapsed());

        if region.is_huge() {
            self.huge_objects.fetch_sub(1, Ordering::Relaxed);
        }

        //  Safety:
        //  -   Mapped by `self.mapper` on `self.platform`, and now unlinked.
        //  -   Not accessed afterwards, as per pre-conditions.
        unsafe { self.mapper.unmap(&*self.platform, region) };

        self.deallocations.fetch_add(1, Ordering::Relaxed);

        Ok(size)
    }

    /// Returns the size of the live large object starting at `pointer`, if any.
    pub fn size_of(&self, pointer: NonNull<u8>) -> Option<usize> {
        let address = pointer.as_ptr() as usize;

        self.registries.iter().find_map(|registry| registry.lock().find(address).map(|object| object.size))
    }

    /// Returns the number of live large objects on `node`.
    pub fn numa_objects(&self, node: NodeIndex) -> u64 {
        self.registries.get(node.index()).map_or(0, |registry| registry.lock().usage.objects)
    }

    /// Returns the number of live bytes, as requested, on `node`.
    pub fn numa_bytes(&self, node: NodeIndex) -> u64 {
        self.registries.get(node.index()).map_or(0, |registry| registry.lock().usage.bytes)
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> LargeObjectStats {
        let nodes: Vec<_> = self.registries.iter().map(|registry| registry.lock().usage).collect();

        LargeObjectStats {
            objects: nodes.iter().map(|usage| usage.objects).sum(),
            bytes: nodes.iter().map(|usage| usage.bytes).sum(),
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            huge_objects: self.huge_objects.load(Ordering::Relaxed),
            huge_page_fallbacks: self.mapper.huge_page_fallbacks(),
            bind_failures: self.mapper.bind_failures(),
            nodes,
        }
    }

    /// Checks that the per-node accounting of each registry matches its records.
    pub fn validate(&self) -> bool {
        self.registries.iter().enumerate().all(|(node, registry)| {
            let registry = registry.lock();
            let recorded = registry.recount();

            if recorded != registry.usage {
                debug!("large object registry of node {} accounts {:?}, but records {:?}", node, registry.usage, recorded);
                return false;
            }

            true
        })
    }
}

impl<P> Drop for LargeObjectAllocator<P>
    where
        P: Platform,
{
    fn drop(&mut self) {
        for registry in &mut self.registries {
            let registry = registry.get_mut();

            while let Some(object) = registry.pop() {
                //  Safety:
                //  -   Mapped by `self.mapper` on `self.platform`.
                //  -   `&mut self` guarantees that no object is in use any longer.
                unsafe { self.mapper.unmap(&*self.platform, object.region) };
            }
        }
    }
}

//
//  Implementation
//

struct LargeObject {
    region: Region,
    size: usize,
    allocation_time: Instant,
    next: Option<Box<LargeObject>>,
}

#[derive(Default)]
struct Registry {
    head: Option<Box<LargeObject>>,
    usage: NodeUsage,
}

impl Registry {
    fn push(&mut self, mut object: Box<LargeObject>) {
        self.usage.objects += 1;
        self.usage.bytes += object.size as u64;

        object.next = self.head.take();
        self.head = Some(object);
    }

    fn pop(&mut self) -> Option<Box<LargeObject>> {
        let mut object = self.head.take()?;
        self.head = object.next.take();

        self.usage.objects -= 1;
        self.usage.bytes -= object.size as u64;

        Some(object)
    }

    fn find(&self, address: usize) -> Option<&LargeObject> {
        let mut current = self.head.as_deref();

        while let Some(object) = current {
            if object.region.start() == address {
                return Some(object);
            }

            current = object.next.as_deref();
        }

        None
    }

    fn remove(&mut self, address: usize) -> Option<Box<LargeObject>> {
        let mut link = &mut self.head;

        while link.as_ref().is_some_and(|object| object.region.start() != address) {
            link = match link {
                Some(object) => &mut object.next,
                None => return None,
            };
        }

        let mut object = link.take()?;
        *link = object.next.take();

        self.usage.objects -= 1;
        self.usage.bytes -= object.size as u64;

        Some(object)
    }

    fn recount(&self) -> NodeUsage {
        let mut usage = NodeUsage::default();
        let mut current = self.head.as_deref();

        while let Some(object) = current {
            usage.objects += 1;
            usage.bytes += object.size as u64;
            current = object.next.as_deref();
        }

        usage
    }
}

impl Drop for Registry {
    //  Unlinks iteratively, rather than recursively through `next`.
    fn drop(&mut self) {
        let mut current = self.head.take();

        while let Some(mut object) = current {
            current = object.next.take();
        }
    }
}
