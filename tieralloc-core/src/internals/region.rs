//! Regions of memory mapped from the Platform.
//!
//! All three allocators obtain their memory through a RegionMapper, which applies the same policy:
//!
//! -   Huge pages are attempted first when enabled, available, and the region spans at least one huge page; any
//!     failure silently falls back to normal pages.
//! -   The region is then bound to the requested NUMA node; a failure only degrades locality, and is counted.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use log::{debug, trace, warn};

use crate::{MapError, NodeIndex, PageKind, Platform};

/// A mapped region of memory.
#[derive(Debug)]
pub(crate) struct Region {
    pointer: NonNull<u8>,
    length: usize,
    pages: PageKind,
    node: NodeIndex,
}

impl Region {
    /// Returns the start of the region.
    pub(crate) fn pointer(&self) -> NonNull<u8> { self.pointer }

    /// Returns the address of the start of the region.
    pub(crate) fn start(&self) -> usize { self.pointer.as_ptr() as usize }

    /// Returns the address one past the end of the region.
    pub(crate) fn end(&self) -> usize { self.start() + self.length }

    /// Returns the length of the region, in bytes.
    pub(crate) fn length(&self) -> usize { self.length }

    /// Returns whether the region is backed by huge pages.
    pub(crate) fn is_huge(&self) -> bool { self.pages == PageKind::Huge }

    /// Returns the node the region was requested for.
    pub(crate) fn node(&self) -> NodeIndex { self.node }

    /// Returns whether `address` lies within the region.
    pub(crate) fn contains(&self, address: usize) -> bool { (self.start()..self.end()).contains(&address) }
}

//  Safety:
//  -   A Region is a handle to memory it exclusively owns; it holds no thread-affine state.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Maps and unmaps Regions, applying the huge pages and NUMA binding policies.
#[derive(Debug, Default)]
pub(crate) struct RegionMapper {
    huge_pages: bool,
    numa_aware: bool,
    warned: AtomicBool,
    huge_page_fallbacks: AtomicU64,
    bind_failures: AtomicU64,
    mapped_bytes: AtomicU64,
}

impl RegionMapper {
    /// Creates an instance.
    pub(crate) fn new(huge_pages: bool, numa_aware: bool) -> Self {
        Self { huge_pages, numa_aware, ..Self::default() }
    }

    /// Returns whether mappings are bound to their NUMA node.
    pub(crate) fn is_numa_aware(&self) -> bool { self.numa_aware }

    /// Returns the number of huge pages mappings which fell back to normal pages.
    pub(crate) fn huge_page_fallbacks(&self) -> u64 { self.huge_page_fallbacks.load(Ordering::Relaxed) }

    /// Returns the number of failed NUMA bindings.
    pub(crate) fn bind_failures(&self) -> u64 { self.bind_failures.load(Ordering::Relaxed) }

    /// Returns the number of bytes currently mapped.
    pub(crate) fn mapped_bytes(&self) -> u64 { self.mapped_bytes.load(Ordering::Relaxed) }

    /// Maps a region of at least `length` bytes, for `node`.
    #[cold]
    pub(crate) fn map<P>(&self, platform: &P, length: usize, node: NodeIndex) -> Result<Region, MapError>
        where
            P: Platform,
    {
        debug_assert!(length > 0);

        let length = platform.page_size().checked_round_up(length).ok_or(MapError::OutOfMemory)?;

        let region = self.map_huge(platform, length, node)
            .map_or_else(|| self.map_normal(platform, length, node), Ok)?;

        self.mapped_bytes.fetch_add(region.length as u64, Ordering::Relaxed);

        if self.numa_aware && platform.topology().is_available() {
            self.bind(platform, &region);
        }

        Ok(region)
    }

    /// Unmaps a region.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `region` was mapped by this instance, on `platform`.
    /// -   Assumes that no pointer into `region` is dereferenced afterwards.
    pub(crate) unsafe fn unmap<P>(&self, platform: &P, region: Region)
        where
            P: Platform,
    {
        trace!("unmapping {} bytes at {:p}", region.length, region.pointer);

        self.mapped_bytes.fetch_sub(region.length as u64, Ordering::Relaxed);

        //  Safety:
        //  -   `region` was mapped by `platform`, with this length, as per pre-conditions.
        unsafe { platform.unmap(region.pointer, region.length) };
    }

    fn map_huge<P>(&self, platform: &P, length: usize, node: NodeIndex) -> Option<Region>
        where
            P: Platform,
    {
        let huge_page_size = platform.huge_page_size();

        if !self.huge_pages || length < huge_page_size.value() || !platform.huge_pages_available() {
            return None;
        }

        let length = huge_page_size.checked_round_up(length)?;

        match platform.map(length, PageKind::Huge) {
            Ok(pointer) => {
                debug!("mapped {} bytes of huge pages at {:p}", length, pointer);
                Some(Region { pointer, length, pages: PageKind::Huge, node })
            },
            Err(error) => {
                self.huge_page_fallbacks.fetch_add(1, Ordering::Relaxed);
                debug!("huge pages mapping of {} bytes failed ({}), falling back to normal pages", length, error);
                None
            },
        }
    }

    fn map_normal<P>(&self, platform: &P, length: usize, node: NodeIndex) -> Result<Region, MapError>
        where
            P: Platform,
    {
        let pointer = platform.map(length, PageKind::Normal)
            .map_err(|error| {
                debug!("mapping of {} bytes failed: {}", length, error);
                error
            })?;

        trace!("mapped {} bytes at {:p}", length, pointer);

        Ok(Region { pointer, length, pages: PageKind::Normal, node })
    }

    fn bind<P>(&self, platform: &P, region: &Region)
        where
            P: Platform,
    {
        let Err(error) = platform.bind(region.pointer, region.length, region.node) else { return };

        self.bind_failures.fetch_add(1, Ordering::Relaxed);

        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("binding {} bytes to NUMA node {} failed ({}); locality is degraded", region.length, region.node, error);
        } else {
            debug!("binding {} bytes to NUMA node {} failed ({})", region.length, region.node, error);
        }
    }
}
