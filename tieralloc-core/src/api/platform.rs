//! Platform
//!
//! The Platform trait is used to request memory directly from the OS, and to steer its placement on NUMA nodes. By
//! abstracting the underlying platform, the allocators can be tested in-process, and ported to other OSes.

use core::ptr::NonNull;

use super::{BindError, MapError, NodeIndex, NumaTopology, PowerOf2};

/// Kind of pages backing a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PageKind {
    /// Pages of `Platform::page_size()`.
    Normal,
    /// Pages of `Platform::huge_page_size()`.
    Huge,
}

/// Abstraction of platform specific memory mapping and NUMA placement.
pub trait Platform: Send + Sync + 'static {
    /// Returns the size of a normal page.
    fn page_size(&self) -> PowerOf2;

    /// Returns the size of a huge page.
    fn huge_page_size(&self) -> PowerOf2;

    /// Returns whether the system has huge pages configured.
    ///
    /// A positive answer is no guarantee: a huge page mapping may still fail, in which case the caller falls back to
    /// normal pages.
    fn huge_pages_available(&self) -> bool;

    /// Returns the NUMA topology of the system.
    fn topology(&self) -> &NumaTopology;

    /// Returns the CPU the calling thread is running on, if known.
    fn current_cpu(&self) -> Option<usize>;

    /// Returns the NUMA node the calling thread is running on, or node 0 if unknown.
    fn current_node(&self) -> NodeIndex {
        self.current_cpu()
            .map(|cpu| self.topology().node_of_cpu(cpu))
            .unwrap_or_default()
    }

    /// Maps a fresh, zeroed, region of memory of `length` bytes.
    ///
    /// `length` is a multiple of the page size matching `pages`; the returned pointer is aligned on that page size.
    fn map(&self, length: usize, pages: PageKind) -> Result<NonNull<u8>, MapError>;

    /// Unmaps a region of memory.
    ///
    /// #   Safety
    ///
    /// The caller should no longer reference the memory after calling this function.
    ///
    /// `unmap` assumes that:
    /// -   `pointer` was returned by `map` on this instance, with `length` as argument.
    /// -   The region has not already been unmapped.
    unsafe fn unmap(&self, pointer: NonNull<u8>, length: usize);

    /// Binds the pages of `[pointer, pointer + length)` to `node`.
    fn bind(&self, pointer: NonNull<u8>, length: usize, node: NodeIndex) -> Result<(), BindError>;

    /// Sets the memory policy of the calling thread to prefer `node`.
    fn bind_thread(&self, node: NodeIndex) -> Result<(), BindError>;
}
