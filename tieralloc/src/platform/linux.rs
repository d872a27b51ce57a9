//! Implementation of Linux specific calls.

use core::ptr::{self, NonNull};

use tieralloc_core::{BindError, MapError, NodeIndex, NumaTopology, PageKind, Platform, PowerOf2, MAX_NODES};

use crate::topology;

/// Implementation of the Platform trait, for Linux.
#[derive(Debug)]
pub struct LinuxPlatform {
    topology: &'static NumaTopology,
    page_size: PowerOf2,
    huge_pages_available: bool,
}

impl LinuxPlatform {
    //  2 MB
    const HUGE_PAGE_SIZE: PowerOf2 = unsafe { PowerOf2::new_unchecked(2 * 1024 * 1024) };

    //  Fallback, if sysconf fails.
    const DEFAULT_PAGE_SIZE: PowerOf2 = unsafe { PowerOf2::new_unchecked(4096) };

    /// Creates an instance, over the process-wide topology.
    pub fn new() -> Self {
        let topology = topology::detect();
        let page_size = query_page_size();
        let huge_pages_available = query_huge_pages();

        log::debug!("Linux platform: page size {}, huge pages {}, {} NUMA node(s)",
            page_size.value(), huge_pages_available, topology.node_count());

        Self { topology, page_size, huge_pages_available }
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self { Self::new() }
}

impl Platform for LinuxPlatform {
    fn page_size(&self) -> PowerOf2 { self.page_size }

    fn huge_page_size(&self) -> PowerOf2 { Self::HUGE_PAGE_SIZE }

    fn huge_pages_available(&self) -> bool { self.huge_pages_available }

    fn topology(&self) -> &NumaTopology { self.topology }

    fn current_cpu(&self) -> Option<usize> { current_cpu() }

    fn map(&self, length: usize, pages: PageKind) -> Result<NonNull<u8>, MapError> {
        const MAP_HUGE_SHIFT: u8 = 26;

        const MAP_HUGE_2MB: libc::c_int = 21 << MAP_HUGE_SHIFT;

        let extra_flags = match pages {
            PageKind::Normal => 0,
            PageKind::Huge => libc::MAP_HUGETLB | MAP_HUGE_2MB,
        };

        mmap_allocate(length, extra_flags).map_err(|errno| match (errno, pages) {
            (_, PageKind::Huge) => MapError::HugePagesUnavailable,
            (libc::ENOMEM, PageKind::Normal) => MapError::OutOfMemory,
            (errno, PageKind::Normal) => MapError::Os(errno),
        })
    }

    unsafe fn unmap(&self, pointer: NonNull<u8>, length: usize) {
        //  Safety:
        //  -   `pointer` and `length` describe a mapping, as per pre-conditions.
        unsafe { munmap_deallocate(pointer, length) };
    }

    fn bind(&self, pointer: NonNull<u8>, length: usize, node: NodeIndex) -> Result<(), BindError> {
        let mask = self.node_mask(node)?;

        //  Safety:
        //  -   `mask` outlives the call, and holds `MASK_BITS` bits.
        //  -   mbind only alters the policy of the range, which is owned by the caller.
        let result = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                pointer.as_ptr() as libc::c_ulong,
                length as libc::c_ulong,
                MPOL_BIND,
                &mask as *const libc::c_ulong,
                MASK_BITS as libc::c_ulong + 1,
                0 as libc::c_uint,
            )
        };

        check_syscall(result)
    }

    fn bind_thread(&self, node: NodeIndex) -> Result<(), BindError> { topology::bind_thread(node) }
}

impl LinuxPlatform {
    fn node_mask(&self, node: NodeIndex) -> Result<libc::c_ulong, BindError> {
        if !self.topology.is_available() {
            return Err(BindError::Unavailable);
        }

        if !self.topology.contains(node) || node.index() >= MASK_BITS {
            return Err(BindError::InvalidNode(node));
        }

        Ok(1 << node.index())
    }
}

//
//  Implementation
//

const MPOL_PREFERRED: libc::c_int = 1;
const MPOL_BIND: libc::c_int = 2;

//  A single word is enough to hold all nodes.
const MASK_BITS: usize = MAX_NODES;

const _: () = assert!(MASK_BITS <= libc::c_ulong::BITS as usize);

/// Returns the CPU the calling thread is running on, if the kernel knows.
pub(crate) fn current_cpu() -> Option<usize> {
    //  Safety:
    //  -   No pre-condition.
    let cpu = unsafe { libc::sched_getcpu() };

    usize::try_from(cpu).ok()
}

/// Sets the memory policy of the calling thread to prefer the nodes of `mask`.
pub(crate) fn set_preferred_node(mask: &libc::c_ulong) -> Result<(), BindError> {
    //  Safety:
    //  -   `mask` outlives the call, and holds `MASK_BITS` bits.
    let result = unsafe {
        libc::syscall(
            libc::SYS_set_mempolicy,
            MPOL_PREFERRED,
            mask as *const libc::c_ulong,
            MASK_BITS as libc::c_ulong + 1,
        )
    };

    check_syscall(result)
}

fn check_syscall(result: libc::c_long) -> Result<(), BindError> {
    if result == 0 {
        Ok(())
    } else {
        Err(BindError::Os(last_errno()))
    }
}

fn last_errno() -> i32 { std::io::Error::last_os_error().raw_os_error().unwrap_or(0) }

fn query_page_size() -> PowerOf2 {
    //  Safety:
    //  -   No pre-condition.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    usize::try_from(size).ok()
        .and_then(PowerOf2::new)
        .unwrap_or(LinuxPlatform::DEFAULT_PAGE_SIZE)
}

fn query_huge_pages() -> bool {
    std::fs::read_to_string("/proc/sys/vm/nr_hugepages")
        .ok()
        .and_then(|content| content.trim().parse::<u64>().ok())
        .is_some_and(|pages| pages > 0)
}

//  Maps `size` bytes of zeroed memory, or returns the errno.
fn mmap_allocate(size: usize, extra_flags: libc::c_int) -> Result<NonNull<u8>, i32> {
    const PROT: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;
    const FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    //  Safety:
    //  -   An anonymous mapping, at an address of the kernel's choosing, cannot alias existing memory.
    let result = unsafe { libc::mmap(ptr::null_mut(), size, PROT, FLAGS | extra_flags, -1, 0) };

    if result == libc::MAP_FAILED {
        return Err(last_errno());
    }

    NonNull::new(result as *mut u8).ok_or(libc::ENOMEM)
}

//  Unmaps a mapping.
//
//  #   Safety
//
//  -   Assumes `pointer` and `size` describe a mapping obtained from `mmap_allocate`.
unsafe fn munmap_deallocate(pointer: NonNull<u8>, size: usize) {
    //  Safety:
    //  -   As per pre-conditions.
    let result = unsafe { libc::munmap(pointer.as_ptr() as *mut libc::c_void, size) };

    debug_assert!(result == 0, "Could not munmap {:x}, {}: {}", pointer.as_ptr() as usize, size, last_errno());
}

// mod tests
