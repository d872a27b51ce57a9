//! Errors.
//!
//! From the caller's perspective an allocation either succeeds or is denied; the variants only exist so that the
//! runtime can report _why_ it ran out of memory.

use thiserror::Error;

use super::NodeIndex;

/// Failure of an allocation request.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AllocError {
    /// A zero-byte allocation was requested.
    #[error("zero-sized allocation requested")]
    ZeroSize,
    /// The platform declined to map memory.
    #[error("platform mapping failed: {0}")]
    Map(#[from] MapError),
    /// The tiered security validation rejected the request.
    #[error("security validation rejected the request: {0}")]
    Rejected(#[from] SecurityRejection),
    /// The requested alignment is not a power of 2, or exceeds the page size.
    #[error("invalid alignment {0}")]
    InvalidAlignment(usize),
    /// The requested NUMA node does not exist.
    #[error("invalid NUMA node {0}")]
    InvalidNode(NodeIndex),
    /// The size computation overflowed.
    #[error("allocation size overflow")]
    Overflow,
    /// The allocator serving the request has no size class for this size.
    #[error("no size class for {0} bytes")]
    NoSizeClass(usize),
}

/// Failure to map memory from the platform.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MapError {
    /// The platform is out of memory, or out of address space.
    #[error("out of memory")]
    OutOfMemory,
    /// Huge pages were requested, and none could be provided.
    #[error("huge pages unavailable")]
    HugePagesUnavailable,
    /// The OS returned an error.
    #[error("os error {0}")]
    Os(i32),
}

/// Failure to bind memory, or a thread, to a NUMA node.
///
/// Locality is an optimization: this error is counted and logged, it never fails an allocation.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum BindError {
    /// NUMA is not available on this system.
    #[error("NUMA is not available")]
    Unavailable,
    /// The node does not exist.
    #[error("invalid NUMA node {0}")]
    InvalidNode(NodeIndex),
    /// The OS returned an error.
    #[error("os error {0}")]
    Os(i32),
}

/// Failure to release memory.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum FreeError {
    /// Arena memory is only reclaimed in bulk, through `reset` or `destroy`.
    #[error("arena memory cannot be freed individually")]
    ArenaMemory,
    /// The pointer was not handed out by the allocator serving its size.
    #[error("unknown pointer {0:#x}")]
    UnknownPointer(usize),
    /// No slab size class can hold an object of this size.
    #[error("no size class for {0} bytes")]
    UnknownSizeClass(usize),
}

/// Rejection of a request by the security validator.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SecurityRejection {
    /// A zero-sized request.
    #[error("zero-sized request")]
    ZeroSize,
    /// A request above the limit of the current mode.
    #[error("request of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge {
        /// Requested size.
        size: usize,
        /// Limit of the mode.
        limit: usize,
    },
    /// A known malicious signature was found in the memory handed out.
    #[error("suspicious content at offset {offset}")]
    SuspiciousContent {
        /// Offset of the first byte of the signature.
        offset: usize,
    },
}

/// Invalid configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// The default block size is too small, or not a power of 2.
    #[error("default block size {0} must be a power of 2 of at least 4096 bytes")]
    BlockSize(usize),
    /// The large object threshold overlaps the slab range.
    #[error("large object threshold {threshold} must exceed {minimum}")]
    LargeObjectThreshold {
        /// Configured threshold.
        threshold: usize,
        /// Exclusive minimum.
        minimum: usize,
    },
    /// The compaction threshold is not a ratio.
    #[error("compaction threshold {0} must be within [0, 1]")]
    CompactionThreshold(f64),
}
