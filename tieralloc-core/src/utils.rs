//! A collection of utilities.

use core::ptr::NonNull;

mod power_of_2;

pub use power_of_2::PowerOf2;

/// Size of a cache line, the default alignment for cache-friendly allocations.
pub const CACHE_LINE_SIZE: PowerOf2 = unsafe { PowerOf2::new_unchecked(64) };

/// Returns whether the pointer is sufficiently aligned for the given alignment.
pub(crate) fn is_sufficiently_aligned_for(ptr: NonNull<u8>, alignment: PowerOf2) -> bool {
    alignment.is_aligned(ptr.as_ptr() as usize)
}

/// Issues write-prefetch hints for `[ptr, ptr + size)`, one per cache line.
///
/// Hints only; never faults, even on invalid addresses.
#[inline]
pub(crate) fn prefetch_write(ptr: NonNull<u8>, size: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        use core::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};

        let start = ptr.as_ptr() as usize;

        for offset in (0..size).step_by(CACHE_LINE_SIZE.value()) {
            //  Safety:
            //  -   Prefetching is a hint, and does not dereference the address.
            unsafe { _mm_prefetch::<_MM_HINT_T0>((start + offset) as *const i8) };
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (ptr, size);
    }
}

/// Returns the current time, in nanoseconds, relative to `origin`.
pub(crate) fn elapsed_nanos(origin: std::time::Instant) -> u64 {
    u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
}
