//! Security Validator.
//!
//! Tiered validation of allocation requests: bounds on the requested size, and in the higher tiers a scan of the
//! memory about to be handed out for known malicious signatures left in reused memory.
//!
//! The scan compares every 4-byte aligned word against the signatures; a vectorized implementation is used where
//! available, and a scalar one otherwise. Both are exposed, and agree on every input.

use core::{ptr::NonNull, slice, sync::atomic::{AtomicU8, Ordering}};

use super::SecurityRejection;

/// Known malicious signatures, as little-endian words.
pub const SIGNATURES: [u32; 4] = [
    //  NOP sled.
    0x9090_9090,
    //  INT3 sled.
    0xCCCC_CCCC,
    //  Short jump to self.
    0x0000_FEEB,
    //  xor rax, rax; push rax.
    0x50C0_3148,
];

/// Number of leading bytes scanned in `Enhanced` mode.
pub const ENHANCED_SCAN_LENGTH: usize = 32;

/// Largest request accepted in Basic mode; 4 GiB does not fit a 32-bit `usize`.
#[cfg(target_pointer_width = "64")]
pub const BASIC_SIZE_LIMIT: usize = 1 << 32;

/// Largest request accepted in Basic mode; 4 GiB does not fit a 32-bit `usize`.
#[cfg(not(target_pointer_width = "64"))]
pub const BASIC_SIZE_LIMIT: usize = usize::MAX;

/// Security Mode.
///
/// Configured globally, and read on every allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SecurityMode {
    /// No validation.
    Disabled = 0,
    /// Rejects empty requests, and requests above 4 GiB, on 64-bit targets.
    Basic = 1,
    /// Rejects empty requests, and requests above 1 GiB; scans the first 32 bytes.
    #[default]
    Enhanced = 2,
    /// Rejects empty requests, and requests above 256 MiB; scans everything, and zeroes accepted allocations.
    Paranoid = 3,
}

impl SecurityMode {
    /// Returns the largest request accepted in this mode, if any.
    pub const fn size_limit(&self) -> Option<usize> {
        match self {
            SecurityMode::Disabled => None,
            SecurityMode::Basic => Some(BASIC_SIZE_LIMIT),
            SecurityMode::Enhanced => Some(1 << 30),
            SecurityMode::Paranoid => Some(1 << 28),
        }
    }

    /// Returns the number of leading bytes of an allocation of `size` bytes to scan.
    pub fn scan_length(&self, size: usize) -> usize {
        match self {
            SecurityMode::Disabled | SecurityMode::Basic => 0,
            SecurityMode::Enhanced => size.min(ENHANCED_SCAN_LENGTH),
            SecurityMode::Paranoid => size,
        }
    }

    /// Returns whether accepted allocations are zeroed.
    pub const fn zero_fills(&self) -> bool { matches!(self, SecurityMode::Paranoid) }

    /// Checks the size of a request.
    pub fn check_size(&self, size: usize) -> Result<(), SecurityRejection> {
        let Some(limit) = self.size_limit() else { return Ok(()) };

        if size == 0 {
            return Err(SecurityRejection::ZeroSize);
        }

        if size > limit {
            return Err(SecurityRejection::TooLarge { size, limit });
        }

        Ok(())
    }

    /// Validates the size of a request, and the current content of the memory about to be handed out.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `[ptr, ptr + size)` is readable, whenever the mode scans memory and `size` is within its limit.
    pub unsafe fn validate(&self, ptr: NonNull<u8>, size: usize) -> Result<(), SecurityRejection> {
        self.check_size(size)?;

        let length = self.scan_length(size);

        if length == 0 {
            return Ok(());
        }

        //  Safety:
        //  -   Readable, as per pre-conditions.
        let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr() as *const u8, length) };

        scan(bytes).map_or(Ok(()), |offset| Err(SecurityRejection::SuspiciousContent { offset }))
    }

    /// Validates an existing slice of memory, as if it were an allocation of `bytes.len()` bytes.
    pub fn validate_bytes(&self, bytes: &[u8]) -> Result<(), SecurityRejection> {
        self.check_size(bytes.len())?;

        let length = self.scan_length(bytes.len());

        scan(&bytes[..length]).map_or(Ok(()), |offset| Err(SecurityRejection::SuspiciousContent { offset }))
    }
}

/// Atomically accessible SecurityMode.
#[derive(Debug, Default)]
pub(crate) struct AtomicSecurityMode(AtomicU8);

impl AtomicSecurityMode {
    /// Creates an instance.
    pub(crate) fn new(mode: SecurityMode) -> Self { Self(AtomicU8::new(mode as u8)) }

    /// Loads the current mode.
    pub(crate) fn load(&self) -> SecurityMode {
        match self.0.load(Ordering::Relaxed) {
            0 => SecurityMode::Disabled,
            1 => SecurityMode::Basic,
            2 => SecurityMode::Enhanced,
            _ => SecurityMode::Paranoid,
        }
    }

    /// Stores a new mode.
    pub(crate) fn store(&self, mode: SecurityMode) { self.0.store(mode as u8, Ordering::Relaxed) }
}

/// Returns the offset of the first aligned word matching one of `SIGNATURES`, if any.
///
/// Uses the vectorized implementation where available.
pub fn scan(bytes: &[u8]) -> Option<usize> {
    #[cfg(target_arch = "x86_64")]
    {
        scan_sse2(bytes)
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        scan_scalar(bytes)
    }
}

/// Returns the offset of the first aligned word matching one of `SIGNATURES`, if any, one word at a time.
pub fn scan_scalar(bytes: &[u8]) -> Option<usize> {
    scan_words(bytes, 0)
}

/// Returns the offset of the first aligned word matching one of `SIGNATURES`, if any, 16 bytes at a time.
#[cfg(target_arch = "x86_64")]
pub fn scan_sse2(bytes: &[u8]) -> Option<usize> {
    use core::arch::x86_64::{
        __m128i,
        _mm_cmpeq_epi32, _mm_loadu_si128, _mm_movemask_epi8, _mm_or_si128, _mm_set1_epi32, _mm_setzero_si128,
    };

    const LANES: usize = 16;

    let chunks = bytes.len() / LANES;

    //  Safety:
    //  -   SSE2 is part of the x86_64 baseline.
    //  -   Each load reads 16 bytes within `bytes`, as `offset + 16 <= chunks * 16 <= bytes.len()`.
    unsafe {
        let signatures = SIGNATURES.map(|signature| _mm_set1_epi32(signature as i32));

        for chunk in 0..chunks {
            let offset = chunk * LANES;
            let words = _mm_loadu_si128(bytes.as_ptr().add(offset) as *const __m128i);

            let matches = signatures.iter()
                .map(|signature| _mm_cmpeq_epi32(words, *signature))
                .fold(_mm_setzero_si128(), |acc, m| _mm_or_si128(acc, m));

            let mask = _mm_movemask_epi8(matches) as u32;

            if mask != 0 {
                return Some(offset + mask.trailing_zeros() as usize / 4 * 4);
            }
        }
    }

    scan_words(bytes, chunks * LANES)
}

//
//  Implementation
//

fn scan_words(bytes: &[u8], start: usize) -> Option<usize> {
    bytes[start..].chunks_exact(4)
        .position(|word| {
            let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            SIGNATURES.contains(&word)
        })
        .map(|index| start + index * 4)
}
