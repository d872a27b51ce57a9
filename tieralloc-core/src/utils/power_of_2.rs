//! An integer guaranteed to be a PowerOf2.
//!
//! Page sizes, huge page sizes and alignments are all powers of 2; encoding it in the type lets rounding be a mask.

use core::{num, ops};

/// PowerOf2
///
/// An integral guaranteed to be non-zero and a power of 2.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PowerOf2(num::NonZeroUsize);

impl PowerOf2 {
    /// Creates a new instance of PowerOf2.
    ///
    /// Or nothing if the value is not a power of 2.
    pub const fn new(value: usize) -> Option<PowerOf2> {
        if value.count_ones() == 1 {
            //  Safety:
            //  -   Value is a power of 2, as per the if check.
            Some(unsafe { PowerOf2::new_unchecked(value) })
        } else {
            None
        }
    }

    /// Creates a new instance of PowerOf2.
    ///
    /// #   Safety
    ///
    /// Assumes that the value is a power of 2.
    pub const unsafe fn new_unchecked(value: usize) -> PowerOf2 {
        //  Safety:
        //  -   A power of 2 cannot be 0.
        PowerOf2(num::NonZeroUsize::new_unchecked(value))
    }

    /// Returns the inner value.
    pub const fn value(&self) -> usize { self.0.get() }

    /// Rounds the value up to the nearest higher multiple of `self`.
    ///
    /// Returns None on overflow.
    pub const fn checked_round_up(&self, n: usize) -> Option<usize> {
        let mask = self.mask();

        match n.checked_add(mask) {
            Some(n) => Some(n & !mask),
            None => None,
        }
    }

    /// Returns whether `address` is a multiple of `self`.
    pub const fn is_aligned(&self, address: usize) -> bool { address & self.mask() == 0 }

    /// Returns the number of bytes to add to `address` to reach the next multiple of `self`.
    pub const fn padding_for(&self, address: usize) -> usize { address.wrapping_neg() & self.mask() }

    const fn bit_index(&self) -> usize { self.value().trailing_zeros() as usize }

    const fn mask(&self) -> usize { self.value() - 1 }
}

impl ops::Div<PowerOf2> for usize {
    type Output = usize;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn div(self, rhs: PowerOf2) -> usize { self >> rhs.bit_index() }
}

impl ops::Rem<PowerOf2> for usize {
    type Output = usize;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn rem(self, rhs: PowerOf2) -> usize { self & rhs.mask() }
}

#[cfg(test)]
mod tests {

use super::*;

fn pow2(value: usize) -> PowerOf2 { PowerOf2::new(value).expect("Power of 2") }

#[test]
fn power_of_2_new() {
    fn new(value: usize) -> Option<usize> {
        PowerOf2::new(value).map(|p| p.value())
    }

    assert_eq!(None, new(0));
    assert_eq!(Some(1), new(1));
    assert_eq!(Some(64), new(64));
    assert_eq!(None, new(96));
    assert_eq!(Some(4096), new(4096));
    assert_eq!(None, new(4095));
    assert_eq!(Some(2 * 1024 * 1024), new(2 * 1024 * 1024));
}

#[test]
fn power_of_2_div_rem() {
    let page = pow2(4096);

    assert_eq!(0, 4095 / page);
    assert_eq!(1, 4096 / page);
    assert_eq!(2, 12287 / page);

    assert_eq!(4095, 4095 % page);
    assert_eq!(0, 8192 % page);
    assert_eq!(1, 8193 % page);
}

#[test]
fn power_of_2_checked_round_up() {
    let line = pow2(64);

    assert_eq!(Some(0), line.checked_round_up(0));
    assert_eq!(Some(64), line.checked_round_up(1));
    assert_eq!(Some(64), line.checked_round_up(64));
    assert_eq!(Some(128), line.checked_round_up(100));
    assert_eq!(None, line.checked_round_up(usize::MAX - 10));
}

#[test]
fn power_of_2_alignment() {
    let line = pow2(64);

    assert!(line.is_aligned(0));
    assert!(line.is_aligned(128));
    assert!(!line.is_aligned(130));

    assert_eq!(0, line.padding_for(128));
    assert_eq!(62, line.padding_for(130));
    assert_eq!(1, line.padding_for(191));
}

}
