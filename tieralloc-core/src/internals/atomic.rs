//! Atomic helpers.

use core::sync::atomic::{AtomicU64, Ordering};

/// An f64, stored as bits in an AtomicU64.
#[derive(Debug, Default)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    /// Creates an instance.
    pub(crate) fn new(value: f64) -> Self { Self(AtomicU64::new(value.to_bits())) }

    /// Loads the value.
    pub(crate) fn load(&self) -> f64 { f64::from_bits(self.0.load(Ordering::Acquire)) }

    /// Stores a new value.
    pub(crate) fn store(&self, value: f64) { self.0.store(value.to_bits(), Ordering::Release); }

    /// Adds `delta` to the value, clamping the result to `[minimum, maximum]`.
    ///
    /// Returns the new value.
    pub(crate) fn add_clamped(&self, delta: f64, minimum: f64, maximum: f64) -> f64 {
        let update = |bits: u64| Some((f64::from_bits(bits) + delta).clamp(minimum, maximum).to_bits());

        //  The closure always returns Some.
        let previous = match self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, update) {
            Ok(bits) | Err(bits) => bits,
        };

        (f64::from_bits(previous) + delta).clamp(minimum, maximum)
    }
}

#[cfg(test)]
mod tests {

use super::*;

#[test]
fn atomic_f64_load_store() {
    let value = AtomicF64::default();
    assert_eq!(0.0, value.load());

    value.store(0.5);
    assert_eq!(0.5, value.load());
}

#[test]
fn atomic_f64_add_clamped() {
    let value = AtomicF64::new(0.85);

    assert!((value.add_clamped(0.1, 0.0, 1.0) - 0.95).abs() < 1e-9);
    assert_eq!(1.0, value.add_clamped(0.1, 0.0, 1.0));
    assert_eq!(1.0, value.load());

    assert_eq!(0.0, value.add_clamped(-3.0, 0.0, 1.0));
}

}
