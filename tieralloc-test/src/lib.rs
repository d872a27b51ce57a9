//! Test helpers shared by the tieralloc crates.

mod bursty;

pub use bursty::{Bursty, BurstyBuilder};
