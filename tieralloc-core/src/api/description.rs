//! Description of various properties of the allocations.

pub use crate::utils::{PowerOf2, CACHE_LINE_SIZE};

/// Size classes of the arenas, in ascending order.
///
/// Requests are funneled into the smallest class that fits, so that similar requests produce identical slot sizes.
pub const ARENA_SIZE_CLASSES: [usize; 24] = [
    8, 16, 24, 32, 48, 64, 96, 128,
    192, 256, 384, 512, 768, 1024, 1536, 2048,
    3072, 4096, 6144, 8192, 12288, 16384, 24576, 32768,
];

/// Size classes of the slabs: powers of 2 from 8 bytes to 64 KiB.
pub const SLAB_SIZE_CLASSES: [usize; 14] = [
    8, 16, 32, 64, 128, 256, 512, 1024,
    2048, 4096, 8192, 16384, 32768, 65536,
];

/// Largest object served by the slabs.
pub const SLAB_MAX_OBJECT_SIZE: usize = SLAB_SIZE_CLASSES[SLAB_SIZE_CLASSES.len() - 1];

/// Minimum number of objects carved out of each slab region.
pub const SLAB_MIN_OBJECTS_PER_REGION: usize = 8;

/// Extra bytes reserved in custom-sized arena blocks.
pub const ARENA_BLOCK_SLOP: usize = 64;

/// Returns the index of the smallest arena size class that can hold `size` bytes.
///
/// Returns None if `size` is 0, or exceeds the largest class.
pub fn arena_size_class(size: usize) -> Option<usize> {
    if size == 0 {
        return None;
    }

    let index = ARENA_SIZE_CLASSES.partition_point(|class| *class < size);

    (index < ARENA_SIZE_CLASSES.len()).then_some(index)
}

/// Returns the number of bytes an arena reserves for a request of `size` bytes.
///
/// Requests beyond the largest class are rounded up to a multiple of the cache line size instead.
pub fn arena_rounded_size(size: usize) -> Option<usize> {
    match arena_size_class(size) {
        Some(index) => Some(ARENA_SIZE_CLASSES[index]),
        None if size == 0 => None,
        None => CACHE_LINE_SIZE.checked_round_up(size),
    }
}

/// Returns the index of the smallest slab size class that can hold `size` bytes.
///
/// Returns None if `size` is 0, or exceeds `SLAB_MAX_OBJECT_SIZE`.
pub fn slab_size_class(size: usize) -> Option<usize> {
    if size == 0 || size > SLAB_MAX_OBJECT_SIZE {
        return None;
    }

    let rounded = size.next_power_of_two().max(SLAB_SIZE_CLASSES[0]);

    Some((rounded.trailing_zeros() - SLAB_SIZE_CLASSES[0].trailing_zeros()) as usize)
}

/// Kind of object being allocated, as known by the object model of the runtime.
///
/// The kind is only used to route requests to a dedicated arena, and to keep per-kind statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Anything else.
    #[default]
    Generic,
    /// Class instance.
    Instance,
    /// Function, or closure.
    Function,
    /// String.
    String,
    /// Array.
    Array,
    /// Hash map.
    HashMap,
}

/// Arena serving a request, when the request is served by an arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArenaKind {
    /// Arena of everything without a dedicated arena.
    General,
    /// Arena of containers; also serves cache-aligned requests.
    Object,
    /// Arena of strings.
    String,
}

impl ObjectKind {
    /// Returns the arena dedicated to this kind of object.
    pub fn arena(&self) -> ArenaKind {
        match self {
            ObjectKind::String => ArenaKind::String,
            ObjectKind::Array | ObjectKind::HashMap => ArenaKind::Object,
            ObjectKind::Generic | ObjectKind::Instance | ObjectKind::Function => ArenaKind::General,
        }
    }
}

impl ArenaKind {
    /// Returns the default block size of this arena, derived from the configured default block size.
    ///
    /// The result is never smaller than `minimum`.
    pub fn block_size(&self, default: PowerOf2, minimum: PowerOf2) -> PowerOf2 {
        let divisor = match self {
            ArenaKind::General => 1,
            ArenaKind::Object => 2,
            ArenaKind::String => 4,
        };

        let size = (default.value() / divisor).max(minimum.value());

        PowerOf2::new(size).unwrap_or(default)
    }
}

/// Category
///
/// The Category of an allocation, that is the allocator serving it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    /// Served by one of the arenas; only reclaimed in bulk.
    Arena(ArenaKind),
    /// Served by the slabs; freed individually, and recycled.
    Slab,
    /// Served by a dedicated mapping; freed individually.
    Large,
}

#[cfg(test)]
mod tests {

use super::*;

#[test]
fn arena_size_class_smallest_fit() {
    fn class(size: usize) -> Option<usize> { arena_size_class(size).map(|index| ARENA_SIZE_CLASSES[index]) }

    assert_eq!(None, class(0));
    assert_eq!(Some(8), class(1));
    assert_eq!(Some(8), class(8));
    assert_eq!(Some(16), class(9));
    assert_eq!(Some(24), class(17));
    assert_eq!(Some(128), class(100));
    assert_eq!(Some(192), class(129));
    assert_eq!(Some(32768), class(32768));
    assert_eq!(None, class(32769));
}

#[test]
fn arena_size_class_exhaustive() {
    for size in 1..=ARENA_SIZE_CLASSES[ARENA_SIZE_CLASSES.len() - 1] {
        let index = arena_size_class(size).unwrap();

        assert!(ARENA_SIZE_CLASSES[index] >= size, "{}", size);
        assert!(index == 0 || ARENA_SIZE_CLASSES[index - 1] < size, "{}", size);
    }
}

#[test]
fn arena_size_class_idempotent() {
    for (index, class) in ARENA_SIZE_CLASSES.iter().enumerate() {
        assert_eq!(Some(index), arena_size_class(*class));
    }
}

#[test]
fn arena_rounded_size_beyond_classes() {
    assert_eq!(None, arena_rounded_size(0));
    assert_eq!(Some(128), arena_rounded_size(100));
    assert_eq!(Some(32768 + 64), arena_rounded_size(32769));
    assert_eq!(Some(70016), arena_rounded_size(70000));
    assert_eq!(None, arena_rounded_size(usize::MAX));
}

#[test]
fn slab_size_class_powers_of_2() {
    fn class(size: usize) -> Option<usize> { slab_size_class(size).map(|index| SLAB_SIZE_CLASSES[index]) }

    assert_eq!(None, class(0));
    assert_eq!(Some(8), class(1));
    assert_eq!(Some(8), class(8));
    assert_eq!(Some(16), class(9));
    assert_eq!(Some(64), class(64));
    assert_eq!(Some(128), class(65));
    assert_eq!(Some(65536), class(65536));
    assert_eq!(None, class(65537));
}

#[test]
fn object_kind_routing() {
    assert_eq!(ArenaKind::General, ObjectKind::Generic.arena());
    assert_eq!(ArenaKind::General, ObjectKind::Instance.arena());
    assert_eq!(ArenaKind::General, ObjectKind::Function.arena());
    assert_eq!(ArenaKind::String, ObjectKind::String.arena());
    assert_eq!(ArenaKind::Object, ObjectKind::Array.arena());
    assert_eq!(ArenaKind::Object, ObjectKind::HashMap.arena());
}

#[test]
fn arena_kind_block_size() {
    let default = PowerOf2::new(2 * 1024 * 1024).unwrap();
    let minimum = PowerOf2::new(4096).unwrap();

    assert_eq!(2 * 1024 * 1024, ArenaKind::General.block_size(default, minimum).value());
    assert_eq!(1024 * 1024, ArenaKind::Object.block_size(default, minimum).value());
    assert_eq!(512 * 1024, ArenaKind::String.block_size(default, minimum).value());

    assert_eq!(4096, ArenaKind::String.block_size(minimum, minimum).value());
}

}
