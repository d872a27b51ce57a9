//! Arena Block.
//!
//! A contiguous region served by a bump cursor.

use core::ptr::{self, NonNull};

use crate::{BlockStats, NodeIndex, PowerOf2};
use crate::internals::region::Region;

/// ArenaBlock.
#[derive(Debug)]
pub(crate) struct ArenaBlock {
    region: Region,
    cursor: usize,
}

impl ArenaBlock {
    /// Creates a block over a freshly mapped region, touching each of its pages.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `region` is freshly mapped, zeroed, and writable.
    pub(crate) unsafe fn new(region: Region, page_size: PowerOf2) -> Self {
        let start = region.pointer().as_ptr();

        for offset in (0..region.length()).step_by(page_size.value()) {
            //  Safety:
            //  -   `offset` is within the region.
            //  -   The region is zeroed, so writing 0 leaves it unchanged.
            unsafe { ptr::write_volatile(start.add(offset), 0) };
        }

        let cursor = region.start();

        Self { region, cursor }
    }

    /// Returns the address of the first byte.
    pub(crate) fn start(&self) -> usize { self.region.start() }

    /// Returns the address one past the last byte.
    pub(crate) fn end(&self) -> usize { self.region.end() }

    /// Returns the number of bytes handed out.
    pub(crate) fn used(&self) -> usize { self.cursor - self.start() }

    /// Returns the number of bytes still available.
    pub(crate) fn available(&self) -> usize { self.end() - self.cursor }

    /// Returns the node the block was requested for.
    pub(crate) fn node(&self) -> NodeIndex { self.region.node() }

    /// Returns whether the block is backed by huge pages.
    pub(crate) fn is_huge(&self) -> bool { self.region.is_huge() }

    /// Returns whether `size` bytes aligned on `alignment` fit in the block.
    pub(crate) fn fits(&self, size: usize, alignment: PowerOf2) -> bool {
        alignment.padding_for(self.cursor)
            .checked_add(size)
            .map_or(false, |needed| needed <= self.available())
    }

    /// Carves `size` bytes, aligned on `alignment`, out of the block.
    ///
    /// Returns the pointer, and the number of padding bytes skipped to satisfy the alignment.
    pub(crate) fn allocate(&mut self, size: usize, alignment: PowerOf2) -> Option<(NonNull<u8>, usize)> {
        if !self.fits(size, alignment) {
            return None;
        }

        let padding = alignment.padding_for(self.cursor);
        let address = self.cursor + padding;

        self.cursor = address + size;

        //  Safety:
        //  -   `address` lies within the region, whose start is non-null.
        let pointer = unsafe { self.region.pointer().as_ptr().add(address - self.start()) };

        NonNull::new(pointer).map(|pointer| (pointer, padding))
    }

    /// Rewinds the cursor to the start of the block.
    pub(crate) fn reset(&mut self) { self.cursor = self.start(); }

    /// Returns a snapshot of the block.
    pub(crate) fn stats(&self) -> BlockStats {
        BlockStats {
            start: self.start(),
            end: self.end(),
            used: self.used(),
            node: self.node(),
            huge_pages: self.is_huge(),
        }
    }

    /// Returns the underlying region, for unmapping.
    pub(crate) fn into_region(self) -> Region { self.region }
}

#[cfg(test)]
mod tests {

use super::*;
use crate::internals::{region::RegionMapper, test::TestPlatform};

fn pow2(value: usize) -> PowerOf2 { PowerOf2::new(value).unwrap() }

fn with_block<F>(length: usize, f: F)
    where
        F: FnOnce(&mut ArenaBlock),
{
    let platform = TestPlatform::default();
    let mapper = RegionMapper::new(false, false);

    let region = mapper.map(&platform, length, NodeIndex::new(0)).unwrap();
    let mut block = unsafe { ArenaBlock::new(region, pow2(TestPlatform::PAGE_SIZE)) };

    f(&mut block);

    unsafe { mapper.unmap(&platform, block.into_region()) };
}

#[test]
fn block_bump() {
    with_block(4096, |block| {
        assert_eq!(0, block.used());
        assert_eq!(4096, block.available());

        let (first, padding) = block.allocate(128, pow2(8)).unwrap();
        assert_eq!(block.start(), first.as_ptr() as usize);
        assert_eq!(0, padding);

        let (second, _) = block.allocate(64, pow2(8)).unwrap();
        assert_eq!(block.start() + 128, second.as_ptr() as usize);

        assert_eq!(192, block.used());
        assert_eq!(4096 - 192, block.available());
    });
}

#[test]
fn block_alignment() {
    with_block(4096, |block| {
        block.allocate(8, pow2(8)).unwrap();

        let (aligned, padding) = block.allocate(64, pow2(64)).unwrap();

        assert_eq!(0, aligned.as_ptr() as usize % 64);
        assert_eq!(56, padding);
        assert_eq!(128, block.used());
    });
}

#[test]
fn block_exhaustion() {
    with_block(4096, |block| {
        assert!(block.fits(4096, pow2(8)));
        assert!(!block.fits(4097, pow2(8)));
        assert!(!block.fits(usize::MAX, pow2(8)));

        block.allocate(4000, pow2(8)).unwrap();

        assert!(block.allocate(128, pow2(8)).is_none());
        assert_eq!(4000, block.used());

        block.allocate(96, pow2(8)).unwrap();
        assert_eq!(0, block.available());
    });
}

#[test]
fn block_reset() {
    with_block(4096, |block| {
        let (first, _) = block.allocate(100, pow2(8)).unwrap();
        block.allocate(200, pow2(8)).unwrap();

        block.reset();

        assert_eq!(0, block.used());
        assert_eq!(Some((first, 0)), block.allocate(100, pow2(8)));
    });
}

#[test]
fn block_stats() {
    with_block(8192, |block| {
        block.allocate(24, pow2(8)).unwrap();

        let stats = block.stats();

        assert_eq!(block.start(), stats.start);
        assert_eq!(block.start() + 8192, stats.end);
        assert_eq!(24, stats.used);
        assert_eq!(NodeIndex::new(0), stats.node);
        assert!(!stats.huge_pages);
    });
}

}
