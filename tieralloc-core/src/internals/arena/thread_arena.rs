//! Thread Arena.
//!
//! The chain of blocks owned by a single thread. A ThreadArena is only ever mutated by its owning thread, or through
//! exclusive access to the whole ArenaAllocator; its counters however are read by any thread.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use log::debug;

use crate::{AllocError, ArenaStats, BlockStats, NodeIndex, Platform, PowerOf2, ARENA_BLOCK_SLOP};
use crate::internals::region::RegionMapper;

use super::block::ArenaBlock;

/// Counters of a ThreadArena.
#[derive(Debug, Default)]
pub(crate) struct ArenaCounters {
    allocations: AtomicU64,
    bytes_requested: AtomicU64,
    bytes_used: AtomicU64,
    wasted_bytes: AtomicU64,
    blocks_allocated: AtomicU64,
    huge_blocks: AtomicU64,
    resets: AtomicU64,
}

impl ArenaCounters {
    /// Accumulates the counters into `stats`.
    pub(crate) fn accumulate(&self, stats: &mut ArenaStats) {
        stats.threads += 1;
        stats.allocations += self.allocations.load(Ordering::Relaxed);
        stats.bytes_requested += self.bytes_requested.load(Ordering::Relaxed);
        stats.bytes_used += self.bytes_used.load(Ordering::Relaxed);
        stats.wasted_bytes += self.wasted_bytes.load(Ordering::Relaxed);
        stats.blocks_allocated += self.blocks_allocated.load(Ordering::Relaxed);
        stats.huge_blocks += self.huge_blocks.load(Ordering::Relaxed);
        stats.resets = stats.resets.max(self.resets.load(Ordering::Relaxed));
    }

    fn record_allocation(&self, requested: usize, rounded: usize, padding: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_requested.fetch_add(requested as u64, Ordering::Relaxed);
        self.bytes_used.fetch_add((rounded + padding) as u64, Ordering::Relaxed);
        self.wasted_bytes.fetch_add((rounded - requested + padding) as u64, Ordering::Relaxed);
    }

    fn record_abandoned(&self, tail: usize) {
        self.bytes_used.fetch_add(tail as u64, Ordering::Relaxed);
        self.wasted_bytes.fetch_add(tail as u64, Ordering::Relaxed);
    }

    fn record_reset(&self) {
        self.bytes_used.store(0, Ordering::Relaxed);
        self.wasted_bytes.store(0, Ordering::Relaxed);
        self.resets.fetch_add(1, Ordering::Relaxed);
    }
}

/// The state shared by all ThreadArenas of an ArenaAllocator.
pub(crate) struct ArenaContext<'a, P> {
    pub(crate) platform: &'a P,
    pub(crate) mapper: &'a RegionMapper,
    pub(crate) block_size: PowerOf2,
}

/// A request to a ThreadArena.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ArenaRequest {
    /// Number of bytes requested by the caller.
    pub(crate) size: usize,
    /// Number of bytes reserved, after rounding to the size class.
    pub(crate) rounded: usize,
    /// Alignment of the result.
    pub(crate) alignment: PowerOf2,
    /// Node to serve the request from; the preferred node if None.
    pub(crate) node: Option<NodeIndex>,
}

/// ThreadArena.
#[derive(Debug)]
pub(crate) struct ThreadArena {
    blocks: Vec<ArenaBlock>,
    //  Index of the current block of each node, within `blocks`.
    current: Vec<Option<usize>>,
    preferred: NodeIndex,
}

impl ThreadArena {
    /// Creates an empty arena, preferring `preferred`.
    pub(crate) fn new(preferred: NodeIndex) -> Self {
        Self { blocks: Vec::new(), current: Vec::new(), preferred }
    }

    /// Allocates from the arena.
    ///
    /// Returns the pointer and the node of the block serving it.
    pub(crate) fn allocate<P>(
        &mut self,
        context: &ArenaContext<'_, P>,
        counters: &ArenaCounters,
        request: ArenaRequest,
    )
        -> Result<(NonNull<u8>, NodeIndex), AllocError>
        where
            P: Platform,
    {
        let node = request.node.unwrap_or(self.preferred);

        if self.current.len() <= node.index() {
            self.current.resize(node.index() + 1, None);
        }

        let current = self.current[node.index()];

        if let Some(index) = current {
            if let Some(result) = self.allocate_from(index, counters, request) {
                return Ok((result, node));
            }
        }

        let next = current.map_or(0, |index| index + 1);

        let candidate = (next..self.blocks.len())
            .find(|index| {
                let block = &self.blocks[*index];
                block.node() == node && block.fits(request.rounded, request.alignment)
            });

        let index = match candidate {
            Some(index) => index,
            None => self.allocate_block(context, counters, request.rounded, node)?,
        };

        if let Some(previous) = current {
            counters.record_abandoned(self.blocks[previous].available());
        }

        self.current[node.index()] = Some(index);

        self.allocate_from(index, counters, request)
            .map(|pointer| (pointer, node))
            .ok_or(AllocError::Overflow)
    }

    /// Rewinds every block, and makes the first block of each node current again.
    pub(crate) fn reset(&mut self, counters: &ArenaCounters) {
        for block in &mut self.blocks {
            block.reset();
        }

        for (node, current) in self.current.iter_mut().enumerate() {
            *current = self.blocks.iter().position(|block| block.node().index() == node);
        }

        counters.record_reset();
    }

    /// Unmaps every block.
    ///
    /// #   Safety
    ///
    /// -   Assumes that no pointer into the blocks is dereferenced afterwards.
    /// -   Assumes that the blocks were mapped by `context`.
    pub(crate) unsafe fn release<P>(&mut self, context: &ArenaContext<'_, P>, counters: &ArenaCounters)
        where
            P: Platform,
    {
        for block in self.blocks.drain(..) {
            if block.is_huge() {
                counters.huge_blocks.fetch_sub(1, Ordering::Relaxed);
            }

            //  Safety:
            //  -   Mapped by `context.mapper`, as per pre-conditions.
            //  -   Not dereferenced afterwards, as per pre-conditions.
            unsafe { context.mapper.unmap(context.platform, block.into_region()) };
        }

        self.current.clear();
    }

    /// Returns a snapshot of each block, in allocation order.
    pub(crate) fn blocks(&self) -> Vec<BlockStats> { self.blocks.iter().map(ArenaBlock::stats).collect() }

    fn allocate_from(&mut self, index: usize, counters: &ArenaCounters, request: ArenaRequest) -> Option<NonNull<u8>> {
        let (pointer, padding) = self.blocks[index].allocate(request.rounded, request.alignment)?;

        counters.record_allocation(request.size, request.rounded, padding);

        Some(pointer)
    }

    #[cold]
    #[inline(never)]
    fn allocate_block<P>(
        &mut self,
        context: &ArenaContext<'_, P>,
        counters: &ArenaCounters,
        rounded: usize,
        node: NodeIndex,
    )
        -> Result<usize, AllocError>
        where
            P: Platform,
    {
        let block_size = context.block_size.value();

        let length = if rounded > block_size / 2 {
            rounded.checked_add(ARENA_BLOCK_SLOP).ok_or(AllocError::Overflow)?
        } else {
            block_size
        };

        let region = context.mapper.map(context.platform, length, node)?;

        debug!("new arena block of {} bytes on node {} for a request of {} bytes", region.length(), node, rounded);

        counters.blocks_allocated.fetch_add(1, Ordering::Relaxed);

        if region.is_huge() {
            counters.huge_blocks.fetch_add(1, Ordering::Relaxed);
        }

        //  Safety:
        //  -   The region was just mapped, hence zeroed and writable.
        let block = unsafe { ArenaBlock::new(region, context.platform.page_size()) };

        self.blocks.push(block);

        Ok(self.blocks.len() - 1)
    }
}
