//! Arena Allocator.
//!
//! Each thread allocates from its own ThreadArena, a chain of blocks served by bump cursors, without any locking. The
//! ThreadArena of the calling thread is found through a thread-local cache, keyed by the generation of the
//! ArenaAllocator; on first use, a slot is registered under a short-lived lock.
//!
//! Each entry of the thread-local cache is a guard, which releases the slot of its thread when the thread exits. The
//! guard only holds a weak reference to the registry of slots, so that it is harmless if the ArenaAllocator is gone.
//!
//! Arena memory is otherwise only reclaimed in bulk: `reset` rewinds all cursors, `destroy` unmaps all blocks.

mod block;
mod thread_arena;

use core::{
    cell::{RefCell, UnsafeCell},
    ptr::{self, NonNull},
    sync::atomic::{AtomicU64, Ordering},
};

use std::{sync::{Arc, Weak}, thread::{self, ThreadId}};

use log::debug;
use parking_lot::Mutex;

use crate::{AllocError, ArenaStats, BlockStats, NodeIndex, Platform, PowerOf2, arena_rounded_size};
use crate::internals::region::RegionMapper;

use thread_arena::{ArenaContext, ArenaCounters, ArenaRequest, ThreadArena};

/// Arena Allocator.
pub struct ArenaAllocator<P>
    where
        P: Platform,
{
    shared: Arc<ArenaShared<P>>,
    compactions: AtomicU64,
}

impl<P> ArenaAllocator<P>
    where
        P: Platform,
{
    /// Creates an instance, whose blocks are `block_size` bytes by default.
    pub fn new(platform: Arc<P>, block_size: PowerOf2, huge_pages: bool, numa_aware: bool) -> Self {
        let mapper = RegionMapper::new(huge_pages, numa_aware);

        let shared = ArenaShared {
            generation: AtomicU64::new(next_generation()),
            platform,
            mapper,
            block_size,
            slots: Mutex::new(Vec::new()),
        };

        Self { shared: Arc::new(shared), compactions: AtomicU64::new(0) }
    }

    /// Returns the default block size.
    pub fn block_size(&self) -> PowerOf2 { self.shared.block_size }

    /// Allocates `size` bytes, from the preferred node of the calling thread.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate(size, MINIMUM_ALIGNMENT, None).map(|(pointer, _)| pointer)
    }

    /// Allocates `size` bytes, from `node`.
    ///
    /// Binding new blocks to `node` is best effort; a failure only degrades locality.
    pub fn alloc_numa(&self, size: usize, node: NodeIndex) -> Result<NonNull<u8>, AllocError> {
        self.allocate(size, MINIMUM_ALIGNMENT, Some(node)).map(|(pointer, _)| pointer)
    }

    /// Allocates `size` bytes, aligned on `alignment`, from the preferred node of the calling thread.
    ///
    /// `alignment` should be a power of 2, no larger than the page size.
    pub fn alloc_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        let alignment = PowerOf2::new(alignment)
            .filter(|alignment| *alignment <= self.shared.platform.page_size())
            .ok_or(AllocError::InvalidAlignment(alignment))?;

        self.allocate(size, alignment.max(MINIMUM_ALIGNMENT), None).map(|(pointer, _)| pointer)
    }

    /// Allocates `size` bytes, aligned on `alignment`, from `node` or the preferred node of the calling thread.
    ///
    /// Returns the pointer, and the node of the block serving it.
    pub(crate) fn allocate(&self, size: usize, alignment: PowerOf2, node: Option<NodeIndex>)
        -> Result<(NonNull<u8>, NodeIndex), AllocError>
    {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        if let Some(node) = node {
            if !self.shared.platform.topology().contains(node) {
                return Err(AllocError::InvalidNode(node));
            }
        }

        let rounded = arena_rounded_size(size).ok_or(AllocError::Overflow)?;
        let request = ArenaRequest { size, rounded, alignment, node };

        let context = self.shared.context();
        let slot = self.thread_slot();

        //  Safety:
        //  -   The slot belongs to the calling thread, and only this thread accesses its arena through `&self`.
        //  -   The arena is not accessed re-entrantly: neither the platform nor the mapper call back into it.
        let arena = unsafe { &mut *slot.as_ref().arena.get() };

        //  Safety:
        //  -   The slot lives until `release_thread` on this thread, the exit of this thread, or until `&mut self` is
        //      available.
        let counters = unsafe { &slot.as_ref().counters };

        arena.allocate(&context, counters, request)
    }

    /// Rewinds every block of every thread, making all previously allocated bytes available again.
    ///
    /// Blocks are kept, and reused in the same order, so that an identical sequence of allocations after a reset
    /// yields identical pointers.
    ///
    /// #   Safety
    ///
    /// Memory allocated prior to the reset is handed out again; `&mut self` guarantees that no allocation is in
    /// flight, the caller guarantees that no pointer obtained prior to the reset is dereferenced afterwards.
    pub fn reset(&mut self) {
        for slot in self.shared.slots.lock().iter_mut() {
            slot.arena.get_mut().reset(&slot.counters);
        }

        debug!("arena {} reset", self.generation());
    }

    /// Unmaps every block of every thread.
    ///
    /// The allocator remains usable afterwards, starting anew.
    ///
    /// #   Safety
    ///
    /// The caller guarantees that no pointer obtained prior to the destruction is dereferenced afterwards.
    pub fn destroy(&mut self) {
        let generation = self.generation();

        //  The guards of other threads are pruned lazily, once they no longer match the generation.
        let _ = THREAD_ARENAS.try_with(|cache| take_guards(cache, |guard| guard.generation == generation));

        let slots = std::mem::take(&mut *self.shared.slots.lock());

        for slot in slots {
            self.shared.release_slot(slot);
        }

        self.shared.generation.store(next_generation(), Ordering::Relaxed);
    }

    /// Releases the thread arena of the calling thread, unmapping all its blocks.
    ///
    /// #   Safety
    ///
    /// The caller guarantees that no pointer obtained by this thread from this allocator is dereferenced afterwards.
    pub fn release_thread(&self) {
        let generation = self.generation();

        //  Dropping the guard releases the slot; the cache may be gone already, if the thread is exiting.
        let _ = THREAD_ARENAS.try_with(|cache| take_guards(cache, |guard| guard.generation == generation));

        //  The slot may have been registered while the cache was unavailable.
        let owner = thread::current().id();

        let slot = {
            let mut slots = self.shared.slots.lock();
            let index = slots.iter().position(|slot| slot.owner == owner);
            index.map(|index| slots.swap_remove(index))
        };

        if let Some(slot) = slot {
            self.shared.release_slot(slot);
        }
    }

    /// Consolidates the fragmentation statistics of all thread arenas.
    ///
    /// Live objects are never moved; returns the fragmentation ratio.
    pub fn compact(&self) -> f64 {
        self.compactions.fetch_add(1, Ordering::Relaxed);

        self.stats().fragmentation()
    }

    /// Returns the ratio of bytes lost to rounding, padding, and partially filled blocks, over bytes consumed.
    pub fn fragmentation(&self) -> f64 { self.stats().fragmentation() }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats::default();

        for slot in self.shared.slots.lock().iter() {
            slot.counters.accumulate(&mut stats);
        }

        let mapper = &self.shared.mapper;

        stats.bytes_reserved = mapper.mapped_bytes();
        stats.compactions = self.compactions.load(Ordering::Relaxed);
        stats.huge_page_fallbacks = mapper.huge_page_fallbacks();
        stats.bind_failures = mapper.bind_failures();

        stats
    }

    /// Returns a snapshot of the blocks of the calling thread, in allocation order.
    pub fn thread_blocks(&self) -> Vec<BlockStats> {
        let owner = thread::current().id();
        let slots = self.shared.slots.lock();

        let Some(slot) = slots.iter().find(|slot| slot.owner == owner) else { return Vec::new() };

        //  Safety:
        //  -   The arena belongs to the calling thread, which is not allocating at the moment.
        unsafe { (*slot.arena.get()).blocks() }
    }

    fn generation(&self) -> u64 { self.shared.generation.load(Ordering::Relaxed) }

    //  Returns the slot of the calling thread, registering it if necessary.
    fn thread_slot(&self) -> NonNull<ArenaSlot> {
        let generation = self.generation();

        let slot = THREAD_ARENAS.try_with(|cache| {
            let cached = cache.borrow().iter().find(|guard| guard.generation == generation).map(|guard| guard.slot);

            if let Some(slot) = cached {
                return slot;
            }

            let slot = self.register_thread();
            let registry: Weak<ArenaShared<P>> = Arc::downgrade(&self.shared);
            let registry: Weak<dyn SlotRegistry> = registry;

            take_guards(cache, SlotGuard::is_stale);
            cache.borrow_mut().push(SlotGuard { generation, slot, registry });

            slot
        });

        //  Without a cache, the slot lives until `release_thread` or `destroy`.
        slot.unwrap_or_else(|_| self.register_thread())
    }

    #[cold]
    #[inline(never)]
    fn register_thread(&self) -> NonNull<ArenaSlot> {
        let owner = thread::current().id();
        let mut slots = self.shared.slots.lock();

        if let Some(slot) = slots.iter().find(|slot| slot.owner == owner) {
            return NonNull::from(&**slot);
        }

        let shared = &self.shared;
        let preferred =
            if shared.mapper.is_numa_aware() { shared.platform.current_node() } else { NodeIndex::default() };
        let generation = self.generation();

        debug!("arena {} registering thread {:?}, preferring node {}", generation, owner, preferred);

        let slot = Box::new(ArenaSlot {
            owner,
            generation,
            counters: ArenaCounters::default(),
            arena: UnsafeCell::new(ThreadArena::new(preferred)),
        });

        let pointer = NonNull::from(&*slot);
        slots.push(slot);

        pointer
    }
}

impl<P> Drop for ArenaAllocator<P>
    where
        P: Platform,
{
    fn drop(&mut self) { self.destroy(); }
}

//
//  Implementation
//

const MINIMUM_ALIGNMENT: PowerOf2 = unsafe { PowerOf2::new_unchecked(8) };

thread_local! {
    static THREAD_ARENAS: RefCell<Vec<SlotGuard>> = const { RefCell::new(Vec::new()) };
}

fn next_generation() -> u64 {
    static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

//  Removes the guards matching `predicate` from the cache, then drops them once the cache is no longer borrowed.
fn take_guards<F>(cache: &RefCell<Vec<SlotGuard>>, mut predicate: F)
    where
        F: FnMut(&SlotGuard) -> bool,
{
    let taken = {
        let mut cache = cache.borrow_mut();
        let (taken, kept): (Vec<SlotGuard>, Vec<SlotGuard>) = cache.drain(..).partition(|guard| predicate(guard));
        *cache = kept;
        taken
    };

    drop(taken);
}

//  The state of an ArenaAllocator reachable from the thread-local caches.
struct ArenaShared<P> {
    //  Changed by `destroy`, invalidating the guards of the previous generation.
    generation: AtomicU64,
    platform: Arc<P>,
    mapper: RegionMapper,
    block_size: PowerOf2,
    slots: Mutex<Vec<Box<ArenaSlot>>>,
}

impl<P> ArenaShared<P>
    where
        P: Platform,
{
    fn context(&self) -> ArenaContext<'_, P> {
        ArenaContext { platform: &*self.platform, mapper: &self.mapper, block_size: self.block_size }
    }

    fn release_slot(&self, mut slot: Box<ArenaSlot>) {
        let context = self.context();

        //  Safety:
        //  -   The slot is no longer registered, hence no longer reachable by any thread.
        //  -   Pointers into its blocks are no longer dereferenced, as per the pre-conditions of the callers.
        unsafe { slot.arena.get_mut().release(&context, &slot.counters) };
    }
}

//  Type-erased access to the slots of an ArenaAllocator, for the guards.
trait SlotRegistry {
    fn generation(&self) -> u64;

    //  Unregisters and releases `slot`, if still registered under `generation`.
    fn release(&self, generation: u64, slot: NonNull<ArenaSlot>);
}

impl<P> SlotRegistry for ArenaShared<P>
    where
        P: Platform,
{
    fn generation(&self) -> u64 { self.generation.load(Ordering::Relaxed) }

    fn release(&self, generation: u64, slot: NonNull<ArenaSlot>) {
        let slot = {
            let mut slots = self.slots.lock();
            let index = slots.iter()
                .position(|candidate| candidate.generation == generation && ptr::eq(&**candidate, slot.as_ptr()));
            index.map(|index| slots.swap_remove(index))
        };

        if let Some(slot) = slot {
            self.release_slot(slot);
        }
    }
}

//  Entry of the thread-local cache, releasing the slot of its thread on drop.
struct SlotGuard {
    generation: u64,
    slot: NonNull<ArenaSlot>,
    registry: Weak<dyn SlotRegistry>,
}

impl SlotGuard {
    //  Stale guards refer to a dropped allocator, or to a destroyed generation.
    fn is_stale(&self) -> bool {
        self.registry.upgrade().map_or(true, |registry| registry.generation() != self.generation)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.generation, self.slot);
        }
    }
}

//  The ThreadArena of a thread, and its counters.
struct ArenaSlot {
    owner: ThreadId,
    //  Generation of the ArenaAllocator at registration.
    generation: u64,
    counters: ArenaCounters,
    arena: UnsafeCell<ThreadArena>,
}

#[cfg(test)]
mod tests {

use std::sync::Arc;

use tieralloc_test::BurstyBuilder;

use super::*;
use crate::internals::test::TestPlatform;

type TestArena = ArenaAllocator<TestPlatform>;

fn arena(platform: &Arc<TestPlatform>, block_size: usize) -> TestArena {
    TestArena::new(platform.clone(), PowerOf2::new(block_size).unwrap(), true, true)
}

#[test]
fn arena_alloc_zero() {
    let platform = Arc::new(TestPlatform::default());
    let arena = arena(&platform, 4096);

    assert_eq!(Err(AllocError::ZeroSize), arena.alloc(0));
    assert_eq!(0, arena.stats().threads);
}

#[test]
fn arena_alloc_single_block() {
    let platform = Arc::new(TestPlatform::default());
    let arena = arena(&platform, 4096);

    for _ in 0..10 {
        arena.alloc(100).unwrap();
    }

    let blocks = arena.thread_blocks();
    assert_eq!(1, blocks.len());
    assert_eq!(10 * 128, blocks[0].used);

    let stats = arena.stats();
    assert_eq!(1, stats.threads);
    assert_eq!(10, stats.allocations);
    assert_eq!(4096, stats.bytes_reserved);
}

#[test]
fn arena_alloc_aligned() {
    let platform = Arc::new(TestPlatform::default());
    let arena = arena(&platform, 4096);

    arena.alloc(8).unwrap();

    let aligned = arena.alloc_aligned(100, 64).unwrap();
    assert_eq!(0, aligned.as_ptr() as usize % 64);

    assert_eq!(Err(AllocError::InvalidAlignment(48)), arena.alloc_aligned(100, 48));
    assert_eq!(Err(AllocError::InvalidAlignment(8192)), arena.alloc_aligned(100, 8192));
}

#[test]
fn arena_alloc_numa() {
    let platform = Arc::new(TestPlatform::two_nodes());
    let arena = arena(&platform, 4096);

    let (_, node) = arena.allocate(64, MINIMUM_ALIGNMENT, Some(NodeIndex::new(1))).unwrap();
    assert_eq!(NodeIndex::new(1), node);

    arena.alloc_numa(64, NodeIndex::new(0)).unwrap();

    assert_eq!(Err(AllocError::InvalidNode(NodeIndex::new(2))), arena.alloc_numa(64, NodeIndex::new(2)));

    let nodes: Vec<_> = arena.thread_blocks().iter().map(|block| block.node).collect();
    assert_eq!(vec!(NodeIndex::new(1), NodeIndex::new(0)), nodes);
}

#[test]
fn arena_preferred_node() {
    let platform = Arc::new(TestPlatform::two_nodes());
    platform.set_current_cpu(3);

    let arena = arena(&platform, 4096);

    let (_, node) = arena.allocate(64, MINIMUM_ALIGNMENT, None).unwrap();
    assert_eq!(NodeIndex::new(1), node);
}

#[test]
fn arena_reset_is_deterministic() {
    let platform = Arc::new(TestPlatform::default());
    let mut arena = arena(&platform, 4096);

    let sizes = [100, 3000, 17, 2500, 800, 64, 3500, 12, 9000];

    let before: Vec<_> = sizes.iter().map(|size| arena.alloc(*size).unwrap()).collect();
    let reserved = arena.stats().bytes_reserved;

    arena.reset();

    let after: Vec<_> = sizes.iter().map(|size| arena.alloc(*size).unwrap()).collect();

    assert_eq!(before, after);
    assert_eq!(reserved, arena.stats().bytes_reserved);
    assert_eq!(1, arena.stats().resets);
}

#[test]
fn arena_destroy() {
    let platform = Arc::new(TestPlatform::default());
    let mut arena = arena(&platform, 4096);

    arena.alloc(100).unwrap();
    arena.alloc(5000).unwrap();
    assert_eq!(2, platform.live_mappings());

    arena.destroy();

    assert_eq!(0, platform.live_mappings());
    assert_eq!(0, arena.stats().threads);

    //  Usable anew.
    arena.alloc(100).unwrap();
    assert_eq!(1, platform.live_mappings());

    drop(arena);
    assert_eq!(0, platform.live_mappings());
}

#[test]
fn arena_release_thread() {
    let platform = Arc::new(TestPlatform::default());
    let arena = arena(&platform, 4096);

    arena.alloc(100).unwrap();
    assert_eq!(1, arena.stats().threads);

    arena.release_thread();

    assert_eq!(0, arena.stats().threads);
    assert_eq!(0, platform.live_mappings());

    arena.alloc(100).unwrap();
    assert_eq!(1, arena.stats().threads);
}

#[test]
fn arena_fragmentation() {
    let platform = Arc::new(TestPlatform::default());
    let arena = arena(&platform, 4096);

    assert_eq!(0.0, arena.fragmentation());

    arena.alloc(96).unwrap();
    assert_eq!(0.0, arena.fragmentation());

    arena.alloc(65).unwrap();
    assert_eq!(31.0 / 192.0, arena.fragmentation());

    assert_eq!(31.0 / 192.0, arena.compact());
    assert_eq!(1, arena.stats().compactions);
}

#[test]
fn arena_independent_allocators() {
    let platform = Arc::new(TestPlatform::default());

    let first = arena(&platform, 4096);
    let second = arena(&platform, 8192);

    first.alloc(64).unwrap();
    second.alloc(64).unwrap();

    assert_eq!(4096, first.stats().bytes_reserved);
    assert_eq!(8192, second.stats().bytes_reserved);
}

#[test]
fn arena_per_thread() {
    const THREADS: usize = 4;

    struct Global {
        _platform: Arc<TestPlatform>,
        arena: TestArena,
    }

    let platform = Arc::new(TestPlatform::default());
    let global = Global { arena: arena(&platform, 4096), _platform: platform };

    let mut builder = BurstyBuilder::new(global, vec!(Vec::<usize>::new(); THREADS));

    builder.add_simple_step(|| |global: &Global, local: &mut Vec<usize>| {
        for _ in 0..16 {
            local.push(global.arena.alloc(100).unwrap().as_ptr() as usize);
        }
    });

    let bursty = builder.launch(10);
    let (global, locals) = bursty.join();

    //  The slots were released as the threads exited.
    let stats = global.arena.stats();
    assert_eq!(0, stats.threads);
    assert_eq!(0, stats.bytes_reserved);

    let mut all: Vec<usize> = locals.into_iter().flatten().collect();
    all.sort();
    all.dedup();

    assert_eq!(THREADS * 16 * 10, all.len());
}

#[test]
fn arena_thread_exit_releases_slot() {
    const THREADS: usize = 8;

    let platform = Arc::new(TestPlatform::default());
    let arena = arena(&platform, 4096);

    thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| scope.spawn(|| {
                arena.alloc(100).unwrap();
                arena.alloc(5000).unwrap();
            }))
            .collect();

        //  Joining waits for the thread-local destructors of the thread.
        for handle in handles {
            handle.join().unwrap();
        }
    });

    assert_eq!(0, arena.stats().threads);
    assert_eq!(0, arena.stats().bytes_reserved);
    assert_eq!(0, platform.live_mappings());

    //  The calling thread is unaffected.
    arena.alloc(100).unwrap();
    assert_eq!(1, arena.stats().threads);
    assert_eq!(1, platform.live_mappings());
}

#[test]
fn arena_dropped_before_thread_exit() {
    let platform = Arc::new(TestPlatform::default());
    let arena = arena(&platform, 4096);

    thread::spawn(move || {
        arena.alloc(100).unwrap();
        assert_eq!(1, THREAD_ARENAS.with(|cache| cache.borrow().len()));

        drop(arena);
    }).join().unwrap();

    assert_eq!(0, platform.live_mappings());
}

#[test]
fn arena_prunes_stale_cache_entries() {
    fn cached() -> usize { THREAD_ARENAS.with(|cache| cache.borrow().len()) }

    let platform = Arc::new(TestPlatform::default());

    //  Dropped on another thread: the entry of this thread lingers until the next registration.
    let first = arena(&platform, 4096);
    first.alloc(100).unwrap();

    thread::spawn(move || drop(first)).join().unwrap();

    assert_eq!(1, cached());
    assert_eq!(0, platform.live_mappings());

    let mut second = arena(&platform, 4096);
    second.alloc(100).unwrap();
    assert_eq!(1, cached());

    //  Destroyed on this thread: the entry is pruned immediately.
    second.destroy();
    assert_eq!(0, cached());
    assert_eq!(0, platform.live_mappings());

    second.alloc(100).unwrap();
    assert_eq!(1, cached());
    assert_eq!(1, second.stats().threads);

    drop(second);
    assert_eq!(0, cached());
    assert_eq!(0, platform.live_mappings());
}

}
