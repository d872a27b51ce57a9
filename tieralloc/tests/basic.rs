use std::{ptr::NonNull, slice};

use tieralloc::{AllocError, Category, Configuration, FreeError, NodeIndex, ObjectKind, SecurityMode, TierAllocator};

fn allocator(configuration: Configuration) -> TierAllocator {
    let _ = env_logger::builder().is_test(true).try_init();

    tieralloc::create(configuration).expect("Valid configuration")
}

//  Small blocks keep the tests light on memory.
fn light() -> Configuration {
    Configuration::default().with_default_block_size(64 * 1024).with_huge_pages(false)
}

fn bytes<'a>(pointer: NonNull<u8>, size: usize) -> &'a mut [u8] {
    //  Safety:
    //  -   Every caller passes a live allocation of `size` bytes, used by no one else.
    unsafe { slice::from_raw_parts_mut(pointer.as_ptr(), size) }
}

#[test]
fn allocate_every_kind() {
    let allocator = allocator(light());

    let kinds = [
        ObjectKind::Generic,
        ObjectKind::Instance,
        ObjectKind::Function,
        ObjectKind::String,
        ObjectKind::Array,
        ObjectKind::HashMap,
    ];

    for (index, kind) in kinds.into_iter().enumerate() {
        let size = 24 + index * 8;
        let pointer = allocator.alloc(size, kind).unwrap();

        let memory = bytes(pointer, size);
        memory.fill(index as u8);

        assert!(memory.iter().all(|b| *b == index as u8));
    }

    let stats = allocator.stats();

    assert_eq!(kinds.len() as u64, stats.total_allocations);
    assert_eq!(stats.total_allocations, stats.kinds.total());
    assert!(allocator.validate_integrity());
}

#[test]
fn routing_by_size() {
    let allocator = allocator(light());

    assert_eq!(Category::Slab, allocator.classify(64, ObjectKind::Generic));
    assert_eq!(Category::Large, allocator.classify(1 << 20, ObjectKind::Generic));

    let slab = allocator.alloc(64, ObjectKind::Generic).unwrap();
    let large = allocator.alloc(1 << 20, ObjectKind::Array).unwrap();

    bytes(large, 1 << 20).fill(0x5A);

    assert_eq!(Some(1 << 20), allocator.large_objects().size_of(large));

    unsafe {
        allocator.free(slab, 64).unwrap();
        allocator.free(large, 1 << 20).unwrap();
    }

    let stats = allocator.stats();

    assert_eq!(0, stats.current_memory_usage);
    assert_eq!(0, allocator.large_objects().stats().objects);
    assert!(allocator.validate_integrity());
}

#[test]
fn arena_memory_is_reclaimed_in_bulk() {
    //  A single node keeps the thread on the same block chain, wherever it is scheduled.
    let mut allocator = allocator(light().with_slab(false).with_numa_aware(false));

    let pointer = allocator.alloc(100, ObjectKind::Instance).unwrap();

    assert_eq!(Err(FreeError::ArenaMemory), unsafe { allocator.free(pointer, 100) });

    allocator.reset_arenas();

    assert_eq!(0, allocator.stats().current_memory_usage);

    let again = allocator.alloc(100, ObjectKind::Instance).unwrap();

    assert_eq!(pointer, again);
}

#[test]
fn zeroed_and_aligned() {
    let allocator = allocator(light());

    let zeroed = allocator.alloc_zeroed(16, 32, ObjectKind::Array).unwrap();

    assert!(bytes(zeroed, 16 * 32).iter().all(|b| *b == 0));

    assert_eq!(Err(AllocError::Overflow), allocator.alloc_zeroed(usize::MAX, 2, ObjectKind::Array));

    let aligned = allocator.alloc_aligned(100, 256).unwrap();
    let cache_aligned = allocator.alloc_cache_aligned(40).unwrap();

    assert_eq!(0, aligned.as_ptr() as usize % 256);
    assert_eq!(0, cache_aligned.as_ptr() as usize % 64);

    assert_eq!(Err(AllocError::InvalidAlignment(3)), allocator.alloc_aligned(100, 3));
}

#[test]
fn numa_allocation_on_every_node() {
    let allocator = allocator(light());

    for node in allocator.topology().nodes() {
        let pointer = allocator.alloc_numa(4096, node).unwrap();

        bytes(pointer, 4096).fill(1);
    }

    let unknown = NodeIndex::new(allocator.topology().node_count() as u32);

    assert_eq!(Err(AllocError::InvalidNode(unknown)), allocator.alloc_numa(64, unknown));
    assert!(allocator.validate_integrity());
}

#[test]
fn security_modes() {
    let allocator = allocator(light().with_security_mode(SecurityMode::Basic));

    assert_eq!(SecurityMode::Basic, allocator.security_mode());
    assert!(matches!(allocator.alloc(0, ObjectKind::Generic), Err(AllocError::Rejected(_))));

    allocator.set_security_mode(SecurityMode::Paranoid);

    let pointer = allocator.alloc(128, ObjectKind::String).unwrap();

    assert!(bytes(pointer, 128).iter().all(|b| *b == 0));
    assert_eq!(1, allocator.stats().security_rejections);
}

#[test]
fn pressure_callback_fires_once() {
    use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};

    let configuration = light()
        .with_pressure_threshold(1024)
        .with_pressure_check_interval(std::time::Duration::ZERO);

    let allocator = allocator(configuration);

    let calls = Arc::new(AtomicUsize::new(0));

    {
        let calls = calls.clone();
        allocator.set_pressure_callback(move || { calls.fetch_add(1, Ordering::Relaxed); });
    }

    assert!(!allocator.check_pressure());

    let large = allocator.alloc(1 << 20, ObjectKind::Generic).unwrap();

    assert!(allocator.check_pressure());
    assert!(allocator.check_pressure());
    assert_eq!(1, calls.load(Ordering::Relaxed));

    unsafe { allocator.free(large, 1 << 20).unwrap() };

    assert!(!allocator.check_pressure());
}

#[test]
fn bind_thread_to_current_node() {
    let allocator = allocator(light());

    let node = tieralloc::topology::current_node();

    match allocator.bind_thread(node) {
        Ok(()) => assert!(allocator.topology().is_available()),
        Err(error) => log::debug!("Binding unavailable: {}", error),
    }
}
