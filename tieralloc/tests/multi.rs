use std::{
    ptr::NonNull,
    slice,
    sync::{Arc, Barrier, atomic::{AtomicUsize, Ordering}, mpsc},
    thread,
    time::Duration,
};

use serial_test::serial;

use tieralloc::{Configuration, ObjectKind, TierAllocator};

use tieralloc_test::BurstyBuilder;

//
//  Tests
//

#[serial]
#[test]
fn concurrent_arena_threads() {
    //  Test that each thread is served from its own arena: patterns written by one thread are never overwritten by
    //  another.

    let number_iterations = number_iterations();
    let number_threads = number_threads();

    let allocator = allocator(light().with_slab(false));
    let barrier = Barrier::new(number_threads);

    thread::scope(|scope| {
        for i in 0..number_threads {
            let (allocator, barrier) = (&allocator, &barrier);

            scope.spawn(move || {
                let pattern = i as u8;

                let pointers: Vec<_> = (0..number_iterations)
                    .map(|j| {
                        let kind = if j % 2 == 0 { ObjectKind::Instance } else { ObjectKind::String };
                        let pointer = allocator.alloc(48, kind).unwrap();

                        bytes(pointer, 48).fill(pattern);

                        pointer.as_ptr() as usize
                    })
                    .collect();

                barrier.wait();

                for address in pointers {
                    let pointer = NonNull::new(address as *mut u8).unwrap();

                    assert!(bytes(pointer, 48).iter().all(|b| *b == pattern));
                }

                allocator.release_thread();
            });
        }
    });

    let stats = allocator.stats();

    assert_eq!((number_threads * number_iterations) as u64, stats.total_allocations);
    assert!(allocator.validate_integrity());
}

#[serial]
#[test]
fn producer_consumer_ring() {
    //  Test that slab objects can be allocated on one thread, and freed on another.
    //
    //  Each thread allocates objects and sends them to its right neighbour, which checks their content and frees
    //  them.

    let number_iterations = number_iterations();
    let number_threads = number_threads();

    let allocator = allocator(light());

    let (senders, receivers): (Vec<_>, Vec<_>) = (0..number_threads).map(|_| mpsc::channel::<usize>()).unzip();

    thread::scope(|scope| {
        for (i, receiver) in receivers.into_iter().enumerate() {
            let allocator = &allocator;
            let sender = senders[(i + 1) % number_threads].clone();

            scope.spawn(move || {
                for j in 0..number_iterations {
                    let pointer = allocator.alloc(64, ObjectKind::Generic).unwrap();

                    bytes(pointer, 64).fill((i + j) as u8);

                    sender.send(pointer.as_ptr() as usize).unwrap();
                }

                drop(sender);

                let left = (i + number_threads - 1) % number_threads;

                for (j, address) in receiver.iter().take(number_iterations).enumerate() {
                    let pointer = NonNull::new(address as *mut u8).unwrap();

                    assert!(bytes(pointer, 64).iter().all(|b| *b == (left + j) as u8));

                    unsafe { allocator.free(pointer, 64).unwrap() };
                }
            });
        }
    });

    drop(senders);

    let stats = allocator.stats();
    let total = (number_threads * number_iterations) as u64;

    assert_eq!(total, stats.slab.allocations);
    assert_eq!(total, stats.slab.deallocations);
    assert_eq!(0, stats.current_memory_usage);
    assert!(allocator.validate_integrity());
}

#[serial]
#[test]
fn concurrent_large_objects() {
    //  Test that the large-object registries remain consistent under concurrent allocations and releases.

    const SIZE: usize = 1 << 20;

    let number_iterations = number_iterations() / 10 + 1;
    let number_threads = number_threads();

    let allocator = allocator(light());

    thread::scope(|scope| {
        for i in 0..number_threads {
            let allocator = &allocator;

            scope.spawn(move || {
                for j in 0..number_iterations {
                    let size = SIZE + (i * number_iterations + j) * 8;
                    let pointer = allocator.alloc(size, ObjectKind::Array).unwrap();

                    bytes(pointer, size)[size - 1] = 1;

                    assert_eq!(Some(size), allocator.large_objects().size_of(pointer));

                    unsafe { allocator.free(pointer, size).unwrap() };
                }
            });
        }
    });

    let stats = allocator.large_objects().stats();

    assert_eq!(0, stats.objects);
    assert_eq!(0, stats.bytes);
    assert_eq!(stats.allocations, stats.deallocations);
    assert!(allocator.validate_integrity());
}

#[serial]
#[test]
fn pressure_transition_fires_once() {
    //  Test that, with every thread checking the pressure at once, the callback is invoked exactly once.

    const SIZE: usize = 1 << 20;

    let number_threads = number_threads();

    let configuration = light()
        .with_pressure_threshold(SIZE)
        .with_pressure_check_interval(Duration::ZERO);

    let allocator = allocator(configuration);

    let calls = Arc::new(AtomicUsize::new(0));

    {
        let calls = calls.clone();
        allocator.set_pressure_callback(move || { calls.fetch_add(1, Ordering::Relaxed); });
    }

    let allocated = Barrier::new(number_threads);
    let checked = Barrier::new(number_threads);

    thread::scope(|scope| {
        for _ in 0..number_threads {
            let (allocator, allocated, checked) = (&allocator, &allocated, &checked);

            scope.spawn(move || {
                let pointer = allocator.alloc(SIZE, ObjectKind::Generic).unwrap();

                allocated.wait();

                assert!(allocator.check_pressure());

                checked.wait();

                unsafe { allocator.free(pointer, SIZE).unwrap() };
            });
        }
    });

    assert_eq!(1, calls.load(Ordering::Relaxed));
    assert!(!allocator.check_pressure());
}

#[serial]
#[test]
fn bursty_slab_churn() {
    //  Test that slab classes remain consistent when all threads allocate, then all free, in lock-step bursts.

    const SIZES: [usize; 4] = [8, 64, 1000, 16 * 1024];

    struct Local(Vec<(usize, usize)>);

    let number_iterations = number_iterations();
    let number_threads = number_threads();

    let locals = (0..number_threads).map(|_| Local(Vec::new())).collect();

    let mut builder = BurstyBuilder::new(allocator(light()), locals);

    builder.add_simple_step(|| |allocator: &TierAllocator, local: &mut Local| {
        for size in SIZES {
            let pointer = allocator.alloc(size, ObjectKind::Generic).unwrap();

            bytes(pointer, size).fill(size as u8);

            local.0.push((pointer.as_ptr() as usize, size));
        }
    });

    builder.add_simple_step(|| |allocator: &TierAllocator, local: &mut Local| {
        for (address, size) in local.0.drain(..) {
            let pointer = NonNull::new(address as *mut u8).unwrap();

            assert!(bytes(pointer, size).iter().all(|b| *b == size as u8));

            unsafe { allocator.free(pointer, size).unwrap() };
        }
    });

    let (allocator, _) = builder.launch(number_iterations).join();

    let stats = allocator.stats();
    let total = (number_threads * number_iterations * SIZES.len()) as u64;

    assert_eq!(total, stats.slab.allocations);
    assert_eq!(total, stats.slab.deallocations);
    assert_eq!(0, stats.current_memory_usage);
    assert!(allocator.validate_integrity());
}

//
//  Implementation
//

fn allocator(configuration: Configuration) -> TierAllocator {
    let _ = env_logger::builder().is_test(true).try_init();

    tieralloc::create(configuration).expect("Valid configuration")
}

fn light() -> Configuration {
    Configuration::default().with_default_block_size(64 * 1024).with_huge_pages(false)
}

fn bytes<'a>(pointer: NonNull<u8>, size: usize) -> &'a mut [u8] {
    //  Safety:
    //  -   Every caller passes a live allocation of `size` bytes, which only it accesses at the time.
    unsafe { slice::from_raw_parts_mut(pointer.as_ptr(), size) }
}

fn number_iterations() -> usize { read_number_from_environment("TIERALLOC_MULTI_NUMBER_ITERATIONS", 100) }

fn number_threads() -> usize {
    read_number_from_environment("TIERALLOC_MULTI_NUMBER_THREADS", num_cpus::get().clamp(2, 8))
}

fn read_number_from_environment(name: &str, default: usize) -> usize {
    let result = std::env::var(name).ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default);

    println!("{}: {}", name, result);

    result
}
