use std::time::Instant;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use tieralloc::{Configuration, ObjectKind, SecurityMode, TierAllocator};

fn allocator(configuration: Configuration) -> TierAllocator {
    tieralloc::create(configuration).expect("Valid configuration")
}

//  Arena Allocation
//
//  This benchmark repeatedly bump-allocates small objects on a single thread, rewinding the arenas after each sample.
//
//  This is the best-case scenario of the allocator, and measures the lower-bound of its latency.
fn arena_allocation(c: &mut Criterion) {
    let mut allocator = allocator(Configuration::default().with_slab(false).with_security_mode(SecurityMode::Disabled));

    c.bench_function("ST Arena Allocation - sys", |b| b.iter_with_large_drop(
        || black_box(Box::new([0u8; 48]))
    ));

    c.bench_function("ST Arena Allocation - tier", |b| b.iter_custom(|iterations| {
        let start = Instant::now();

        for _ in 0..iterations {
            black_box(allocator.alloc(48, ObjectKind::Instance).ok());
        }

        let elapsed = start.elapsed();

        allocator.reset_arenas();

        elapsed
    }));
}

//  Slab Round-Trip
//
//  This benchmark repeatedly allocates, then frees, a small object on a single thread.
fn slab_round_trip(c: &mut Criterion) {
    let allocator = allocator(Configuration::default().with_security_mode(SecurityMode::Disabled));

    c.bench_function("ST Slab Round-Trip - sys", |b| b.iter(|| {
        drop(black_box(Box::new([0u8; 64])))
    }));

    c.bench_function("ST Slab Round-Trip - tier", |b| b.iter(|| {
        if let Ok(pointer) = allocator.alloc(64, ObjectKind::Generic) {
            let pointer = black_box(pointer);
            let _ = unsafe { allocator.free(pointer, 64) };
        }
    }));
}

//  Large Round-Trip
//
//  This benchmark repeatedly maps, then unmaps, a 1 MB object on a single thread.
fn large_round_trip(c: &mut Criterion) {
    const SIZE: usize = 1 << 20;

    let allocator = allocator(Configuration::default().with_huge_pages(false));

    c.bench_function("ST Large Round-Trip - sys", |b| b.iter(|| {
        drop(black_box(vec![0u8; SIZE]))
    }));

    c.bench_function("ST Large Round-Trip - tier", |b| b.iter(|| {
        if let Ok(pointer) = allocator.alloc(SIZE, ObjectKind::Array) {
            let pointer = black_box(pointer);
            let _ = unsafe { allocator.free(pointer, SIZE) };
        }
    }));
}

//  Security Scan
//
//  This benchmark scans a page of clean memory for signatures, with the scalar and the vectorized implementations.
fn security_scan(c: &mut Criterion) {
    let page = vec![0x42u8; 4096];

    c.bench_function("Scan 4KB - scalar", |b| b.iter(|| {
        black_box(tieralloc::scan_scalar(black_box(&page)))
    }));

    c.bench_function("Scan 4KB - dispatch", |b| b.iter(|| {
        black_box(tieralloc::scan(black_box(&page)))
    }));
}

criterion_group!(benches, arena_allocation, slab_round_trip, large_round_trip, security_scan);

criterion_main!(benches);
