//! Compare slab map lookup patterns and the cost of marking

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use guestmem::{MemBlockFlags, SlabMap};

const BASE: u32 = 0x0880_0000;

/// A map with a few thousand distinct slabs, like after booting a game.
fn populated() -> SlabMap {
    let mut map = SlabMap::new();
    for i in 0..4096_u32 {
        map.mark(BASE + i * 0x400, 0x200, u64::from(i), 0x0880_0000 + (i % 7), true, Some("Bench"));
    }
    map
}

fn criterion_benchmark(c: &mut Criterion) {
    let map = populated();

    c.bench_function("sequential_tag_lookup", |b| {
        b.iter(|| {
            let mut addr = BASE;
            for _ in 0..1024 {
                black_box(map.fast_find_write_tag(black_box(addr), 4));
                addr += 0x40;
            }
        });
    });
    c.bench_function("strided_tag_lookup", |b| {
        b.iter(|| {
            let mut addr = BASE;
            for i in 0..1024_u32 {
                addr = BASE + (addr.wrapping_mul(31).wrapping_add(i) % 0x0100_0000);
                black_box(map.fast_find_write_tag(black_box(addr), 4));
            }
        });
    });
    c.bench_function("find_range", |b| {
        let mut results = Vec::with_capacity(256);
        b.iter(|| {
            results.clear();
            black_box(map.find(MemBlockFlags::WRITE, BASE, 0x4_0000, &mut results));
        });
    });
    c.bench_function("mark_overwrite", |b| {
        let mut map = populated();
        let mut ticks = 0;
        b.iter(|| {
            ticks += 1;
            map.mark(black_box(BASE + 0x1100), 0x3000, ticks, 0x0880_0040, true, Some("Overwrite"));
            map.mark(black_box(BASE + 0x1100), 0x3000, ticks, 0x0880_0044, true, Some("Restore"));
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
