//! PRNG and shuffle throughput.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use tessera_types::Mulberry32;

fn bench_next_u32(c: &mut Criterion) {
    c.bench_function("mulberry32_next_u32", |b| {
        let mut rng = Mulberry32::new(42);
        b.iter(|| black_box(rng.next_u32()));
    });
}

fn bench_shuffle(c: &mut Criterion) {
    let mut group = c.benchmark_group("shuffle");
    for size in [52usize, 1_000, 10_000] {
        group.bench_function(format!("{size}_tokens"), |b| {
            let deck: Vec<usize> = (0..size).collect();
            b.iter(|| {
                let mut deck = deck.clone();
                Mulberry32::from_str_seed("bench-seed").shuffle(&mut deck);
                black_box(deck)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_next_u32, bench_shuffle);
criterion_main!(benches);
