//! Microbenchmarks for the hot paths: reads, writes, propagation through a
//! computed chain, and batched write coalescing.
//!
//! ```bash
//! cargo bench                  # everything
//! cargo bench -- "signal/"     # signal primitives only
//! ```

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use reflow::{batch, computed, signal, Computed, Effect};
use std::sync::Arc;

fn signal_operations(c: &mut Criterion) {
    let mut g = c.benchmark_group("signal");

    g.bench_function("create", |b| b.iter(|| black_box(signal(0_i32))));

    let s = signal(42_i32);
    g.bench_function("get", |b| b.iter(|| black_box(s.get())));

    let write = signal(0_i32);
    let mut i = 0_i32;
    g.bench_function("set", |b| {
        b.iter(|| {
            write.set(black_box(i));
            i = i.wrapping_add(1);
        })
    });

    // Equality-gated: the write should cost a compare and nothing else.
    let same = signal(42_i32);
    g.bench_function("set_same_value", |b| b.iter(|| same.set(black_box(42))));

    g.finish();
}

fn computed_chain(c: &mut Criterion) {
    let mut g = c.benchmark_group("computed");

    let source = signal(0_i32);
    let mut tail: Arc<Computed<i32>> = {
        let source = source.clone();
        computed(move || source.get() + 1)
    };
    for _ in 0..31 {
        let prev = tail.clone();
        tail = computed(move || prev.get() + 1);
    }

    g.bench_function("cached_read_depth_32", |b| b.iter(|| black_box(tail.get())));

    let mut i = 0_i32;
    g.bench_function("propagate_depth_32", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            source.set(i);
            black_box(tail.get())
        })
    });

    g.finish();
}

fn effect_waves(c: &mut Criterion) {
    let mut g = c.benchmark_group("effects");

    let s = signal(0_i32);
    let _effects: Vec<Effect> = (0..16)
        .map(|_| {
            let s = s.clone();
            Effect::new(move || {
                black_box(s.get());
            })
        })
        .collect();

    let mut i = 0_i32;
    g.bench_function("fanout_16", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            s.set(i);
        })
    });

    let x = signal(0_i32);
    let y = signal(0_i32);
    let _combiner = {
        let (x, y) = (x.clone(), y.clone());
        Effect::new(move || {
            black_box(x.get() + y.get());
        })
    };

    let mut j = 0_i32;
    g.bench_function("batched_pair_write", |b| {
        b.iter(|| {
            j = j.wrapping_add(1);
            batch(|| {
                x.set(j);
                y.set(j);
            });
        })
    });

    g.finish();
}

criterion_group!(benches, signal_operations, computed_chain, effect_waves);
criterion_main!(benches);
