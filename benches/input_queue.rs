//! Benchmarks for InputQueue operations
//!
//! Run with: cargo bench --bench input_queue

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rollback_link::{CancellationToken, Input, InputQueue, PlayerIndex, Tick};

fn input(tick: u32) -> Input {
    Input::new(Tick::new(tick), Tick::ZERO, 0xfc00, 0)
}

fn bench_add_and_pair(c: &mut Criterion) {
    let mut group = c.benchmark_group("InputQueue add+consume");
    let token = CancellationToken::new();

    for delay in [0usize, 2, 6] {
        group.bench_with_input(BenchmarkId::new("60 ticks", delay), &delay, |b, &delay| {
            b.iter(|| {
                let queue = InputQueue::new(64, PlayerIndex::P1, delay).unwrap();
                for tick in 0..60 {
                    queue.add_input(PlayerIndex::P1, input(tick), &token).unwrap();
                    queue.add_input(PlayerIndex::P2, input(tick), &token).unwrap();
                    black_box(queue.consume_and_peek_local());
                }
            });
        });
    }

    group.finish();
}

fn bench_lag(c: &mut Criterion) {
    let token = CancellationToken::new();
    let queue = InputQueue::new(64, PlayerIndex::P1, 0).unwrap();
    for tick in 0..30 {
        queue.add_input(PlayerIndex::P1, input(tick), &token).unwrap();
    }

    c.bench_function("InputQueue lag", |b| {
        b.iter(|| black_box(&queue).lag(PlayerIndex::P2));
    });
}

criterion_group!(benches, bench_add_and_pair, bench_lag);
criterion_main!(benches);
