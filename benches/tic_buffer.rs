//! Benchmarks for the ticcmd ring buffer
//!
//! Run with: cargo bench --bench tic_buffer

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use kart_netsync::__internal::{expand_tic, TicBuffer};
use kart_netsync::{PlayerSlot, Tic, Ticcmd};
use std::hint::black_box;

fn bench_store_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("TicBuffer store_frame");

    for players in [2u32, 8, 16] {
        let ingame = ((1u32 << players) - 1) as u16;
        let cmds = vec![Ticcmd::NEUTRAL; players as usize];
        group.bench_with_input(BenchmarkId::from_parameter(players), &cmds, |b, cmds| {
            let mut buffer = TicBuffer::new();
            let mut tic = Tic::ZERO;
            b.iter(|| {
                buffer.store_frame(black_box(tic), ingame, cmds, tic);
                tic += 1;
            });
        });
    }

    group.finish();
}

fn bench_frame_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("TicBuffer frame");
    let mut buffer = TicBuffer::new();
    let ingame = 0x00FF;
    let cmds = vec![Ticcmd::NEUTRAL; 8];
    for tic in 0..256 {
        buffer.store_frame(Tic::new(tic), ingame, &cmds, Tic::new(tic));
    }

    group.bench_function("complete", |b| {
        b.iter(|| buffer.frame(black_box(Tic::new(200))));
    });
    group.bench_function("single cmd", |b| {
        let slot = PlayerSlot::new(3).unwrap_or_default();
        b.iter(|| buffer.cmd(black_box(Tic::new(200)), slot));
    });

    group.finish();
}

fn bench_expand_tic(c: &mut Criterion) {
    c.bench_function("expand_tic", |b| {
        b.iter(|| expand_tic(black_box(0x03), black_box(Tic::new(0x1FE))));
    });
}

criterion_group!(benches, bench_store_frame, bench_frame_lookup, bench_expand_tic);
criterion_main!(benches);
