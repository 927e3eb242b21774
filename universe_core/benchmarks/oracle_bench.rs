use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use universe_core::{Coord, Footprint, FormulaConstants, NoiseChannel, Oracle};

fn bench_tile_derivation(c: &mut Criterion) {
    let oracle = Oracle::new(Arc::new(FormulaConstants::builtin()));
    let mut group = c.benchmark_group("oracle");

    for side in [16u32, 32, 64] {
        let footprint = Footprint::new(Coord::new(0, 0), side);
        group.throughput(Throughput::Elements(footprint.area()));
        group.bench_with_input(BenchmarkId::new("tile", side), &footprint, |b, footprint| {
            b.iter(|| {
                footprint
                    .coords()
                    .filter_map(|coord| oracle.body_at(coord))
                    .count()
            })
        });
    }

    group.finish();
}

fn bench_noise_field(c: &mut Criterion) {
    let oracle = Oracle::new(Arc::new(FormulaConstants::builtin()));
    c.bench_function("noise_at", |b| {
        let mut x = 0i64;
        b.iter(|| {
            x = x.wrapping_add(31);
            oracle.noise_at(Coord::new(x, -x), NoiseChannel::Zone)
        })
    });
}

criterion_group!(oracle_benches, bench_tile_derivation, bench_noise_field);
criterion_main!(oracle_benches);
