//! Hilbert conversion benchmarks: iterative math vs the precomputed LUT.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use infinitemap_core::hilbert::{linear_to_xy, xy_to_linear, HilbertCurve};

fn bench_linear_to_xy(c: &mut Criterion) {
    let mut group = c.benchmark_group("hilbert_linear_to_xy");
    for order in [8u32, 10, 12] {
        let cells = 1u64 << (2 * order);
        group.bench_function(format!("iterative_order_{order}"), |b| {
            let mut t = 0u64;
            b.iter(|| {
                t = (t + 7919) % cells;
                black_box(linear_to_xy(black_box(t), order).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_curve_lut(c: &mut Criterion) {
    let curve = HilbertCurve::new(10).unwrap();
    let cells = curve.cell_count();
    c.bench_function("hilbert_lut_order_10", |b| {
        let mut t = 0u64;
        b.iter(|| {
            t = (t + 7919) % cells;
            black_box(curve.to_xy(black_box(t)).unwrap())
        });
    });
}

fn bench_xy_to_linear(c: &mut Criterion) {
    let n = 1u32 << 10;
    c.bench_function("hilbert_xy_to_linear_order_10", |b| {
        let mut x = 0u32;
        b.iter(|| {
            x = (x + 127) % n;
            black_box(xy_to_linear(black_box(x), black_box(x / 2), 10).unwrap())
        });
    });
}

criterion_group!(benches, bench_linear_to_xy, bench_curve_lut, bench_xy_to_linear);
criterion_main!(benches);
