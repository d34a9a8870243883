//! Criterion benchmarks for position-embedding adaptation.
//!
//! Covers the raw bicubic resize and the full `adapt_pos_embed` path at
//! common ViT grid sizes, all running on CPU device.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{DType, Device, Tensor};
use vit_tune_core::checkpoint::{adapt_pos_embed, bicubic_resize, TokenGeometry};

// ---------------------------------------------------------------------------
// Bicubic resize
// ---------------------------------------------------------------------------

fn bench_bicubic_resize(c: &mut Criterion) {
    let mut group = c.benchmark_group("bicubic_resize");

    for &(from, to) in &[(14, 24), (24, 14), (14, 32), (7, 14)] {
        let grid = Tensor::randn(0f32, 1.0, (1, 384, from, from), &Device::Cpu)
            .expect("randn failed");
        let label = format!("{from}x{from}_to_{to}x{to}");
        group.bench_with_input(BenchmarkId::new("d384", &label), &label, |b, _| {
            b.iter(|| bicubic_resize(black_box(&grid), to, to).expect("bicubic_resize failed"));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Full position-embedding adaptation
// ---------------------------------------------------------------------------

fn bench_adapt_pos_embed(c: &mut Criterion) {
    let mut group = c.benchmark_group("adapt_pos_embed");

    for &embed_dim in &[384, 768] {
        let checkpoint = Tensor::randn(0f32, 0.02, (1, 197, embed_dim), &Device::Cpu)
            .expect("randn failed");
        let model_pos = Tensor::zeros((1, 577, embed_dim), DType::F32, &Device::Cpu)
            .expect("zeros failed");
        let geometry = TokenGeometry {
            num_extra_tokens: 1,
            num_patches: 576,
        };
        group.bench_with_input(
            BenchmarkId::new("224_to_384", embed_dim),
            &embed_dim,
            |b, _| {
                b.iter(|| {
                    adapt_pos_embed(black_box(&checkpoint), &model_pos, geometry)
                        .expect("adapt_pos_embed failed")
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_bicubic_resize, bench_adapt_pos_embed);
criterion_main!(benches);
