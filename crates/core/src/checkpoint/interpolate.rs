//! Bicubic resampling of `[N, C, H, W]` tensors.
//!
//! Matches `torch.nn.functional.interpolate(mode="bicubic", align_corners=False)`:
//! half-pixel source coordinates, the cubic convolution kernel with `A = -0.75`,
//! and taps clamped to the input border. candle has no bicubic kernel, so the
//! work is done on host `f32` data and copied back to the input's device.

use candle_core::{DType, Result, Tensor};

/// Cubic convolution coefficient used by PyTorch (and OpenCV).
const CUBIC_A: f32 = -0.75;

/// Kernel for `|x| <= 1`.
fn cubic_convolution1(x: f32) -> f32 {
    ((CUBIC_A + 2.0) * x - (CUBIC_A + 3.0)) * x * x + 1.0
}

/// Kernel for `1 < |x| < 2`.
fn cubic_convolution2(x: f32) -> f32 {
    ((CUBIC_A * x - 5.0 * CUBIC_A) * x + 8.0 * CUBIC_A) * x - 4.0 * CUBIC_A
}

fn cubic_coefficients(t: f32) -> [f32; 4] {
    [
        cubic_convolution2(t + 1.0),
        cubic_convolution1(t),
        cubic_convolution1(1.0 - t),
        cubic_convolution2(2.0 - t),
    ]
}

/// Four source indices and their weights for one output position.
#[derive(Debug, Clone, Copy)]
struct Taps {
    index: [usize; 4],
    weight: [f32; 4],
}

fn axis_taps(in_len: usize, out_len: usize) -> Vec<Taps> {
    let scale = in_len as f32 / out_len as f32;
    let last = in_len as i64 - 1;
    (0..out_len)
        .map(|dst| {
            // No lower clamp on the source coordinate for cubic; the taps clamp instead.
            let real = scale * (dst as f32 + 0.5) - 0.5;
            let base = (real.floor() as i64).min(last);
            let t = (real - base as f32).clamp(0.0, 1.0);
            let mut index = [0usize; 4];
            for (k, slot) in index.iter_mut().enumerate() {
                *slot = (base - 1 + k as i64).clamp(0, last) as usize;
            }
            Taps {
                index,
                weight: cubic_coefficients(t),
            }
        })
        .collect()
}

/// Resize the two trailing spatial dimensions of `x: [N, C, H, W]` to
/// `out_h × out_w`.
///
/// Returns `x` unchanged when the spatial size already matches.
pub fn bicubic_resize(x: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (n, c, h, w) = x.dims4()?;
    if (h, w) == (out_h, out_w) {
        return Ok(x.clone());
    }
    if h == 0 || w == 0 || out_h == 0 || out_w == 0 {
        candle_core::bail!("bicubic_resize: empty grid {h}x{w} -> {out_h}x{out_w}");
    }

    let src: Vec<f32> = x.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let rows = axis_taps(h, out_h);
    let cols = axis_taps(w, out_w);

    let planes = n * c;
    let mut out = Vec::with_capacity(planes * out_h * out_w);
    for plane in src.chunks_exact(h * w) {
        for ty in &rows {
            for tx in &cols {
                let mut acc = 0.0f32;
                for (&iy, &wy) in ty.index.iter().zip(ty.weight.iter()) {
                    let row = &plane[iy * w..(iy + 1) * w];
                    let mut line = 0.0f32;
                    for (&ix, &wx) in tx.index.iter().zip(tx.weight.iter()) {
                        line += wx * row[ix];
                    }
                    acc += wy * line;
                }
                out.push(acc);
            }
        }
    }

    Tensor::from_vec(out, (n, c, out_h, out_w), x.device())?.to_dtype(x.dtype())
}
