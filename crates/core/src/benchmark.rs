//! Inference throughput measurement.

use std::time::{Duration, Instant};

use candle_core::{Device, Module, Result, Tensor};

/// Result of [`measure_throughput`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub images: usize,
    pub batches: usize,
    pub elapsed: Duration,
    pub images_per_sec: f64,
}

impl Throughput {
    fn new(images: usize, batches: usize, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let images_per_sec = if images == 0 || secs == 0.0 {
            0.0
        } else {
            images as f64 / secs
        };
        Self {
            images,
            batches,
            elapsed,
            images_per_sec,
        }
    }
}

/// Run forward passes over at most `num_batches` image batches on `device`.
///
/// Each batch is `[B, C, H, W]` and is moved to `device` before the forward
/// pass. The device is synchronised before the clock stops, so queued
/// kernels are included in the timing.
pub fn measure_throughput<M, I>(
    model: &M,
    device: &Device,
    batches: I,
    num_batches: usize,
) -> Result<Throughput>
where
    M: Module + ?Sized,
    I: IntoIterator<Item = Tensor>,
{
    let start = Instant::now();
    let mut images = 0;
    let mut seen = 0;
    for batch in batches.into_iter().take(num_batches) {
        let batch = batch.to_device(device)?;
        model.forward(&batch)?;
        images += batch.dim(0)?;
        seen += 1;
    }
    device.synchronize()?;

    let throughput = Throughput::new(images, seen, start.elapsed());
    tracing::debug!(
        images = throughput.images,
        batches = throughput.batches,
        elapsed_ms = throughput.elapsed.as_millis() as u64,
        "Throughput measured"
    );
    Ok(throughput)
}
