//! Device selection for the current process.

use candle_core::{utils::cuda_is_available, Device, Result};

use crate::distributed::DistributedConfig;

/// CUDA device at the config's local rank, or the CPU when CUDA is not
/// available in this build or on this machine.
pub fn select_device(config: &DistributedConfig) -> Result<Device> {
    if !cuda_is_available() {
        tracing::info!("CUDA unavailable, using CPU");
        return Ok(Device::Cpu);
    }
    let ordinal = config.local_rank;
    tracing::info!(ordinal, distributed = config.distributed, "Using CUDA device");
    Device::new_cuda(ordinal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn falls_back_to_cpu_without_cuda() {
        let device = select_device(&DistributedConfig::single_process()).unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn selected_device_matches_availability() {
        let device = select_device(&DistributedConfig::single_process()).unwrap();
        assert_eq!(device.is_cuda(), cuda_is_available());
    }
}
