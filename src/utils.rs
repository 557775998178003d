/// Utility functions
use candle_core::{Device, Var};

/// Total number of scalar weights across named parameters
pub fn count_parameters(params: &[(String, Var)]) -> usize {
    params.iter().map(|(_, var)| var.as_tensor().elem_count()).sum()
}

/// CUDA device `ordinal` when CUDA is available, CPU otherwise
pub fn select_device(ordinal: usize) -> crate::Result<Device> {
    if candle_core::utils::cuda_is_available() {
        log::info!("Using CUDA device {}", ordinal);
        Ok(Device::new_cuda(ordinal)?)
    } else {
        log::info!("CUDA not available, using CPU");
        Ok(Device::Cpu)
    }
}

/// Seed the device RNG used for parameter initialisation
///
/// Only CUDA devices carry a seedable generator; on CPU this is a no-op.
pub fn seed_device(device: &Device, seed: u64) -> crate::Result<()> {
    if device.is_cuda() {
        device.set_seed(seed)?;
        log::info!("Seeded CUDA RNG with {}", seed);
    }
    Ok(())
}
