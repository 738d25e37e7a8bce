use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;

use anyhow::{Context, Result};
use tch::{Device, nn::VarStore};
use tracing::{info, warn};

use crate::checkpoint::Checkpoints;
use crate::config::Config;
use crate::model::Gpt;

/// Picks the compute device: `Cuda(gpu_id)` when requested and present, else CPU.
pub fn select_device(config: &Config) -> Result<Device> {
    if let Some(library) = &config.cuda_library {
        // libtorch loads CUDA lazily, so is_available() reports false until the library is resident.
        let path = CString::new(library.as_os_str().as_bytes())
            .with_context(|| format!("invalid library path {}", library.display()))?;
        let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_LAZY) };
        if handle.is_null() {
            warn!(library = %library.display(), "failed to preload CUDA library");
        }
    }
    if config.gpu_id < 0 {
        info!("using CPU");
        return Ok(Device::Cpu);
    }
    if tch::Cuda::is_available() {
        info!(gpu_id = config.gpu_id, "using GPU");
        Ok(Device::Cuda(config.gpu_id as usize))
    } else {
        warn!(gpu_id = config.gpu_id, "CUDA unavailable, falling back to CPU");
        Ok(Device::Cpu)
    }
}

/// Seeds libtorch's global generator and returns the seed used, which also
/// seeds the loader and sampler generators.
pub fn seed(config: &Config) -> u64 {
    let seed = if config.seed_random {
        // libtorch and TOML both take signed 64-bit seeds
        rand::random::<u64>() >> 1
    } else {
        config.seed
    };
    tch::manual_seed(seed as i64);
    info!(seed, "seeded");
    seed
}

/// Builds the model on `device`, restoring `epoch` when given.
///
/// Returns the variable store, the model and the epoch the weights came from
/// (0 for a fresh model).
pub fn load_model(
    config: &Config,
    device: Device,
    checkpoints: &Checkpoints,
    epoch: Option<&str>,
) -> Result<(VarStore, Gpt, usize)> {
    let mut vs = VarStore::new(device);
    let model = Gpt::new(&vs.root(), &config.model)?;
    let from = match epoch {
        Some(epoch) => checkpoints.load(&mut vs, epoch)?,
        None => 0,
    };
    Ok((vs, model, from))
}
