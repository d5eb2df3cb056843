//! CUDA device context management.
//!
//! Lazily initialized `CudaDevice` handles, one per GPU index, via `cudarc`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use cudarc::driver::CudaDevice;
use parking_lot::Mutex;

/// Handles opened so far, keyed by GPU index. Loaded modules live on the
/// handle, so each index must map to a single `CudaDevice`.
static DEVICES: OnceLock<Mutex<HashMap<usize, Arc<CudaDevice>>>> = OnceLock::new();

fn devices() -> &'static Mutex<HashMap<usize, Arc<CudaDevice>>> {
    DEVICES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get or create the handle for GPU `device_idx`.
pub fn get_device(device_idx: usize) -> Result<Arc<CudaDevice>, CudaError> {
    let mut map = devices().lock();
    if let Some(dev) = map.get(&device_idx) {
        return Ok(Arc::clone(dev));
    }
    let dev = CudaDevice::new(device_idx)
        .map_err(|e| CudaError::DeviceInit(format!("device {device_idx}: {e}")))?;
    tracing::debug!(device_idx, "initialized CUDA device");
    map.insert(device_idx, Arc::clone(&dev));
    Ok(dev)
}

/// Number of GPUs that initialize, probing indices in order until one fails.
pub fn device_count() -> usize {
    (0..MAX_PROBED_DEVICES).take_while(|&i| get_device(i).is_ok()).count()
}

const MAX_PROBED_DEVICES: usize = 16;

/// CUDA-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum CudaError {
    #[error("CUDA device init failed: {0}")]
    DeviceInit(String),

    #[error("kernel compilation failed for module '{module}': {msg}")]
    Compile { module: String, msg: String },

    #[error("failed to load module '{module}': {msg}")]
    ModuleLoad { module: String, msg: String },

    #[error("function '{func}' not found in module '{module}'")]
    FuncNotFound { module: String, func: String },

    #[error("CUDA kernel launch failed: {0}")]
    Launch(String),

    #[error("CUDA memory error: {0}")]
    Memory(String),
}
