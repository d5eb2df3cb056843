//! CUDA backend for user-supplied kernels.
//!
//! Provides:
//! - Device context management (lazy singleton per GPU)
//! - Runtime compilation through NVRTC with a per-device module cache
//! - Raw-argument kernel launch over host tensors

pub mod context;
pub mod launch;

pub use context::{device_count, get_device, CudaError};
pub use launch::{launch_source, KernelLaunch};

impl From<CudaError> for fuse_core::FuseError {
    fn from(e: CudaError) -> Self {
        fuse_core::FuseError::Kernel(e.to_string())
    }
}
