//! # fuse-kernels
//!
//! Accelerated implementations behind the fused operators.
//!
//! Provides:
//! - Single-pass CPU kernels for RMSNorm, LayerNorm, RoPE and attention
//! - Single-pass CPU gradient kernels for RMSNorm and LayerNorm
//! - Affine quantize / pack / dequantize kernels, bit-identical to the
//!   decomposed reference
//! - Runtime kernel compilation and launch (behind the `cuda` feature flag)
//!
//! Every kernel reads its inputs as f32, computes in f32 and writes the
//! requested output dtype.

pub mod cpu_fused;
pub mod cpu_fused_backward;
pub mod cpu_quant;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use cpu_fused::{
    fused_layer_norm, fused_rms_norm, fused_rope, fused_sdpa_decode, fused_sdpa_self_attention,
    RopeConfig,
};
pub use cpu_fused_backward::{fused_layer_norm_backward, fused_rms_norm_backward};
pub use cpu_quant::{affine_dequantize, affine_pack, affine_quantize};

/// Rows below this count run serially.
pub(crate) const PAR_ROWS: usize = 64;
