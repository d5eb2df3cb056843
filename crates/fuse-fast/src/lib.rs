//! # fuse-fast
//!
//! Fused operators that dispatch between an accelerated kernel and a
//! decomposition into host tensor ops.
//!
//! Provides:
//! - RMSNorm and LayerNorm with closed-form gradient nodes
//! - Rotary position encoding (forward and inverse)
//! - Scaled dot-product attention with grouped-query support
//! - Affine group quantization (quantize, re-pack, dequantize)
//! - User-defined operators and runtime-compiled custom kernels
//! - A deferred graph with equivalence-keyed node caching
//!
//! Every operator takes a [`Context`] naming the stream it runs on and the
//! [`DispatchConfig`] switches. Eligible calls return a pending [`Array`];
//! the rest run their decomposition immediately.

pub mod attention;
pub mod custom;
pub mod custom_kernel;
pub mod dispatch;
pub mod graph;
pub mod norm;
pub mod primitive;
pub mod quantize;
pub mod rope;

pub use attention::scaled_dot_product_attention;
pub use custom::CustomOp;
pub use custom_kernel::{CustomKernel, TemplateArg};
pub use dispatch::{AttentionConfig, Context, DispatchConfig, KernelSupport};
pub use graph::{Array, Node, OutputSpec, Scheduler};
pub use norm::{layer_norm, rms_norm};
pub use primitive::{EquivalenceKey, Op, Primitive};
pub use quantize::{affine_dequantize, affine_quantize, affine_quantize_with};
pub use rope::{rope, RopeParams};
