//! Dispatch policy: whether an operator call becomes a deferred fused node
//! or runs its fallback immediately.
//!
//! Every rule combines the stream's device capabilities with the runtime
//! [`DispatchConfig`]. The attention predicates are live configuration and
//! both start disabled.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fuse_core::{DType, Device, FuseError, Result, Stream};

// ============================================================================
// Configuration
// ============================================================================

/// Eligibility switches for the attention kernels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Single-query decode kernel (batch 1, one query position).
    pub fused_decode: bool,
    /// Blocked self-attention kernel (long queries, equal head counts).
    pub fused_self_attention: bool,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            fused_decode: false,
            fused_self_attention: false,
        }
    }
}

/// Runtime switches consulted by every operator before building a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub fused_norms: bool,
    pub fused_rope: bool,
    pub fused_quantize: bool,
    pub custom_kernels: bool,
    pub attention: AttentionConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            fused_norms: true,
            fused_rope: true,
            fused_quantize: true,
            custom_kernels: true,
            attention: AttentionConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Every operator runs its decomposition eagerly.
    pub fn fallback_only() -> Self {
        Self {
            fused_norms: false,
            fused_rope: false,
            fused_quantize: false,
            custom_kernels: false,
            attention: AttentionConfig::default(),
        }
    }

    /// Both attention kernels enabled on top of the defaults.
    pub fn with_fused_attention(mut self) -> Self {
        self.attention.fused_decode = true;
        self.attention.fused_self_attention = true;
        self
    }

    /// Parse from JSON text. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| FuseError::StorageError(format!("Failed to parse dispatch config: {e}")))
    }

    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FuseError::StorageError(format!("Failed to read dispatch config: {e}")))?;
        Self::from_json(&text)
    }
}

// ============================================================================
// Execution context
// ============================================================================

/// The stream an operator call is pinned to, plus the dispatch switches.
#[derive(Clone, Debug, Default)]
pub struct Context {
    pub stream: Stream,
    pub config: Arc<DispatchConfig>,
}

impl Context {
    pub fn new(stream: Stream, config: DispatchConfig) -> Self {
        Self {
            stream,
            config: Arc::new(config),
        }
    }

    /// Default stream of `device` with the default configuration.
    pub fn on(device: Device) -> Self {
        Self::new(Stream::default_for(device), DispatchConfig::default())
    }

    /// Host context that never builds fused nodes.
    pub fn fallback_only() -> Self {
        Self::new(Stream::default(), DispatchConfig::fallback_only())
    }

    /// Same stream, different switches.
    pub fn with_config(&self, config: DispatchConfig) -> Self {
        Self::new(self.stream, config)
    }
}

// ============================================================================
// Eligibility
// ============================================================================

fn fused_available(ctx: &Context, op: &str, enabled: bool) -> bool {
    let caps = ctx.stream.caps();
    let ok = enabled && caps.fused_kernels;
    tracing::debug!(
        op,
        stream = %ctx.stream,
        fused = ok,
        reason = if !enabled { "disabled" } else if !caps.fused_kernels { "device" } else { "eligible" },
        "dispatch"
    );
    ok
}

pub fn use_fused_norm(ctx: &Context, op: &str) -> bool {
    fused_available(ctx, op, ctx.config.fused_norms)
}

pub fn use_fused_rope(ctx: &Context) -> bool {
    fused_available(ctx, "rope", ctx.config.fused_rope)
}

/// The packing kernels are exact only for f32 inputs; other dtypes always
/// take the decomposition.
pub fn use_fused_quantize(ctx: &Context, op: &str, dtype: DType) -> bool {
    if dtype != DType::F32 {
        tracing::debug!(op, stream = %ctx.stream, fused = false, reason = "dtype", "dispatch");
        return false;
    }
    fused_available(ctx, op, ctx.config.fused_quantize)
}

/// Accelerated attention variant chosen for a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttentionPath {
    Decode,
    SelfAttention,
}

/// Shapes and dtype an attention call is judged on.
#[derive(Clone, Copy, Debug)]
pub struct AttentionProblem {
    pub batch: usize,
    pub q_heads: usize,
    pub kv_heads: usize,
    pub q_len: usize,
    pub head_dim: usize,
    pub has_mask: bool,
    pub dtype: DType,
}

/// Decide the attention path. `None` means run the decomposition now.
pub fn attention_path(ctx: &Context, p: &AttentionProblem) -> Option<AttentionPath> {
    let device_ok = ctx.stream.caps().fused_kernels;
    let dtype_ok = p.dtype != DType::BF16;

    let decode = p.batch == 1
        && p.q_len == 1
        && !p.has_mask
        && matches!(p.head_dim, 64 | 80 | 128)
        && dtype_ok
        && device_ok;
    let self_attention = p.q_len >= 16
        && !p.has_mask
        && matches!(p.head_dim, 64 | 128)
        && p.q_heads == p.kv_heads
        && dtype_ok
        && device_ok;

    let cfg = &ctx.config.attention;
    let path = if decode && cfg.fused_decode {
        Some(AttentionPath::Decode)
    } else if self_attention && cfg.fused_self_attention {
        Some(AttentionPath::SelfAttention)
    } else {
        None
    };
    tracing::debug!(
        op = "scaled_dot_product_attention",
        stream = %ctx.stream,
        eligible_decode = decode,
        eligible_self_attention = self_attention,
        path = ?path,
        "dispatch"
    );
    path
}

/// Whether custom kernels may be built on a context, and if not, why.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelSupport {
    Available,
    /// `custom_kernels` is switched off in the configuration.
    Disabled,
    /// The stream's device has no runtime kernel compiler.
    NoCompiler,
}

/// Custom kernels need the config switch on and a device that compiles
/// source at runtime. The switch is checked first.
pub fn kernel_support(ctx: &Context) -> KernelSupport {
    let support = if !ctx.config.custom_kernels {
        KernelSupport::Disabled
    } else if !ctx.stream.caps().kernel_compilation {
        KernelSupport::NoCompiler
    } else {
        KernelSupport::Available
    };
    if support != KernelSupport::Available {
        tracing::warn!(stream = %ctx.stream, reason = ?support, "custom kernels unavailable");
    }
    support
}
