//! Primitive nodes: the closed set of fused operator kinds.
//!
//! Every kind has a decomposition into host tensor ops (the fallback) and
//! may have an accelerated kernel. Differentiation and batching default to
//! replaying the fallback through the generic transforms; kinds with a
//! better rule override it in the match arms below.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use fuse_core::{FuseError, Result, Stream, Tensor};

use crate::attention::{self, SdpaParams};
use crate::custom::CustomOp;
use crate::custom_kernel::{self, KernelCall};
use crate::graph::{make_array, make_arrays, Array, OutputSpec};
use crate::norm::{self, NormParams};
use crate::quantize::{self, QuantParams};
use crate::rope::{self, RopeParams};

/// Operator kind plus its parameters.
#[derive(Clone, Debug)]
pub enum Op {
    RmsNorm(NormParams),
    RmsNormVjp(NormParams),
    LayerNorm(NormParams),
    LayerNormVjp(NormParams),
    Rope(RopeParams),
    ScaledDotProductAttention(SdpaParams),
    AffineQuantize(QuantParams),
    CustomKernel(Arc<KernelCall>),
    Custom(CustomOp),
}

/// Hashable identity of an operator kind and its parameters. Floats compare
/// by bit pattern.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EquivalenceKey {
    kind: &'static str,
    params: SmallVec<[u64; 6]>,
}

impl EquivalenceKey {
    fn new(kind: &'static str, params: &[u64]) -> Self {
        Self {
            kind,
            params: SmallVec::from_slice(params),
        }
    }

    pub fn kind(&self) -> &str {
        self.kind
    }
}

/// A deferred operator pinned to one stream.
#[derive(Clone)]
pub struct Primitive {
    stream: Stream,
    op: Op,
}

impl Primitive {
    pub fn new(stream: Stream, op: Op) -> Self {
        Self { stream, op }
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn name(&self) -> &str {
        match &self.op {
            Op::RmsNorm(_) => "RMSNorm",
            Op::RmsNormVjp(_) => "RMSNormVJP",
            Op::LayerNorm(_) => "LayerNorm",
            Op::LayerNormVjp(_) => "LayerNormVJP",
            Op::Rope(_) => "RoPE",
            Op::ScaledDotProductAttention(_) => "ScaledDotProductAttention",
            Op::AffineQuantize(_) => "AffineQuantize",
            Op::CustomKernel(call) => call.name(),
            Op::Custom(op) => op.name(),
        }
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// The decomposition into host tensor ops.
    pub fn fallback(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        match &self.op {
            Op::RmsNorm(p) => norm::rms_norm_fallback(inputs, *p),
            Op::RmsNormVjp(p) => norm::rms_norm_vjp_fallback(inputs, *p),
            Op::LayerNorm(p) => norm::layer_norm_fallback(inputs, *p),
            Op::LayerNormVjp(p) => norm::layer_norm_vjp_fallback(inputs, *p),
            Op::Rope(p) => rope::rope_fallback(inputs, *p),
            Op::ScaledDotProductAttention(p) => attention::sdpa_fallback(inputs, *p),
            Op::AffineQuantize(p) => quantize::quantize_fallback(inputs, *p),
            Op::CustomKernel(call) => Err(FuseError::invalid(
                "custom_kernel",
                format!("{} has no fallback and can only run on a device that compiles kernels.", call.name()),
            )),
            Op::Custom(op) => op.run_fallback(inputs),
        }
    }

    /// The accelerated kernel, when the stream's device has one for these
    /// inputs.
    fn accelerated(&self, inputs: &[Tensor]) -> Option<Result<Vec<Tensor>>> {
        if let Op::CustomKernel(call) = &self.op {
            return Some(custom_kernel::launch(call, inputs, self.stream));
        }
        if let Op::Custom(op) = &self.op {
            return op.run_accelerated(inputs);
        }
        if !self.stream.caps().fused_kernels {
            return None;
        }
        match &self.op {
            Op::RmsNorm(p) => Some(norm::rms_norm_accelerated(inputs, *p)),
            Op::RmsNormVjp(p) => Some(norm::rms_norm_vjp_accelerated(inputs, *p)),
            Op::LayerNorm(p) => Some(norm::layer_norm_accelerated(inputs, *p)),
            Op::LayerNormVjp(p) => Some(norm::layer_norm_vjp_accelerated(inputs, *p)),
            Op::Rope(p) => Some(rope::rope_accelerated(inputs, *p)),
            Op::ScaledDotProductAttention(p) => attention::sdpa_accelerated(inputs, *p),
            Op::AffineQuantize(p) => quantize::quantize_accelerated(inputs, *p),
            Op::CustomKernel(_) | Op::Custom(_) => None,
        }
    }

    /// Run on realized inputs: accelerated when available, else the fallback.
    pub fn eval(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        if let Some(result) = self.accelerated(inputs) {
            tracing::trace!(op = self.name(), stream = %self.stream, "accelerated kernel");
            return result;
        }
        tracing::trace!(op = self.name(), stream = %self.stream, "fallback");
        self.fallback(inputs)
    }

    // =========================================================================
    // Transform rules
    // =========================================================================

    /// Reverse-mode rule: gradients for the inputs listed in `argnums`, in
    /// that order.
    pub fn vjp(
        &self,
        primals: &[Tensor],
        cotangents: &[Tensor],
        argnums: &[usize],
        _outputs: &[Tensor],
    ) -> Result<Vec<Array>> {
        match &self.op {
            Op::RmsNorm(p) => {
                let [x, w] = exactly::<2>("vjp", self.name(), "primals", primals)?;
                let [g] = exactly::<1>("vjp", self.name(), "cotangents", cotangents)?;
                let vjps = make_arrays(
                    Primitive::new(self.stream, Op::RmsNormVjp(*p)),
                    vec![x.into(), w.into(), g.into()],
                    vec![OutputSpec::new(x.dims(), x.dtype()), OutputSpec::new(w.dims(), w.dtype())],
                );
                select(vjps, argnums, self.name())
            }
            Op::LayerNorm(p) => {
                let [x, w, b] = exactly::<3>("vjp", self.name(), "primals", primals)?;
                let [g] = exactly::<1>("vjp", self.name(), "cotangents", cotangents)?;
                let vjps = make_arrays(
                    Primitive::new(self.stream, Op::LayerNormVjp(*p)),
                    vec![x.into(), w.into(), b.into(), g.into()],
                    vec![
                        OutputSpec::new(x.dims(), x.dtype()),
                        OutputSpec::new(w.dims(), w.dtype()),
                        OutputSpec::new(b.dims(), b.dtype()),
                    ],
                );
                select(vjps, argnums, self.name())
            }
            Op::Rope(p) => {
                // the adjoint of a rotation is the rotation the other way
                exactly::<1>("vjp", self.name(), "primals", primals)?;
                let [g] = exactly::<1>("vjp", self.name(), "cotangents", cotangents)?;
                let out = make_array(
                    Primitive::new(self.stream, Op::Rope(p.inverted())),
                    vec![g.into()],
                    OutputSpec::new(g.dims(), g.dtype()),
                );
                select(vec![out], argnums, self.name())
            }
            Op::CustomKernel(call) => Err(no_rule(call.name(), "vjp")),
            _ => self.default_vjp(primals, cotangents, argnums),
        }
    }

    /// Forward-mode rule: `tangents[i]` is the tangent of input `argnums[i]`;
    /// every other input has a zero tangent.
    pub fn jvp(&self, primals: &[Tensor], tangents: &[Tensor], argnums: &[usize]) -> Result<Vec<Array>> {
        if tangents.len() != argnums.len() {
            return Err(FuseError::invalid(
                "jvp",
                format!("{} tangents for {} argnums.", tangents.len(), argnums.len()),
            ));
        }
        match &self.op {
            Op::Rope(p) => {
                let [x] = exactly::<1>("jvp", self.name(), "primals", primals)?;
                if let Some(&i) = argnums.iter().find(|&&i| i != 0) {
                    return Err(bad_argnum("jvp", self.name(), i));
                }
                // linear in its input
                match tangents.first() {
                    Some(t) => Ok(vec![make_array(
                        Primitive::new(self.stream, Op::Rope(*p)),
                        vec![t.into()],
                        OutputSpec::new(t.dims(), t.dtype()),
                    )]),
                    None => Ok(vec![Array::from(Tensor::zeros_like(x))]),
                }
            }
            Op::CustomKernel(call) => Err(no_rule(call.name(), "jvp")),
            _ => self.default_jvp(primals, tangents, argnums),
        }
    }

    /// Batching rule: outputs and the axis each is batched on.
    pub fn vmap(&self, inputs: &[Tensor], axes: &[Option<usize>]) -> Result<(Vec<Array>, Vec<usize>)> {
        if let Op::CustomKernel(call) = &self.op {
            return Err(no_rule(call.name(), "vmap"));
        }
        let outs = fuse_autograd::vmap_apply(&|xs: &[Tensor]| self.fallback(xs), inputs, axes)?;
        let axes = vec![0; outs.len()];
        Ok((outs.into_iter().map(Array::from).collect(), axes))
    }

    fn default_vjp(&self, primals: &[Tensor], cotangents: &[Tensor], argnums: &[usize]) -> Result<Vec<Array>> {
        let (_, grads) = fuse_autograd::vjp(|xs: &[Tensor]| self.fallback(xs), primals, cotangents)?;
        select(grads.into_iter().map(Array::from).collect(), argnums, self.name())
    }

    fn default_jvp(&self, primals: &[Tensor], tangents: &[Tensor], argnums: &[usize]) -> Result<Vec<Array>> {
        let mut full: Vec<Tensor> = primals.iter().map(Tensor::zeros_like).collect();
        for (&i, t) in argnums.iter().zip(tangents) {
            let slot = full.get_mut(i).ok_or_else(|| bad_argnum("jvp", self.name(), i))?;
            *slot = t.clone();
        }
        let (_, outs) = fuse_autograd::jvp(|xs: &[Tensor]| self.fallback(xs), primals, &full)?;
        Ok(outs.into_iter().map(Array::from).collect())
    }

    // =========================================================================
    // Equivalence
    // =========================================================================

    /// Key under which equivalent nodes merge. `None` never merges.
    pub fn equivalence_key(&self) -> Option<EquivalenceKey> {
        let f = |v: f32| v.to_bits() as u64;
        let key = match &self.op {
            Op::RmsNorm(p) => EquivalenceKey::new("RMSNorm", &[f(p.eps)]),
            Op::RmsNormVjp(p) => EquivalenceKey::new("RMSNormVJP", &[f(p.eps)]),
            Op::LayerNorm(p) => EquivalenceKey::new("LayerNorm", &[f(p.eps)]),
            Op::LayerNormVjp(p) => EquivalenceKey::new("LayerNormVJP", &[f(p.eps)]),
            Op::Rope(p) => EquivalenceKey::new(
                "RoPE",
                &[
                    p.dims as u64,
                    p.traditional as u64,
                    f(p.base),
                    f(p.scale),
                    p.offset as u32 as u64,
                    p.forward as u64,
                ],
            ),
            Op::ScaledDotProductAttention(p) => {
                EquivalenceKey::new("ScaledDotProductAttention", &[p.needs_mask as u64, f(p.scale)])
            }
            Op::AffineQuantize(p) => EquivalenceKey::new(
                "AffineQuantize",
                &[p.group_size as u64, p.bits as u64, p.mode as u64],
            ),
            Op::CustomKernel(_) => return None,
            Op::Custom(op) => EquivalenceKey::new("Custom", &[op.id() as u64]),
        };
        Some(key)
    }

    /// Same kind with identical parameters.
    pub fn is_equivalent(&self, other: &Primitive) -> bool {
        match (self.equivalence_key(), other.equivalence_key()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Primitive")
            .field("stream", &self.stream)
            .field("op", &self.op)
            .finish()
    }
}

fn select(vjps: Vec<Array>, argnums: &[usize], name: &str) -> Result<Vec<Array>> {
    argnums
        .iter()
        .map(|&i| vjps.get(i).cloned().ok_or_else(|| bad_argnum("vjp", name, i)))
        .collect()
}

fn bad_argnum(rule: &str, name: &str, i: usize) -> FuseError {
    FuseError::invalid(rule, format!("{name} has no input {i}."))
}

/// `got` as an array of exactly `N` tensors.
fn exactly<'a, const N: usize>(
    rule: &str,
    name: &str,
    what: &str,
    got: &'a [Tensor],
) -> Result<&'a [Tensor; N]> {
    got.try_into().map_err(|_| {
        FuseError::invalid(rule, format!("{name} expects {N} {what} but got {}.", got.len()))
    })
}

fn no_rule(name: &str, rule: &str) -> FuseError {
    FuseError::invalid(
        "custom_kernel",
        format!("{name} has no fallback, so {rule} is not supported."),
    )
}
