//! RMSNorm and LayerNorm over the last axis, with closed-form gradients.
//!
//! ```text
//! rms_norm:   y = weight * x / sqrt(mean(x^2) + eps)
//! layer_norm: y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
//! ```
//!
//! Statistics are reduced in f32 (f64 inputs stay f64) and the normalized
//! value is cast to the output dtype before the affine parameters apply.

use fuse_core::{DType, FuseError, Result, Tensor};
use fuse_kernels::{
    fused_layer_norm, fused_layer_norm_backward, fused_rms_norm, fused_rms_norm_backward,
};

use crate::dispatch::{self, Context};
use crate::graph::{make_array, single, Array, OutputSpec};
use crate::primitive::{Op, Primitive};

/// Parameters shared by both normalizations and their gradient nodes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormParams {
    pub eps: f32,
}

/// Dtype statistics are reduced in.
fn stats_dtype(dtype: DType) -> DType {
    DType::F32.promote(dtype)
}

/// Sum over every axis but the last.
fn sum_leading(t: &Tensor) -> Result<Tensor> {
    let axes: Vec<isize> = (0..t.ndim().saturating_sub(1) as isize).collect();
    t.sum_axes(&axes, false)
}

fn check_input(x: &Array, op: &str) -> Result<usize> {
    match x.dims().last() {
        Some(&d) => Ok(d),
        None => Err(FuseError::invalid(
            op,
            "Input must have at least 1 dimension but got input with 0 dimensions.",
        )),
    }
}

fn check_param(p: &Array, what: &str, d: usize, x: &Array, op: &str) -> Result<()> {
    if p.ndim() != 1 {
        return Err(FuseError::invalid(
            op,
            format!("{what} must have 1 dimension but has {} dimensions.", p.ndim()),
        ));
    }
    if p.dims()[0] != d {
        return Err(FuseError::invalid(
            op,
            format!(
                "{what} must have the same size as the last dimension of the input but has {} elements for an input with shape {}.",
                p.dims()[0],
                x.shape()
            ),
        ));
    }
    Ok(())
}

fn float_type(dtypes: &[DType], op: &str) -> Result<DType> {
    match DType::result_type(dtypes) {
        Some(t) if t.is_float() => Ok(t),
        Some(t) => Err(FuseError::invalid(op, format!("Received unsupported type {t}."))),
        None => Err(FuseError::invalid(op, "Received no inputs.")),
    }
}

// ============================================================================
// RMSNorm
// ============================================================================

/// Root-mean-square normalization of `x` over its last axis, scaled by the
/// 1-D `weight`.
pub fn rms_norm(x: &Array, weight: &Array, eps: f32, ctx: &Context) -> Result<Array> {
    let d = check_input(x, "rms_norm")?;
    check_param(weight, "weight", d, x, "rms_norm")?;
    let out_type = float_type(&[x.dtype(), weight.dtype()], "rms_norm")?;

    let params = NormParams { eps };
    if dispatch::use_fused_norm(ctx, "rms_norm") {
        return Ok(make_array(
            Primitive::new(ctx.stream, Op::RmsNorm(params)),
            vec![x.astype(out_type)?, weight.astype(out_type)?],
            OutputSpec::new(x.dims(), out_type),
        ));
    }
    single(rms_norm_fallback(&[x.eval()?, weight.eval()?], params)?, "rms_norm")
}

pub(crate) fn rms_norm_fallback(inputs: &[Tensor], p: NormParams) -> Result<Vec<Tensor>> {
    let (x, w) = (&inputs[0], &inputs[1]);
    let out_type = x.dtype().promote(w.dtype());
    let x = x.astype(stats_dtype(x.dtype()))?;
    let n = x
        .square()?
        .mean_axes(&[-1], true)?
        .add(&Tensor::scalar(p.eps as f64, DType::F32))?
        .rsqrt()?;
    let y = x.mul(&n)?.astype(out_type)?;
    Ok(vec![w.mul(&y)?])
}

pub(crate) fn rms_norm_accelerated(inputs: &[Tensor], p: NormParams) -> Result<Vec<Tensor>> {
    let (x, w) = (&inputs[0], &inputs[1]);
    let out_type = x.dtype().promote(w.dtype());
    Ok(vec![fused_rms_norm(x, w, p.eps, out_type)?])
}

/// Inputs `[x, weight, cotangent]`, outputs `[dx, dweight]`.
pub(crate) fn rms_norm_vjp_fallback(inputs: &[Tensor], p: NormParams) -> Result<Vec<Tensor>> {
    let (x, w, g) = (&inputs[0], &inputs[1], &inputs[2]);
    let n = x
        .square()?
        .mean_axes(&[-1], true)?
        .add(&Tensor::scalar(p.eps as f64, x.dtype()))?
        .rsqrt()?;
    let n3 = n.pow_scalar(3.0)?;

    let gw = g.mul(w)?;
    let t = gw.mul(x)?.mean_axes(&[-1], true)?;
    let t = x.mul(&t)?.mul(&n3)?;
    let dx = gw.mul(&n)?.sub(&t)?;

    let dw = sum_leading(&g.mul(&x.mul(&n)?)?)?;
    Ok(vec![dx.astype(x.dtype())?, dw.astype(w.dtype())?])
}

pub(crate) fn rms_norm_vjp_accelerated(inputs: &[Tensor], p: NormParams) -> Result<Vec<Tensor>> {
    let (dx, dw) = fused_rms_norm_backward(&inputs[0], &inputs[1], &inputs[2], p.eps)?;
    Ok(vec![dx, dw])
}

// ============================================================================
// LayerNorm
// ============================================================================

/// Layer normalization of `x` over its last axis. `weight` and `bias` are
/// each applied only when given.
pub fn layer_norm(
    x: &Array,
    weight: Option<&Array>,
    bias: Option<&Array>,
    eps: f32,
    ctx: &Context,
) -> Result<Array> {
    let d = check_input(x, "layer_norm")?;
    if let Some(w) = weight {
        check_param(w, "weight", d, x, "layer_norm")?;
    }
    if let Some(b) = bias {
        check_param(b, "bias", d, x, "layer_norm")?;
    }
    // without a weight the input dtype wins, even over a bias
    let dtypes: Vec<DType> = match weight {
        Some(w) => std::iter::once(x).chain(Some(w)).chain(bias).map(Array::dtype).collect(),
        None => vec![x.dtype()],
    };
    let out_type = float_type(&dtypes, "layer_norm")?;

    // absent parameters ride along as 0-D identities so the arity stays 3
    let passed_weight = match weight {
        Some(w) => w.astype(out_type)?,
        None => Array::from(Tensor::scalar(1.0, out_type)),
    };
    let passed_bias = match bias {
        Some(b) => b.astype(out_type)?,
        None => Array::from(Tensor::scalar(0.0, out_type)),
    };

    let params = NormParams { eps };
    if dispatch::use_fused_norm(ctx, "layer_norm") {
        return Ok(make_array(
            Primitive::new(ctx.stream, Op::LayerNorm(params)),
            vec![x.astype(out_type)?, passed_weight, passed_bias],
            OutputSpec::new(x.dims(), out_type),
        ));
    }
    single(
        layer_norm_fallback(&[x.eval()?, passed_weight.eval()?, passed_bias.eval()?], params)?,
        "layer_norm",
    )
}

pub(crate) fn layer_norm_fallback(inputs: &[Tensor], p: NormParams) -> Result<Vec<Tensor>> {
    let (x, w, b) = (&inputs[0], &inputs[1], &inputs[2]);
    let out_type = x.dtype().promote(w.dtype()).promote(b.dtype());
    let x = x.astype(stats_dtype(x.dtype()))?;

    let mu = x.mean_axes(&[-1], true)?;
    let mu2 = x.square()?.mean_axes(&[-1], true)?;
    let var = mu2.sub(&mu.square()?)?;
    let n = var.add(&Tensor::scalar(p.eps as f64, DType::F32))?.rsqrt()?;
    let mut y = x.sub(&mu)?.mul(&n)?.astype(out_type)?;
    if w.ndim() == 1 {
        y = y.mul(w)?;
    }
    if b.ndim() == 1 {
        y = y.add(b)?;
    }
    Ok(vec![y])
}

pub(crate) fn layer_norm_accelerated(inputs: &[Tensor], p: NormParams) -> Result<Vec<Tensor>> {
    let (x, w, b) = (&inputs[0], &inputs[1], &inputs[2]);
    let out_type = x.dtype().promote(w.dtype()).promote(b.dtype());
    let weight = (w.ndim() == 1).then_some(w);
    let bias = (b.ndim() == 1).then_some(b);
    Ok(vec![fused_layer_norm(x, weight, bias, p.eps, out_type)?])
}

/// Inputs `[x, weight, bias, cotangent]`, outputs `[dx, dweight, dbias]`.
/// Placeholder parameters get zero gradients of their own shape.
pub(crate) fn layer_norm_vjp_fallback(inputs: &[Tensor], p: NormParams) -> Result<Vec<Tensor>> {
    let (x, w, b, g) = (&inputs[0], &inputs[1], &inputs[2], &inputs[3]);
    let d = x.dims().last().copied().unwrap_or(1).max(1);
    let norm = 1.0 / d as f64;

    let mu = x.sum_axes(&[-1], true)?.mul_scalar(norm)?;
    let mu2 = x.square()?.sum_axes(&[-1], true)?.mul_scalar(norm)?;
    let var = mu2.sub(&mu.square()?)?;
    let n = var.add(&Tensor::scalar(p.eps as f64, x.dtype()))?.rsqrt()?;
    let n3 = n.pow_scalar(3.0)?;
    let x_c = x.sub(&mu)?;

    let wg = w.mul(g)?;
    let sumwg = wg.sum_axes(&[-1], true)?.mul_scalar(norm)?;
    let sumwgxc = wg.mul(&x_c)?.sum_axes(&[-1], true)?.mul_scalar(norm)?;
    let t1 = x_c.mul(&sumwgxc)?.mul(&n3)?;
    let t2 = wg.sub(&sumwg)?.mul(&n)?;
    let dx = t2.sub(&t1)?;

    let dw = if w.ndim() == 0 {
        Tensor::zeros_like(w)
    } else {
        sum_leading(&g.mul(&x_c.mul(&n)?)?)?
    };
    let db = if b.ndim() == 0 {
        Tensor::zeros_like(b)
    } else {
        sum_leading(g)?
    };
    Ok(vec![dx.astype(x.dtype())?, dw.astype(w.dtype())?, db.astype(b.dtype())?])
}

pub(crate) fn layer_norm_vjp_accelerated(inputs: &[Tensor], p: NormParams) -> Result<Vec<Tensor>> {
    let (x, w, b, g) = (&inputs[0], &inputs[1], &inputs[2], &inputs[3]);
    let weight = (w.ndim() == 1).then_some(w);
    let (dx, dw, db) = fused_layer_norm_backward(x, weight, g, p.eps, b.dtype())?;
    let dw = dw.unwrap_or_else(|| Tensor::zeros_like(w));
    let db = if b.ndim() == 0 { Tensor::zeros_like(b) } else { db };
    Ok(vec![dx, dw, db])
}
