//! Scaled dot-product attention with grouped-query support.
//!
//! `out = softmax(scale * q @ k^T + mask) @ v` over `[batch, heads, seq,
//! head_dim]` tensors. When there are fewer key/value heads than query heads
//! each kv head serves `q_heads / kv_heads` consecutive query heads; the
//! decomposition broadcasts instead of tiling k and v.

use fuse_core::{DType, FuseError, Result, Tensor};
use fuse_kernels::{fused_sdpa_decode, fused_sdpa_self_attention};

use crate::dispatch::{self, AttentionPath, AttentionProblem, Context};
use crate::graph::{make_array, single, Array, OutputSpec};
use crate::primitive::{Op, Primitive};

const OP: &str = "scaled_dot_product_attention";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SdpaParams {
    pub scale: f32,
    pub needs_mask: bool,
}

fn check_shapes(q: &Array, k: &Array, v: &Array, mask: Option<&Array>) -> Result<()> {
    for t in [q, k, v] {
        if t.ndim() != 4 {
            return Err(FuseError::invalid(
                OP,
                format!("input with shape {} expected to be rank 4", t.shape()),
            ));
        }
    }
    let (qd, kd, vd) = (q.dims(), k.dims(), v.dims());
    for t in [k, v] {
        if t.dims()[0] != qd[0] {
            return Err(FuseError::invalid(
                OP,
                format!("mismatching batch dimension for input with shape {}.", t.shape()),
            ));
        }
    }
    if qd[3] != kd[3] {
        return Err(FuseError::invalid(
            OP,
            format!(
                "query, keys expected to have matching last dimension; found query shape {} for keys shape {}.",
                q.shape(),
                k.shape()
            ),
        ));
    }
    if kd[1] != vd[1] {
        return Err(FuseError::invalid(
            OP,
            format!(
                "keys, values expected to have matching n_kv_heads; found keys with n_heads {} for values with n_heads {}.",
                kd[1], vd[1]
            ),
        ));
    }
    if kd[1] == 0 || qd[1] % kd[1] != 0 {
        return Err(FuseError::invalid(
            OP,
            format!(
                "n_heads must be a multiple of n_kv_heads, found n_heads {} for n_kv_heads {}.",
                qd[1], kd[1]
            ),
        ));
    }
    if kd[2] != vd[2] {
        return Err(FuseError::invalid(
            OP,
            format!(
                "keys, values expected to have matching sequence length; found keys with length {} for values with length {}.",
                kd[2], vd[2]
            ),
        ));
    }
    if let Some(m) = mask {
        let target = [qd[0], qd[1], qd[2], kd[2]];
        let fits = m.ndim() <= 4
            && m.dims()
                .iter()
                .rev()
                .zip(target.iter().rev())
                .all(|(&a, &b)| a == b || a == 1);
        if !fits {
            return Err(FuseError::invalid(
                OP,
                format!(
                    "mask with shape {} cannot be broadcast to the scores shape ({},{},{},{}).",
                    m.shape(),
                    target[0],
                    target[1],
                    target[2],
                    target[3]
                ),
            ));
        }
    }
    Ok(())
}

/// Attention of `queries` over `keys`/`values`. An optional additive `mask`
/// must broadcast to `[batch, q_heads, q_seq, kv_seq]`.
pub fn scaled_dot_product_attention(
    queries: &Array,
    keys: &Array,
    values: &Array,
    scale: f32,
    mask: Option<&Array>,
    ctx: &Context,
) -> Result<Array> {
    check_shapes(queries, keys, values, mask)?;
    let final_type = match DType::result_type(&[queries.dtype(), keys.dtype(), values.dtype()]) {
        Some(t) if t.is_float() => t,
        Some(t) => return Err(FuseError::invalid(OP, format!("Received unsupported type {t}."))),
        None => return Err(FuseError::invalid(OP, "Received no inputs.")),
    };
    let q = queries.astype(final_type)?;
    let k = keys.astype(final_type)?;
    let v = values.astype(final_type)?;

    let (qd, kd) = (q.dims().to_vec(), k.dims().to_vec());
    let problem = AttentionProblem {
        batch: qd[0],
        q_heads: qd[1],
        kv_heads: kd[1],
        q_len: qd[2],
        head_dim: qd[3],
        has_mask: mask.is_some(),
        dtype: final_type,
    };
    let params = SdpaParams {
        scale,
        needs_mask: mask.is_some(),
    };

    if dispatch::attention_path(ctx, &problem).is_some() {
        let out_dims = [qd[0], qd[1], qd[2], v.dims()[3]];
        return Ok(make_array(
            Primitive::new(ctx.stream, Op::ScaledDotProductAttention(params)),
            vec![q, k, v],
            OutputSpec::new(&out_dims, final_type),
        ));
    }

    let mut inputs = vec![q.eval()?, k.eval()?, v.eval()?];
    if let Some(m) = mask {
        inputs.push(m.eval()?);
    }
    single(sdpa_fallback(&inputs, params)?, OP)
}

/// Inputs `[q, k, v]` or `[q, k, v, mask]`.
pub(crate) fn sdpa_fallback(inputs: &[Tensor], p: SdpaParams) -> Result<Vec<Tensor>> {
    let q = &inputs[0];
    let (mut k, mut v) = (inputs[1].clone(), inputs[2].clone());
    let (b, q_heads, l) = (q.dims()[0], q.dims()[1], q.dims()[2]);
    let (kv_heads, s) = (k.dims()[1], k.dims()[2]);
    let (d, dv) = (q.dims()[3], v.dims()[3]);
    let n_rep = q_heads / kv_heads.max(1);

    let mut q = Tensor::scalar(p.scale as f64, q.dtype()).mul(q)?;
    if n_rep > 1 {
        q = q.reshape_to(&[b, kv_heads, n_rep, l, d])?;
        k = k.expand_dims(2)?;
        v = v.expand_dims(2)?;
    }
    let mut scores = q.matmul(&k.swapaxes(-1, -2)?)?;
    if p.needs_mask {
        let mask = inputs
            .get(3)
            .ok_or_else(|| FuseError::invalid(OP, "mask flagged but not provided."))?;
        let mut mask = mask.broadcast_to(&[b, q_heads, l, s])?;
        if n_rep > 1 {
            mask = mask.reshape_to(&[b, kv_heads, n_rep, l, s])?;
        }
        scores = scores.add(&mask)?;
    }
    let scores = scores.softmax(-1)?;
    let mut out = scores.matmul(&v)?;
    if n_rep > 1 {
        out = out.reshape_to(&[b, q_heads, l, dv])?;
    }
    Ok(vec![out])
}

/// Masked calls have no kernel. Single-query batch-1 calls use the decode
/// kernel, everything else the blocked self-attention kernel.
pub(crate) fn sdpa_accelerated(inputs: &[Tensor], p: SdpaParams) -> Option<Result<Vec<Tensor>>> {
    if p.needs_mask || inputs.len() != 3 {
        return None;
    }
    let (q, k, v) = (&inputs[0], &inputs[1], &inputs[2]);
    let path = if q.dims()[0] == 1 && q.dims()[2] == 1 {
        AttentionPath::Decode
    } else {
        AttentionPath::SelfAttention
    };
    tracing::trace!(op = OP, path = ?path, "kernel");
    let out = match path {
        AttentionPath::Decode => fused_sdpa_decode(q, k, v, p.scale),
        AttentionPath::SelfAttention => fused_sdpa_self_attention(q, k, v, p.scale),
    };
    Some(out.map(|t| vec![t]))
}
