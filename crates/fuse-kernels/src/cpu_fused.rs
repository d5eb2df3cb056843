//! Fused CPU operations for reduced memory traffic.
//!
//! Each kernel makes one pass per row over the data, with no intermediate
//! tensors. Rows are independent and run on the rayon pool once there are
//! enough of them.

use rayon::prelude::*;

use fuse_core::{DType, FuseError, Result, Tensor};

use crate::PAR_ROWS;

/// Run `f(row_index, row)` over consecutive `width`-sized rows of `out`.
pub(crate) fn for_each_row<T, F>(out: &mut [T], width: usize, f: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Sync + Send,
{
    if width == 0 || out.is_empty() {
        return;
    }
    if out.len() / width >= PAR_ROWS {
        out.par_chunks_mut(width).enumerate().for_each(|(r, row)| f(r, row));
    } else {
        out.chunks_mut(width).enumerate().for_each(|(r, row)| f(r, row));
    }
}

/// Wrap f32 results as a tensor of `dtype`.
pub(crate) fn finish(values: Vec<f32>, dims: &[usize], dtype: DType) -> Result<Tensor> {
    if dtype == DType::F32 {
        return Ok(Tensor::from_f32(&values, dims));
    }
    let wide: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    Tensor::from_values(&wide, dims, dtype)
}

fn last_dim(x: &Tensor, op: &str) -> Result<usize> {
    x.dims()
        .last()
        .copied()
        .ok_or_else(|| FuseError::invalid(op, "input must have at least 1 dimension."))
}

fn check_vector(t: &Tensor, len: usize) -> Result<()> {
    if t.dims() != [len] {
        return Err(FuseError::ShapeMismatch {
            expected: vec![len],
            got: t.dims().to_vec(),
        });
    }
    Ok(())
}

// ============================================================================
// Normalization
// ============================================================================

/// Fused RMS normalization over the last axis:
/// `weight * x / sqrt(mean(x^2) + eps)`.
pub fn fused_rms_norm(x: &Tensor, weight: &Tensor, eps: f32, out_dtype: DType) -> Result<Tensor> {
    let d = last_dim(x, "rms_norm")?;
    check_vector(weight, d)?;

    let xs = x.to_vec_f32();
    let ws = weight.to_vec_f32();
    let mut out = vec![0.0f32; xs.len()];

    for_each_row(&mut out, d, |r, row| {
        let xr = &xs[r * d..(r + 1) * d];
        let sum_sq: f32 = xr.iter().map(|&v| v * v).sum();
        let n = 1.0 / (sum_sq / d as f32 + eps).sqrt();
        for ((o, &xv), &wv) in row.iter_mut().zip(xr).zip(&ws) {
            *o = wv * (xv * n);
        }
    });

    finish(out, x.dims(), out_dtype)
}

/// Fused layer normalization over the last axis with one-pass statistics
/// (`var = E[x^2] - E[x]^2`). Weight and bias are applied only when given.
pub fn fused_layer_norm(
    x: &Tensor,
    weight: Option<&Tensor>,
    bias: Option<&Tensor>,
    eps: f32,
    out_dtype: DType,
) -> Result<Tensor> {
    let d = last_dim(x, "layer_norm")?;
    let ws = match weight {
        Some(w) => {
            check_vector(w, d)?;
            Some(w.to_vec_f32())
        }
        None => None,
    };
    let bs = match bias {
        Some(b) => {
            check_vector(b, d)?;
            Some(b.to_vec_f32())
        }
        None => None,
    };

    let xs = x.to_vec_f32();
    let mut out = vec![0.0f32; xs.len()];

    for_each_row(&mut out, d, |r, row| {
        let xr = &xs[r * d..(r + 1) * d];
        let (mut s, mut s2) = (0.0f32, 0.0f32);
        for &v in xr {
            s += v;
            s2 += v * v;
        }
        let mu = s / d as f32;
        let var = s2 / d as f32 - mu * mu;
        let n = 1.0 / (var + eps).sqrt();
        for (i, (o, &xv)) in row.iter_mut().zip(xr).enumerate() {
            let mut y = (xv - mu) * n;
            if let Some(ws) = &ws {
                y *= ws[i];
            }
            if let Some(bs) = &bs {
                y += bs[i];
            }
            *o = y;
        }
    });

    finish(out, x.dims(), out_dtype)
}

// ============================================================================
// Rotary position encoding
// ============================================================================

/// Parameters of one rotary encoding pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeConfig {
    pub dims: usize,
    pub traditional: bool,
    pub base: f32,
    pub scale: f32,
    pub offset: i32,
    pub forward: bool,
}

/// `cos`/`sin` tables of shape `[seq, dims / 2]`.
fn rope_tables(seq: usize, cfg: &RopeConfig) -> (Vec<f32>, Vec<f32>) {
    let half = cfg.dims / 2;
    let step = cfg.base.ln() / half as f32;
    let freqs: Vec<f32> = (0..half).map(|i| (-(i as f32) * step).exp()).collect();
    let mut cos = Vec::with_capacity(seq * half);
    let mut sin = Vec::with_capacity(seq * half);
    for p in 0..seq {
        let pos = (cfg.offset as f32 + p as f32) * cfg.scale;
        for &f in &freqs {
            let theta = pos * f;
            cos.push(theta.cos());
            sin.push(theta.sin());
        }
    }
    (cos, sin)
}

/// Rotary position encoding over `[..., seq, features]`; positions run along
/// the second-to-last axis. Features past `dims` are copied through.
pub fn fused_rope(x: &Tensor, cfg: &RopeConfig) -> Result<Tensor> {
    if x.ndim() < 3 {
        return Err(FuseError::invalid(
            "rope",
            format!("input must have at least 3 dimensions but has {}.", x.ndim()),
        ));
    }
    let d = x.dims()[x.ndim() - 1];
    let seq = x.dims()[x.ndim() - 2];
    if cfg.dims == 0 || cfg.dims % 2 != 0 || cfg.dims > d {
        return Err(FuseError::invalid(
            "rope",
            format!("cannot rotate {} of {d} features.", cfg.dims),
        ));
    }

    let half = cfg.dims / 2;
    let (cos, sin) = rope_tables(seq, cfg);
    let xs = x.to_vec_f32();
    let mut out = xs.clone();

    for_each_row(&mut out, d, |r, row| {
        let p = r % seq;
        let xr = &xs[r * d..(r + 1) * d];
        for i in 0..half {
            let (c, s) = (cos[p * half + i], sin[p * half + i]);
            let (ia, ib) = if cfg.traditional { (2 * i, 2 * i + 1) } else { (i, i + half) };
            let (a, b) = (xr[ia], xr[ib]);
            if cfg.forward {
                row[ia] = a * c - b * s;
                row[ib] = a * s + b * c;
            } else {
                row[ia] = b * s + a * c;
                row[ib] = b * c - a * s;
            }
        }
    });

    finish(out, x.dims(), x.dtype())
}

// ============================================================================
// Attention
// ============================================================================

/// Block of keys processed per online-softmax step.
const KV_BLOCK: usize = 32;

struct AttnDims {
    batch: usize,
    q_heads: usize,
    kv_heads: usize,
    q_len: usize,
    kv_len: usize,
    head_dim: usize,
    v_dim: usize,
}

fn attention_dims(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<AttnDims> {
    for t in [q, k, v] {
        if t.ndim() != 4 {
            return Err(FuseError::invalid(
                "scaled_dot_product_attention",
                format!("input with shape {} expected to be rank 4", t.shape()),
            ));
        }
    }
    let (qd, kd, vd) = (q.dims(), k.dims(), v.dims());
    let valid = kd[0] == qd[0]
        && vd[0] == qd[0]
        && kd[3] == qd[3]
        && kd[1] == vd[1]
        && kd[2] == vd[2]
        && kd[1] > 0
        && qd[1] % kd[1] == 0;
    if !valid {
        return Err(FuseError::invalid(
            "scaled_dot_product_attention",
            format!(
                "incompatible shapes {} / {} / {}.",
                q.shape(),
                k.shape(),
                v.shape()
            ),
        ));
    }
    Ok(AttnDims {
        batch: qd[0],
        q_heads: qd[1],
        kv_heads: kd[1],
        q_len: qd[2],
        kv_len: kd[2],
        head_dim: qd[3],
        v_dim: vd[3],
    })
}

impl AttnDims {
    /// Offsets of the `(k, v)` rows for query row `r` (flat over `[B, Hq, L]`).
    fn kv_base(&self, r: usize) -> (usize, usize) {
        let h = (r / self.q_len) % self.q_heads;
        let b = r / (self.q_len * self.q_heads);
        let kv_h = h / (self.q_heads / self.kv_heads);
        let head = b * self.kv_heads + kv_h;
        (
            head * self.kv_len * self.head_dim,
            head * self.kv_len * self.v_dim,
        )
    }

    fn out_dims(&self) -> [usize; 4] {
        [self.batch, self.q_heads, self.q_len, self.v_dim]
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Single-query attention for decoding: batch 1, one query position, all
/// heads in parallel. Grouped heads index the shared kv head directly.
pub fn fused_sdpa_decode(q: &Tensor, k: &Tensor, v: &Tensor, scale: f32) -> Result<Tensor> {
    let dims = attention_dims(q, k, v)?;
    if dims.batch != 1 || dims.q_len != 1 {
        return Err(FuseError::invalid(
            "scaled_dot_product_attention",
            format!("decode kernel needs batch 1 and one query, got {}.", q.shape()),
        ));
    }
    let (qs, ks, vs) = (q.to_vec_f32(), k.to_vec_f32(), v.to_vec_f32());
    let (dk, dv, s_len) = (dims.head_dim, dims.v_dim, dims.kv_len);
    let mut out = vec![0.0f32; dims.q_heads * dv];

    out.par_chunks_mut(dv.max(1)).enumerate().for_each(|(h, row)| {
        let qr: Vec<f32> = qs[h * dk..(h + 1) * dk].iter().map(|&x| x * scale).collect();
        let (kb, vb) = dims.kv_base(h);
        let scores: Vec<f32> = (0..s_len)
            .map(|j| dot(&qr, &ks[kb + j * dk..kb + (j + 1) * dk]))
            .collect();
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut denom = 0.0f32;
        for (j, &sc) in scores.iter().enumerate() {
            let w = (sc - max).exp();
            denom += w;
            for (o, &vv) in row.iter_mut().zip(&vs[vb + j * dv..vb + (j + 1) * dv]) {
                *o += w * vv;
            }
        }
        if denom > 0.0 {
            row.iter_mut().for_each(|o| *o /= denom);
        }
    });

    finish(out, &dims.out_dims(), q.dtype())
}

/// Full self-attention with online softmax over key blocks; the score
/// matrix is never materialized.
pub fn fused_sdpa_self_attention(q: &Tensor, k: &Tensor, v: &Tensor, scale: f32) -> Result<Tensor> {
    let dims = attention_dims(q, k, v)?;
    let (qs, ks, vs) = (q.to_vec_f32(), k.to_vec_f32(), v.to_vec_f32());
    let (dk, dv, s_len) = (dims.head_dim, dims.v_dim, dims.kv_len);
    let rows = dims.batch * dims.q_heads * dims.q_len;
    let mut out = vec![0.0f32; rows * dv];

    for_each_row(&mut out, dv, |r, row| {
        let qr: Vec<f32> = qs[r * dk..(r + 1) * dk].iter().map(|&x| x * scale).collect();
        let (kb, vb) = dims.kv_base(r);
        let mut row_max = f32::NEG_INFINITY;
        let mut row_sum = 0.0f32;
        let mut block = [0.0f32; KV_BLOCK];

        for start in (0..s_len).step_by(KV_BLOCK) {
            let end = (start + KV_BLOCK).min(s_len);
            let mut block_max = f32::NEG_INFINITY;
            for (bj, j) in (start..end).enumerate() {
                block[bj] = dot(&qr, &ks[kb + j * dk..kb + (j + 1) * dk]);
                block_max = block_max.max(block[bj]);
            }

            let new_max = row_max.max(block_max);
            let rescale = (row_max - new_max).exp();
            row_sum *= rescale;
            row.iter_mut().for_each(|o| *o *= rescale);

            for (bj, j) in (start..end).enumerate() {
                let w = (block[bj] - new_max).exp();
                row_sum += w;
                for (o, &vv) in row.iter_mut().zip(&vs[vb + j * dv..vb + (j + 1) * dv]) {
                    *o += w * vv;
                }
            }
            row_max = new_max;
        }

        let inv = if row_sum > 0.0 { 1.0 / row_sum } else { 0.0 };
        row.iter_mut().for_each(|o| *o *= inv);
    });

    finish(out, &dims.out_dims(), q.dtype())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() < tol, "element {i}: {x} vs {y}");
        }
    }

    #[test]
    fn test_rms_norm_unit_weight() {
        let x = Tensor::from_f32(&[3.0, 4.0], &[1, 2]);
        let w = Tensor::from_f32(&[1.0, 1.0], &[2]);
        let y = fused_rms_norm(&x, &w, 0.0, DType::F32).unwrap();
        // rms = sqrt(12.5)
        let r = 12.5f32.sqrt();
        assert_close(&y.to_vec_f32(), &[3.0 / r, 4.0 / r], 1e-6);
    }

    #[test]
    fn test_rms_norm_weight_length_checked() {
        let x = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
        let w = Tensor::from_f32(&[1.0, 1.0], &[2]);
        assert!(fused_rms_norm(&x, &w, 1e-5, DType::F32).is_err());
    }

    #[test]
    fn test_layer_norm_affine() {
        let x = Tensor::from_f32(&[1.0, 3.0, 2.0, 2.0], &[2, 2]);
        let w = Tensor::from_f32(&[2.0, 2.0], &[2]);
        let b = Tensor::from_f32(&[1.0, -1.0], &[2]);
        let y = fused_layer_norm(&x, Some(&w), Some(&b), 0.0, DType::F32).unwrap();
        // row 0 normalizes to [-1, 1]; row 1 has zero variance
        let out = y.to_vec_f32();
        assert_close(&out[..2], &[-1.0, 1.0], 1e-5);
    }

    #[test]
    fn test_layer_norm_output_dtype() {
        let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[4]);
        let y = fused_layer_norm(&x, None, None, 1e-5, DType::F16).unwrap();
        assert_eq!(y.dtype(), DType::F16);
    }

    #[test]
    fn test_rope_zero_position_is_identity() {
        let cfg = RopeConfig {
            dims: 4,
            traditional: false,
            base: 10000.0,
            scale: 1.0,
            offset: 0,
            forward: true,
        };
        let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0], &[1, 1, 5]);
        let y = fused_rope(&x, &cfg).unwrap();
        assert_close(&y.to_vec_f32(), &[1.0, 2.0, 3.0, 4.0, 5.0], 1e-6);
    }

    #[test]
    fn test_rope_traditional_quarter_turn() {
        // dims = 2 leaves the single frequency 1, so theta = offset * scale = pi/2
        let cfg = RopeConfig {
            dims: 2,
            traditional: true,
            base: 10.0,
            scale: std::f32::consts::FRAC_PI_2,
            offset: 1,
            forward: true,
        };
        let x = Tensor::from_f32(&[1.0, 0.0, 7.0], &[1, 1, 3]);
        let y = fused_rope(&x, &cfg).unwrap().to_vec_f32();
        assert_close(&y, &[0.0, 1.0, 7.0], 1e-6);
    }

    #[test]
    fn test_rope_inverse_undoes_forward() {
        let mut cfg = RopeConfig {
            dims: 6,
            traditional: false,
            base: 500.0,
            scale: 0.5,
            offset: 3,
            forward: true,
        };
        let x = Tensor::randn_seeded(&[2, 5, 8], 42);
        let y = fused_rope(&x, &cfg).unwrap();
        cfg.forward = false;
        let back = fused_rope(&y, &cfg).unwrap();
        assert_close(&back.to_vec_f32(), &x.to_vec_f32(), 1e-5);
    }

    #[test]
    fn test_attention_uniform_keys() {
        // identical keys -> uniform weights -> mean of values
        let q = Tensor::from_f32(&[1.0, 0.5], &[1, 1, 1, 2]);
        let k = Tensor::from_f32(&[1.0, 1.0, 1.0, 1.0, 1.0, 1.0], &[1, 1, 3, 2]);
        let v = Tensor::from_f32(&[1.0, 2.0, 3.0], &[1, 1, 3, 1]);
        let dec = fused_sdpa_decode(&q, &k, &v, 0.7).unwrap();
        let full = fused_sdpa_self_attention(&q, &k, &v, 0.7).unwrap();
        assert_eq!(dec.dims(), &[1, 1, 1, 1]);
        assert_close(&dec.to_vec_f32(), &[2.0], 1e-6);
        assert_close(&full.to_vec_f32(), &[2.0], 1e-6);
    }

    #[test]
    fn test_attention_kernels_agree_past_one_block() {
        let q = Tensor::randn_seeded(&[1, 4, 1, 8], 1);
        let k = Tensor::randn_seeded(&[1, 2, 70, 8], 2);
        let v = Tensor::randn_seeded(&[1, 2, 70, 4], 3);
        let a = fused_sdpa_decode(&q, &k, &v, 0.35).unwrap();
        let b = fused_sdpa_self_attention(&q, &k, &v, 0.35).unwrap();
        assert_eq!(a.dims(), &[1, 4, 1, 4]);
        assert_close(&a.to_vec_f32(), &b.to_vec_f32(), 1e-5);
    }
}
