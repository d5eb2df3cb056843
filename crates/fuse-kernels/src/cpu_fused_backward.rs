//! Fused backward (gradient) kernels for the normalization layers.
//!
//! Each function computes the input gradient row by row in a single pass and
//! accumulates the parameter gradients column-wise, avoiding the
//! intermediates the chain-rule decomposition would allocate.

use fuse_core::{DType, FuseError, Result, Tensor};

use crate::cpu_fused::{finish, for_each_row};

fn check_same(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.dims() != b.dims() {
        return Err(FuseError::ShapeMismatch {
            expected: a.dims().to_vec(),
            got: b.dims().to_vec(),
        });
    }
    Ok(())
}

fn row_width(x: &Tensor, op: &str) -> Result<usize> {
    x.dims()
        .last()
        .copied()
        .ok_or_else(|| FuseError::invalid(op, "input must have at least 1 dimension."))
}

/// Column sums of `rows x d` values produced by `f(row, col)`.
fn column_sums(rows: usize, d: usize, f: impl Fn(usize, usize) -> f32) -> Vec<f32> {
    let mut acc = vec![0.0f32; d];
    for r in 0..rows {
        for (c, a) in acc.iter_mut().enumerate() {
            *a += f(r, c);
        }
    }
    acc
}

/// Fused RMSNorm backward.
///
/// Given forward `y = weight * x * n` with `n = rsqrt(mean(x^2) + eps)`:
///
/// ```text
/// gw = g * weight
/// dx = gw * n - mean(gw * x) * x * n^3
/// dw = sum_rows(g * x * n)
/// ```
///
/// Returns `(dx, dw)` in the dtypes of `x` and `weight`.
pub fn fused_rms_norm_backward(
    x: &Tensor,
    weight: &Tensor,
    grad_output: &Tensor,
    eps: f32,
) -> Result<(Tensor, Tensor)> {
    let d = row_width(x, "rms_norm_vjp")?;
    check_same(x, grad_output)?;
    if weight.dims() != [d] {
        return Err(FuseError::ShapeMismatch {
            expected: vec![d],
            got: weight.dims().to_vec(),
        });
    }

    let xs = x.to_vec_f32();
    let gs = grad_output.to_vec_f32();
    let ws = weight.to_vec_f32();
    let rows = if d == 0 { 0 } else { xs.len() / d };

    let inv_rms: Vec<f32> = (0..rows)
        .map(|r| {
            let sum_sq: f32 = xs[r * d..(r + 1) * d].iter().map(|&v| v * v).sum();
            1.0 / (sum_sq / d as f32 + eps).sqrt()
        })
        .collect();

    let mut dx = vec![0.0f32; xs.len()];
    for_each_row(&mut dx, d, |r, row| {
        let xr = &xs[r * d..(r + 1) * d];
        let gr = &gs[r * d..(r + 1) * d];
        let n = inv_rms[r];
        let mean_gwx: f32 = (0..d).map(|i| gr[i] * ws[i] * xr[i]).sum::<f32>() / d as f32;
        let n3 = n * n * n;
        for i in 0..d {
            row[i] = gr[i] * ws[i] * n - mean_gwx * xr[i] * n3;
        }
    });

    let dw = column_sums(rows, d, |r, c| gs[r * d + c] * xs[r * d + c] * inv_rms[r]);

    Ok((
        finish(dx, x.dims(), x.dtype())?,
        finish(dw, &[d], weight.dtype())?,
    ))
}

/// Fused LayerNorm backward.
///
/// With `x_c = x - mu`, `n = rsqrt(var + eps)` and `wg = weight * g`
/// (`wg = g` without a weight):
///
/// ```text
/// dx = (wg - mean(wg)) * n - x_c * mean(wg * x_c) * n^3
/// dw = sum_rows(g * x_c * n)
/// db = sum_rows(g)
/// ```
///
/// Returns `(dx, dw, db)`; `dw` is `None` without a weight. `db` has the
/// dtype of `dtype_b`.
pub fn fused_layer_norm_backward(
    x: &Tensor,
    weight: Option<&Tensor>,
    grad_output: &Tensor,
    eps: f32,
    dtype_b: DType,
) -> Result<(Tensor, Option<Tensor>, Tensor)> {
    let d = row_width(x, "layer_norm_vjp")?;
    check_same(x, grad_output)?;
    let ws = match weight {
        Some(w) if w.dims() != [d] => {
            return Err(FuseError::ShapeMismatch {
                expected: vec![d],
                got: w.dims().to_vec(),
            });
        }
        Some(w) => Some(w.to_vec_f32()),
        None => None,
    };

    let xs = x.to_vec_f32();
    let gs = grad_output.to_vec_f32();
    let rows = if d == 0 { 0 } else { xs.len() / d };
    let norm = 1.0 / d as f32;

    // (mu, n) per row
    let stats: Vec<(f32, f32)> = (0..rows)
        .map(|r| {
            let xr = &xs[r * d..(r + 1) * d];
            let mu = xr.iter().sum::<f32>() * norm;
            let mu2 = xr.iter().map(|&v| v * v).sum::<f32>() * norm;
            (mu, 1.0 / (mu2 - mu * mu + eps).sqrt())
        })
        .collect();
    let wg = |r: usize, i: usize| match &ws {
        Some(ws) => ws[i] * gs[r * d + i],
        None => gs[r * d + i],
    };

    let mut dx = vec![0.0f32; xs.len()];
    for_each_row(&mut dx, d, |r, row| {
        let (mu, n) = stats[r];
        let xr = &xs[r * d..(r + 1) * d];
        let mut sum_wg = 0.0f32;
        let mut sum_wg_xc = 0.0f32;
        for i in 0..d {
            let w = wg(r, i);
            sum_wg += w;
            sum_wg_xc += w * (xr[i] - mu);
        }
        let (mean_wg, mean_wg_xc) = (sum_wg * norm, sum_wg_xc * norm);
        let n3 = n * n * n;
        for i in 0..d {
            let xc = xr[i] - mu;
            row[i] = (wg(r, i) - mean_wg) * n - xc * mean_wg_xc * n3;
        }
    });

    let dw = match weight {
        Some(w) => {
            let sums = column_sums(rows, d, |r, c| {
                let (mu, n) = stats[r];
                gs[r * d + c] * (xs[r * d + c] - mu) * n
            });
            Some(finish(sums, &[d], w.dtype())?)
        }
        None => None,
    };
    let db = column_sums(rows, d, |r, c| gs[r * d + c]);

    Ok((finish(dx, x.dims(), x.dtype())?, dw, finish(db, &[d], dtype_b)?))
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

    /// Finite differences of `sum(g * f(x))` in f64.
    fn numeric(f: impl Fn(&[f64]) -> Vec<f64>, x: &[f64], g: &[f64]) -> Vec<f32> {
        let h = 1e-6;
        (0..x.len())
            .map(|i| {
                let mut p = x.to_vec();
                let mut m = x.to_vec();
                p[i] += h;
                m[i] -= h;
                let fp: f64 = f(&p).iter().zip(g).map(|(a, b)| a * b).sum();
                let fm: f64 = f(&m).iter().zip(g).map(|(a, b)| a * b).sum();
                ((fp - fm) / (2.0 * h)) as f32
            })
            .collect()
    }

    #[test]
    fn test_rms_norm_backward_matches_numeric() {
        let x = [0.5, -1.0, 2.0, 0.25, 1.5, -0.75];
        let w = [1.0, 0.5, -2.0];
        let g = [0.3, -0.2, 1.0, 0.7, 0.1, -0.4];
        let eps = 1e-5;
        let f = |xv: &[f64]| -> Vec<f64> {
            xv.chunks(3)
                .flat_map(|r| {
                    let n = 1.0 / (r.iter().map(|v| v * v).sum::<f64>() / 3.0 + eps).sqrt();
                    r.iter().zip(&w).map(move |(v, wv)| wv * v * n).collect::<Vec<_>>()
                })
                .collect()
        };
        let (dx, dw) = fused_rms_norm_backward(
            &Tensor::from_f64(&x, &[2, 3]).astype(DType::F32).unwrap(),
            &Tensor::from_f64(&w, &[3]).astype(DType::F32).unwrap(),
            &Tensor::from_f64(&g, &[2, 3]).astype(DType::F32).unwrap(),
            eps as f32,
        )
        .unwrap();
        assert_close(&dx.to_vec_f32(), &numeric(f, &x, &g), 1e-3);
        assert_eq!(dw.dims(), &[3]);
    }

    #[test]
    fn test_layer_norm_backward_without_params() {
        let x = [1.0, 2.0, 4.0, -1.0, 0.0, 3.0];
        let g = [0.5, -1.0, 0.25, 1.0, 1.0, -0.5];
        let eps = 1e-5;
        let f = |xv: &[f64]| -> Vec<f64> {
            xv.chunks(3)
                .flat_map(|r| {
                    let mu = r.iter().sum::<f64>() / 3.0;
                    let var = r.iter().map(|v| (v - mu) * (v - mu)).sum::<f64>() / 3.0;
                    let n = 1.0 / (var + eps).sqrt();
                    r.iter().map(move |v| (v - mu) * n).collect::<Vec<_>>()
                })
                .collect()
        };
        let (dx, dw, db) = fused_layer_norm_backward(
            &Tensor::from_f64(&x, &[2, 3]).astype(DType::F32).unwrap(),
            None,
            &Tensor::from_f64(&g, &[2, 3]).astype(DType::F32).unwrap(),
            eps as f32,
            DType::F32,
        )
        .unwrap();
        assert!(dw.is_none());
        assert_close(&dx.to_vec_f32(), &numeric(f, &x, &g), 1e-3);
        assert_close(&db.to_vec_f32(), &[1.5, 0.0, -0.25], 1e-6);
    }
}
