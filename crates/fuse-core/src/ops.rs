//! Host array operations.
//!
//! Every op decodes its operands to f64, computes with numpy-style
//! broadcasting, and encodes the result in the output dtype. Differentiable
//! ops record a node on the autodiff tape when an operand tracks gradients.

pub mod arithmetic;
pub mod bitwise;
pub mod comparison;
pub mod manipulation;
pub mod reduction;

use rayon::prelude::*;

use crate::error::FuseError;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

/// Element count above which element-wise loops go parallel.
pub(crate) const PAR_THRESHOLD: usize = 1 << 15;

/// Broadcast shape of two operands or a `BroadcastError`.
pub(crate) fn broadcast_shapes(a: &Shape, b: &Shape) -> Result<Shape> {
    a.broadcast_with(b).ok_or_else(|| FuseError::BroadcastError {
        a: a.dims().to_vec(),
        b: b.dims().to_vec(),
    })
}

/// Read `values` through `strides` starting at `base`, producing a dense
/// row-major buffer of shape `dims`.
pub(crate) fn gather_strided(values: &[f64], dims: &[usize], strides: &[usize], base: usize) -> Vec<f64> {
    let n: usize = dims.iter().product();
    let mut out = Vec::with_capacity(n);
    let mut index = vec![0usize; dims.len()];
    let mut offset = base;
    for _ in 0..n {
        out.push(values[offset]);
        for d in (0..dims.len()).rev() {
            index[d] += 1;
            offset += strides[d];
            if index[d] < dims[d] {
                break;
            }
            offset -= strides[d] * dims[d];
            index[d] = 0;
        }
    }
    out
}

/// Inverse of [`gather_strided`]: write dense `src` of shape `dims` into `dst`
/// through `strides` starting at `base`.
pub(crate) fn scatter_strided(dst: &mut [f64], src: &[f64], dims: &[usize], strides: &[usize], base: usize) {
    let mut index = vec![0usize; dims.len()];
    let mut offset = base;
    for &v in src {
        dst[offset] = v;
        for d in (0..dims.len()).rev() {
            index[d] += 1;
            offset += strides[d];
            if index[d] < dims[d] {
                break;
            }
            offset -= strides[d] * dims[d];
            index[d] = 0;
        }
    }
}

/// Values of `t` broadcast to `target` (materialized).
pub(crate) fn broadcast_values(t: &Tensor, target: &Shape) -> Vec<f64> {
    let values = t.to_vec_f64();
    if t.shape() == target {
        return values;
    }
    gather_strided(&values, target.dims(), &t.shape().broadcast_strides(target), 0)
}

/// Element-wise map, parallel above [`PAR_THRESHOLD`].
pub(crate) fn map_values<F>(values: &[f64], f: F) -> Vec<f64>
where
    F: Fn(f64) -> f64 + Sync + Send,
{
    if values.len() >= PAR_THRESHOLD {
        values.par_iter().map(|&v| f(v)).collect()
    } else {
        values.iter().map(|&v| f(v)).collect()
    }
}

/// Element-wise zip, parallel above [`PAR_THRESHOLD`].
pub(crate) fn zip_values<F>(a: &[f64], b: &[f64], f: F) -> Vec<f64>
where
    F: Fn(f64, f64) -> f64 + Sync + Send,
{
    if a.len() >= PAR_THRESHOLD {
        a.par_iter().zip(b.par_iter()).map(|(&x, &y)| f(x, y)).collect()
    } else {
        a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect()
    }
}
