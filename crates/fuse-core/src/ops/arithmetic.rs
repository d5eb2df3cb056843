//! Element-wise arithmetic, scalar ops, casts and batched matmul.

use rayon::prelude::*;

use crate::autograd::backward_fns::{
    AddBackward, AsTypeBackward, CosBackward, DivBackward, ExpBackward, IdentityBackward,
    LogBackward, MatmulBackward, MulBackward, NegBackward, PowScalarBackward, RsqrtBackward,
    ScaleBackward, SinBackward, SqrtBackward, SquareBackward, SubBackward,
};
use crate::autograd::record;
use crate::dtype::DType;
use crate::error::FuseError;
use crate::ops::{broadcast_shapes, broadcast_values, map_values, zip_values};
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    // =========================================================================
    // Binary
    // =========================================================================

    /// Element-wise addition: self + other.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, None, |a, b| a + b)?;
        let (ls, rs, os) = (self.shape().clone(), other.shape().clone(), out.shape().clone());
        Ok(record(out, &[self, other], || {
            Box::new(AddBackward { lhs_shape: ls, rhs_shape: rs, out_shape: os })
        }))
    }

    /// Element-wise subtraction: self - other.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, None, |a, b| a - b)?;
        let (ls, rs, os) = (self.shape().clone(), other.shape().clone(), out.shape().clone());
        Ok(record(out, &[self, other], || {
            Box::new(SubBackward { lhs_shape: ls, rhs_shape: rs, out_shape: os })
        }))
    }

    /// Element-wise multiplication: self * other.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, None, |a, b| a * b)?;
        Ok(record(out, &[self, other], || {
            Box::new(MulBackward { lhs: self.detach(), rhs: other.detach() })
        }))
    }

    /// Element-wise division: self / other. Integer operands truncate.
    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, None, |a, b| a / b)?;
        Ok(record(out, &[self, other], || {
            Box::new(DivBackward { lhs: self.detach(), rhs: other.detach() })
        }))
    }

    /// Element-wise maximum (not differentiable).
    pub fn maximum(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, None, |a, b| if a.is_nan() || a >= b { a } else { b })
    }

    /// Element-wise minimum (not differentiable).
    pub fn minimum(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, None, |a, b| if a.is_nan() || a <= b { a } else { b })
    }

    // =========================================================================
    // Scalar
    // =========================================================================

    /// Scalar addition: self + scalar, keeping the dtype of `self`.
    pub fn add_scalar(&self, scalar: f64) -> Result<Tensor> {
        let out = unary_op(self, self.dtype(), move |a| a + scalar);
        Ok(record(out, &[self], || Box::new(IdentityBackward)))
    }

    /// Scalar multiplication: self * scalar, keeping the dtype of `self`.
    pub fn mul_scalar(&self, scalar: f64) -> Result<Tensor> {
        let out = unary_op(self, self.dtype(), move |a| a * scalar);
        Ok(record(out, &[self], || Box::new(ScaleBackward { scalar })))
    }

    /// Element-wise power: self^exponent.
    pub fn pow_scalar(&self, exponent: f64) -> Result<Tensor> {
        let out = unary_op(self, self.dtype().to_float(), move |a| a.powf(exponent));
        Ok(record(out, &[self], || {
            Box::new(PowScalarBackward { input: self.detach(), exponent })
        }))
    }

    /// Clamp into `[min, max]` (not differentiable).
    pub fn clip(&self, min: f64, max: f64) -> Result<Tensor> {
        if min > max {
            return Err(FuseError::invalid("clip", format!("min {min} exceeds max {max}.")));
        }
        Ok(unary_op(self, self.dtype(), move |a| a.clamp(min, max)))
    }

    // =========================================================================
    // Unary
    // =========================================================================

    /// Element-wise negation: -self.
    pub fn neg(&self) -> Result<Tensor> {
        let out = unary_op(self, self.dtype(), |a| -a);
        Ok(record(out, &[self], || Box::new(NegBackward)))
    }

    /// Element-wise absolute value (not differentiable).
    pub fn abs(&self) -> Result<Tensor> {
        Ok(unary_op(self, self.dtype(), f64::abs))
    }

    /// Element-wise square root.
    pub fn sqrt(&self) -> Result<Tensor> {
        let out = unary_op(self, self.dtype().to_float(), f64::sqrt);
        let saved = out.clone();
        Ok(record(out, &[self], || Box::new(SqrtBackward { output: saved })))
    }

    /// Element-wise reciprocal square root.
    pub fn rsqrt(&self) -> Result<Tensor> {
        let out = unary_op(self, self.dtype().to_float(), |a| 1.0 / a.sqrt());
        let saved = out.clone();
        Ok(record(out, &[self], || Box::new(RsqrtBackward { output: saved })))
    }

    /// Element-wise reciprocal: 1/self.
    pub fn reciprocal(&self) -> Result<Tensor> {
        self.pow_scalar(-1.0)
    }

    /// Element-wise exponential: e^self.
    pub fn exp(&self) -> Result<Tensor> {
        let out = unary_op(self, self.dtype().to_float(), f64::exp);
        let saved = out.clone();
        Ok(record(out, &[self], || Box::new(ExpBackward { output: saved })))
    }

    /// Element-wise natural logarithm.
    pub fn log(&self) -> Result<Tensor> {
        let out = unary_op(self, self.dtype().to_float(), f64::ln);
        Ok(record(out, &[self], || Box::new(LogBackward { input: self.detach() })))
    }

    pub fn sin(&self) -> Result<Tensor> {
        let out = unary_op(self, self.dtype().to_float(), f64::sin);
        Ok(record(out, &[self], || Box::new(SinBackward { input: self.detach() })))
    }

    pub fn cos(&self) -> Result<Tensor> {
        let out = unary_op(self, self.dtype().to_float(), f64::cos);
        Ok(record(out, &[self], || Box::new(CosBackward { input: self.detach() })))
    }

    /// Element-wise square: self * self.
    pub fn square(&self) -> Result<Tensor> {
        let out = unary_op(self, self.dtype(), |a| a * a);
        Ok(record(out, &[self], || Box::new(SquareBackward { input: self.detach() })))
    }

    /// Round half to even (not differentiable).
    pub fn round(&self) -> Result<Tensor> {
        Ok(unary_op(self, self.dtype(), f64::round_ties_even))
    }

    /// Convert to `dtype`. A no-op (sharing the tape node) when already `dtype`.
    pub fn astype(&self, dtype: DType) -> Result<Tensor> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let out = unary_op(self, dtype, |a| a);
        if !(dtype.is_float() && self.dtype().is_float()) {
            return Ok(out);
        }
        let input_dtype = self.dtype();
        Ok(record(out, &[self], || {
            Box::new(AsTypeBackward { input_dtype, output_dtype: dtype })
        }))
    }

    // =========================================================================
    // Matmul
    // =========================================================================

    /// Matrix multiplication over the last two axes.
    ///
    /// Leading (batch) axes broadcast against each other by index mapping, so
    /// a `[B, H, 1, L, D] @ [B, H, R, D, S]` product never tiles the size-1 axis.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        if self.ndim() < 2 || other.ndim() < 2 {
            return Err(FuseError::invalid(
                "matmul",
                format!(
                    "inputs must have at least 2 dimensions, got {} and {}.",
                    self.ndim(),
                    other.ndim()
                ),
            ));
        }
        let (ad, bd) = (self.dims(), other.dims());
        let (m, k) = (ad[ad.len() - 2], ad[ad.len() - 1]);
        let (k2, n) = (bd[bd.len() - 2], bd[bd.len() - 1]);
        if k != k2 {
            return Err(FuseError::MatmulDimMismatch { m, k1: k, k2, n });
        }

        let a_batch = Shape::new(&ad[..ad.len() - 2]);
        let b_batch = Shape::new(&bd[..bd.len() - 2]);
        let batch = broadcast_shapes(&a_batch, &b_batch)?;
        let out_dtype = self.dtype().promote(other.dtype());

        let mut out_dims = batch.dims().to_vec();
        out_dims.extend_from_slice(&[m, n]);
        let out_shape = Shape::new(&out_dims);
        let nb = batch.numel();

        let mut out = vec![0.0f64; nb * m * n];
        if !out.is_empty() {
            let a_strides = a_batch.broadcast_strides(&batch);
            let b_strides = b_batch.broadcast_strides(&batch);
            let batch_strides = batch.contiguous_strides();
            let offsets: Vec<(usize, usize)> = (0..nb)
                .map(|bi| {
                    let mut rem = bi;
                    let (mut ao, mut bo) = (0usize, 0usize);
                    for d in 0..batch.ndim() {
                        let c = rem / batch_strides[d];
                        rem %= batch_strides[d];
                        ao += c * a_strides[d];
                        bo += c * b_strides[d];
                    }
                    (ao * m * k, bo * k * n)
                })
                .collect();

            let av = self.to_vec_f64();
            let bv = other.to_vec_f64();
            out.par_chunks_mut(n).enumerate().for_each(|(row, out_row)| {
                let (ao, bo) = offsets[row / m];
                let a_row = &av[ao + (row % m) * k..ao + (row % m) * k + k];
                for (p, &x) in a_row.iter().enumerate() {
                    let b_row = &bv[bo + p * n..bo + p * n + n];
                    for (o, &y) in out_row.iter_mut().zip(b_row) {
                        *o += x * y;
                    }
                }
            });
        }

        let result = Tensor::from_computed(&out, out_shape, out_dtype);
        Ok(record(result, &[self, other], || {
            Box::new(MatmulBackward { lhs: self.detach(), rhs: other.detach() })
        }))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Broadcasting binary op; the result dtype defaults to the promoted dtype.
pub(crate) fn binary_op<F>(a: &Tensor, b: &Tensor, out_dtype: Option<DType>, f: F) -> Result<Tensor>
where
    F: Fn(f64, f64) -> f64 + Sync + Send,
{
    let shape = broadcast_shapes(a.shape(), b.shape())?;
    let av = broadcast_values(a, &shape);
    let bv = broadcast_values(b, &shape);
    let values = zip_values(&av, &bv, f);
    let dtype = out_dtype.unwrap_or_else(|| a.dtype().promote(b.dtype()));
    Ok(Tensor::from_computed(&values, shape, dtype))
}

pub(crate) fn unary_op<F>(a: &Tensor, out_dtype: DType, f: F) -> Tensor
where
    F: Fn(f64) -> f64 + Sync + Send,
{
    let values = map_values(&a.to_vec_f64(), f);
    Tensor::from_computed(&values, a.shape().clone(), out_dtype)
}
