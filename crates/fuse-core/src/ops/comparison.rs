//! Element-wise comparisons (bool results) and selection.

use crate::autograd::backward_fns::WhereBackward;
use crate::autograd::record;
use crate::dtype::DType;
use crate::ops::arithmetic::binary_op;
use crate::ops::{broadcast_shapes, broadcast_values};
use crate::tensor::Tensor;
use crate::Result;

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl Tensor {
    /// Element-wise `self > other`.
    pub fn greater(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, Some(DType::Bool), |a, b| flag(a > b))
    }

    /// Element-wise `self < other`.
    pub fn less(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, Some(DType::Bool), |a, b| flag(a < b))
    }

    /// Element-wise `self >= other`.
    pub fn greater_equal(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, Some(DType::Bool), |a, b| flag(a >= b))
    }

    /// Element-wise `self == other`.
    pub fn equal(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, Some(DType::Bool), |a, b| flag(a == b))
    }

    /// Element-wise `self != other`.
    pub fn not_equal(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, Some(DType::Bool), |a, b| flag(a != b))
    }

    /// Select from `x` where `cond` is non-zero, else from `y`. All three
    /// broadcast together; the result has the promoted dtype of `x` and `y`.
    pub fn where_cond(cond: &Tensor, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let shape = broadcast_shapes(&broadcast_shapes(cond.shape(), x.shape())?, y.shape())?;
        let c = broadcast_values(cond, &shape);
        let xv = broadcast_values(x, &shape);
        let yv = broadcast_values(y, &shape);
        let values: Vec<f64> = c
            .iter()
            .zip(xv.iter().zip(yv.iter()))
            .map(|(&c, (&a, &b))| if c != 0.0 { a } else { b })
            .collect();
        let out = Tensor::from_computed(&values, shape, x.dtype().promote(y.dtype()));
        Ok(record(out, &[x, y], || {
            Box::new(WhereBackward {
                cond: cond.detach(),
                lhs_shape: x.shape().clone(),
                rhs_shape: y.shape().clone(),
            })
        }))
    }
}
