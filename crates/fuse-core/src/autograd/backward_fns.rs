//! Built-in differentiation rules for the host ops.
//!
//! Saved tensors are detached copies; rules run with recording disabled.

use crate::autograd::GradFn;
use crate::dtype::DType;
use crate::ops::manipulation::{slice_scatter, split_sizes};
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

/// Sum a broadcast gradient back down to an operand's shape.
fn unbroadcast(grad: Tensor, shape: &Shape) -> Result<Tensor> {
    grad.sum_to_shape(shape.dims())
}

/// Combine two optional tangents with `both`, or lift a lone one with `only_lhs`/`only_rhs`.
fn combine<A, L, R>(ts: &[Option<Tensor>], both: A, only_lhs: L, only_rhs: R) -> Result<Option<Tensor>>
where
    A: FnOnce(&Tensor, &Tensor) -> Result<Tensor>,
    L: FnOnce(&Tensor) -> Result<Tensor>,
    R: FnOnce(&Tensor) -> Result<Tensor>,
{
    match (ts.first().and_then(Option::as_ref), ts.get(1).and_then(Option::as_ref)) {
        (Some(a), Some(b)) => both(a, b).map(Some),
        (Some(a), None) => only_lhs(a).map(Some),
        (None, Some(b)) => only_rhs(b).map(Some),
        (None, None) => Ok(None),
    }
}

fn first(ts: &[Option<Tensor>]) -> Option<&Tensor> {
    ts.first().and_then(Option::as_ref)
}

// ============================================================================
// Arithmetic
// ============================================================================

/// Backward for element-wise addition: grad flows through unchanged.
pub struct AddBackward {
    pub lhs_shape: Shape,
    pub rhs_shape: Shape,
    pub out_shape: Shape,
}

impl GradFn for AddBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![
            Some(unbroadcast(g.clone(), &self.lhs_shape)?),
            Some(unbroadcast(g.clone(), &self.rhs_shape)?),
        ])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        let out = self.out_shape.dims();
        combine(ts, |a, b| a.add(b), |a| a.broadcast_to(out), |b| b.broadcast_to(out))
    }
    fn name(&self) -> &str {
        "AddBackward"
    }
}

/// Backward for element-wise subtraction.
pub struct SubBackward {
    pub lhs_shape: Shape,
    pub rhs_shape: Shape,
    pub out_shape: Shape,
}

impl GradFn for SubBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![
            Some(unbroadcast(g.clone(), &self.lhs_shape)?),
            Some(unbroadcast(g.neg()?, &self.rhs_shape)?),
        ])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        let out = self.out_shape.dims();
        combine(
            ts,
            |a, b| a.sub(b),
            |a| a.broadcast_to(out),
            |b| b.neg()?.broadcast_to(out),
        )
    }
    fn name(&self) -> &str {
        "SubBackward"
    }
}

/// Backward for element-wise multiplication.
pub struct MulBackward {
    pub lhs: Tensor,
    pub rhs: Tensor,
}

impl GradFn for MulBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![
            Some(unbroadcast(g.mul(&self.rhs)?, self.lhs.shape())?),
            Some(unbroadcast(g.mul(&self.lhs)?, self.rhs.shape())?),
        ])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        combine(
            ts,
            |a, b| a.mul(&self.rhs)?.add(&self.lhs.mul(b)?),
            |a| a.mul(&self.rhs),
            |b| self.lhs.mul(b),
        )
    }
    fn name(&self) -> &str {
        "MulBackward"
    }
}

/// Backward for element-wise division.
pub struct DivBackward {
    pub lhs: Tensor,
    pub rhs: Tensor,
}

impl DivBackward {
    /// d(a/b)/db = -a / b^2
    fn rhs_partial(&self) -> Result<Tensor> {
        self.lhs.neg()?.div(&self.rhs.square()?)
    }
}

impl GradFn for DivBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![
            Some(unbroadcast(g.div(&self.rhs)?, self.lhs.shape())?),
            Some(unbroadcast(g.mul(&self.rhs_partial()?)?, self.rhs.shape())?),
        ])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        combine(
            ts,
            |a, b| a.div(&self.rhs)?.add(&b.mul(&self.rhs_partial()?)?),
            |a| a.div(&self.rhs),
            |b| b.mul(&self.rhs_partial()?),
        )
    }
    fn name(&self) -> &str {
        "DivBackward"
    }
}

/// Backward for ops whose derivative is the identity (scalar add).
pub struct IdentityBackward;

impl GradFn for IdentityBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(g.clone())])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        Ok(first(ts).cloned())
    }
    fn name(&self) -> &str {
        "IdentityBackward"
    }
}

/// Backward for scalar multiplication.
pub struct ScaleBackward {
    pub scalar: f64,
}

impl GradFn for ScaleBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(g.mul_scalar(self.scalar)?)])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        first(ts).map(|t| t.mul_scalar(self.scalar)).transpose()
    }
    fn name(&self) -> &str {
        "ScaleBackward"
    }
}

/// Backward for negation.
pub struct NegBackward;

impl GradFn for NegBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(g.neg()?)])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        first(ts).map(Tensor::neg).transpose()
    }
    fn name(&self) -> &str {
        "NegBackward"
    }
}

/// Rules of the form `dy = t * factor` for a saved per-element factor.
macro_rules! elementwise_rule {
    ($name:ident, $label:expr, $field:ident, |$saved:ident| $factor:expr) => {
        pub struct $name {
            pub $field: Tensor,
        }

        impl $name {
            fn factor(&self) -> Result<Tensor> {
                let $saved = &self.$field;
                $factor
            }
        }

        impl GradFn for $name {
            fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
                Ok(vec![Some(g.mul(&self.factor()?)?)])
            }
            fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
                match first(ts) {
                    Some(t) => Ok(Some(t.mul(&self.factor()?)?)),
                    None => Ok(None),
                }
            }
            fn name(&self) -> &str {
                $label
            }
        }
    };
}

// d sqrt(x) = 1 / (2 sqrt(x))
elementwise_rule!(SqrtBackward, "SqrtBackward", output, |y| y.mul_scalar(2.0)?.reciprocal());
// d x^(-1/2) = -1/2 x^(-3/2) = -y^3 / 2
elementwise_rule!(RsqrtBackward, "RsqrtBackward", output, |y| y.pow_scalar(3.0)?.mul_scalar(-0.5));
elementwise_rule!(ExpBackward, "ExpBackward", output, |y| Ok(y.clone()));
elementwise_rule!(LogBackward, "LogBackward", input, |x| x.reciprocal());
elementwise_rule!(SinBackward, "SinBackward", input, |x| x.cos());
elementwise_rule!(CosBackward, "CosBackward", input, |x| x.sin()?.neg());
elementwise_rule!(SquareBackward, "SquareBackward", input, |x| x.mul_scalar(2.0));

/// Backward for `x^n` with a scalar exponent.
pub struct PowScalarBackward {
    pub input: Tensor,
    pub exponent: f64,
}

impl PowScalarBackward {
    fn factor(&self) -> Result<Tensor> {
        self.input.pow_scalar(self.exponent - 1.0)?.mul_scalar(self.exponent)
    }
}

impl GradFn for PowScalarBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(g.mul(&self.factor()?)?)])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        first(ts).map(|t| t.mul(&self.factor()?)).transpose()
    }
    fn name(&self) -> &str {
        "PowScalarBackward"
    }
}

/// Backward for dtype casts between float types.
pub struct AsTypeBackward {
    pub input_dtype: DType,
    pub output_dtype: DType,
}

impl GradFn for AsTypeBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(g.astype(self.input_dtype)?)])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        first(ts).map(|t| t.astype(self.output_dtype)).transpose()
    }
    fn name(&self) -> &str {
        "AsTypeBackward"
    }
}

/// Backward for matrix multiplication.
/// C = A @ B → dA = dC @ B^T, dB = A^T @ dC
pub struct MatmulBackward {
    pub lhs: Tensor,
    pub rhs: Tensor,
}

impl GradFn for MatmulBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let grad_a = g.matmul(&self.rhs.transpose()?)?;
        let grad_b = self.lhs.transpose()?.matmul(g)?;
        Ok(vec![
            Some(unbroadcast(grad_a, self.lhs.shape())?),
            Some(unbroadcast(grad_b, self.rhs.shape())?),
        ])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        combine(
            ts,
            |a, b| a.matmul(&self.rhs)?.add(&self.lhs.matmul(b)?),
            |a| a.matmul(&self.rhs),
            |b| self.lhs.matmul(b),
        )
    }
    fn name(&self) -> &str {
        "MatmulBackward"
    }
}

/// Backward for `where(cond, x, y)`.
pub struct WhereBackward {
    pub cond: Tensor,
    pub lhs_shape: Shape,
    pub rhs_shape: Shape,
}

impl GradFn for WhereBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let zero = Tensor::scalar(0.0, g.dtype());
        let ga = Tensor::where_cond(&self.cond, g, &zero)?;
        let gb = Tensor::where_cond(&self.cond, &zero, g)?;
        Ok(vec![
            Some(unbroadcast(ga, &self.lhs_shape)?),
            Some(unbroadcast(gb, &self.rhs_shape)?),
        ])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        let zero = |t: &Tensor| Tensor::scalar(0.0, t.dtype());
        combine(
            ts,
            |a, b| Tensor::where_cond(&self.cond, a, b),
            |a| Tensor::where_cond(&self.cond, a, &zero(a)),
            |b| Tensor::where_cond(&self.cond, &zero(b), b),
        )
    }
    fn name(&self) -> &str {
        "WhereBackward"
    }
}

// ============================================================================
// Reductions and shape ops
// ============================================================================

/// Backward for sum over axes: broadcast the gradient back.
pub struct SumBackward {
    pub input_shape: Shape,
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

impl GradFn for SumBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let keep = crate::ops::reduction::keepdims_shape(self.input_shape.dims(), &self.axes);
        let grad = g.reshape_to(&keep)?.broadcast_to(self.input_shape.dims())?;
        Ok(vec![Some(grad)])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        let axes: Vec<isize> = self.axes.iter().map(|&a| a as isize).collect();
        first(ts).map(|t| t.sum_axes(&axes, self.keepdims)).transpose()
    }
    fn name(&self) -> &str {
        "SumBackward"
    }
}

/// Backward for reshape.
pub struct ReshapeBackward {
    pub input_shape: Shape,
    pub output_shape: Shape,
}

impl GradFn for ReshapeBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(g.reshape_to(self.input_shape.dims())?)])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        first(ts).map(|t| t.reshape_to(self.output_shape.dims())).transpose()
    }
    fn name(&self) -> &str {
        "ReshapeBackward"
    }
}

/// Backward for swapaxes (its own inverse).
pub struct SwapAxesBackward {
    pub axis1: usize,
    pub axis2: usize,
}

impl GradFn for SwapAxesBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(g.swapaxes(self.axis1 as isize, self.axis2 as isize)?)])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        first(ts)
            .map(|t| t.swapaxes(self.axis1 as isize, self.axis2 as isize))
            .transpose()
    }
    fn name(&self) -> &str {
        "SwapAxesBackward"
    }
}

/// Backward for broadcast_to.
pub struct BroadcastBackward {
    pub input_shape: Shape,
    pub output_shape: Shape,
}

impl GradFn for BroadcastBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(unbroadcast(g.clone(), &self.input_shape)?)])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        first(ts).map(|t| t.broadcast_to(self.output_shape.dims())).transpose()
    }
    fn name(&self) -> &str {
        "BroadcastBackward"
    }
}

/// Backward for strided slicing: scatter into zeros.
pub struct SliceBackward {
    pub input_shape: Shape,
    pub output_shape: Shape,
    pub start: Vec<usize>,
    pub step: Vec<usize>,
}

impl GradFn for SliceBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(slice_scatter(g, &self.input_shape, &self.start, &self.step))])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        let Some(t) = first(ts) else {
            return Ok(None);
        };
        // smallest exclusive bound that yields the same window
        let stop: Vec<usize> = self
            .output_shape
            .dims()
            .iter()
            .enumerate()
            .map(|(d, &len)| self.start[d] + len.saturating_sub(1) * self.step[d] + usize::from(len > 0))
            .collect();
        Ok(Some(t.slice(&self.start, &stop, &self.step)?))
    }
    fn name(&self) -> &str {
        "SliceBackward"
    }
}

/// Backward for concatenation: split the gradient back into pieces.
pub struct ConcatBackward {
    pub axis: usize,
    pub input_shapes: Vec<Shape>,
}

impl GradFn for ConcatBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let sizes: Vec<usize> = self.input_shapes.iter().map(|s| s.dims()[self.axis]).collect();
        Ok(split_sizes(g, self.axis, &sizes)?.into_iter().map(Some).collect())
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        let Some(dtype) = ts.iter().flatten().map(Tensor::dtype).next() else {
            return Ok(None);
        };
        let pieces: Vec<Tensor> = ts
            .iter()
            .zip(&self.input_shapes)
            .map(|(t, shape)| match t {
                Some(t) => t.clone(),
                None => Tensor::zeros(shape.dims(), dtype),
            })
            .collect();
        let refs: Vec<&Tensor> = pieces.iter().collect();
        Tensor::concatenate(&refs, self.axis as isize).map(Some)
    }
    fn name(&self) -> &str {
        "ConcatBackward"
    }
}

/// Backward for softmax along the last axis.
/// dx = y * (g - sum(g * y))
pub struct SoftmaxBackward {
    pub output: Tensor,
}

impl SoftmaxBackward {
    fn jvp(&self, v: &Tensor) -> Result<Tensor> {
        let y = &self.output;
        let dot = v.mul(y)?.sum_axes(&[-1], true)?;
        y.mul(&v.sub(&dot)?)
    }
}

impl GradFn for SoftmaxBackward {
    fn apply(&self, g: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(self.jvp(g)?)])
    }
    fn tangent(&self, ts: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        first(ts).map(|t| self.jvp(t)).transpose()
    }
    fn name(&self) -> &str {
        "SoftmaxBackward"
    }
}
