//! Shape manipulation: reshape, axes, broadcast, slicing, joining, softmax.

use crate::autograd::backward_fns::{
    BroadcastBackward, ConcatBackward, ReshapeBackward, SliceBackward, SoftmaxBackward,
    SwapAxesBackward,
};
use crate::autograd::record;
use crate::dtype::DType;
use crate::error::FuseError;
use crate::ops::{gather_strided, scatter_strided};
use crate::shape::{normalize_axis, Shape};
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Reshape without copying. One dimension may be `-1` (inferred).
    pub fn reshape(&self, new_shape: &[isize]) -> Result<Tensor> {
        let shape = self
            .shape()
            .resolve_reshape(new_shape)
            .ok_or_else(|| FuseError::InvalidReshape {
                numel: self.numel(),
                shape: new_shape.to_vec(),
            })?;
        let out = Tensor::from_storage(self.storage().clone(), shape.clone());
        let input_shape = self.shape().clone();
        Ok(record(out, &[self], || {
            Box::new(ReshapeBackward { input_shape, output_shape: shape })
        }))
    }

    /// Reshape to concrete dims.
    pub fn reshape_to(&self, dims: &[usize]) -> Result<Tensor> {
        let target: Vec<isize> = dims.iter().map(|&d| d as isize).collect();
        self.reshape(&target)
    }

    /// Insert a size-1 axis at `axis` (in the output's rank).
    pub fn expand_dims(&self, axis: isize) -> Result<Tensor> {
        let a = normalize_axis(axis, self.ndim() + 1)?;
        let mut dims = self.dims().to_vec();
        dims.insert(a, 1);
        self.reshape_to(&dims)
    }

    /// Remove a size-1 axis.
    pub fn squeeze(&self, axis: isize) -> Result<Tensor> {
        let a = self.shape().normalize_axis(axis)?;
        if self.dims()[a] != 1 {
            return Err(FuseError::invalid(
                "squeeze",
                format!("cannot squeeze axis {axis} of size {}.", self.dims()[a]),
            ));
        }
        let mut dims = self.dims().to_vec();
        dims.remove(a);
        self.reshape_to(&dims)
    }

    /// Swap two axes (materializes the permuted layout).
    pub fn swapaxes(&self, axis1: isize, axis2: isize) -> Result<Tensor> {
        let a = self.shape().normalize_axis(axis1)?;
        let b = self.shape().normalize_axis(axis2)?;
        if a == b {
            return Ok(self.clone());
        }
        let strides = self.shape().contiguous_strides();
        let mut dims = self.dims().to_vec();
        let mut read = strides.to_vec();
        dims.swap(a, b);
        read.swap(a, b);
        let values = gather_strided(&self.to_vec_f64(), &dims, &read, 0);
        let out = Tensor::from_computed(&values, Shape::new(&dims), self.dtype());
        Ok(record(out, &[self], || Box::new(SwapAxesBackward { axis1: a, axis2: b })))
    }

    /// Swap the last two axes.
    pub fn transpose(&self) -> Result<Tensor> {
        if self.ndim() < 2 {
            return Err(FuseError::invalid("transpose", "input must have at least 2 dimensions."));
        }
        self.swapaxes(-2, -1)
    }

    /// Broadcast to `dims` (materialized).
    pub fn broadcast_to(&self, dims: &[usize]) -> Result<Tensor> {
        if self.dims() == dims {
            return Ok(self.clone());
        }
        let target = Shape::new(dims);
        match self.shape().broadcast_with(&target) {
            Some(s) if s == target => {}
            _ => {
                return Err(FuseError::BroadcastError {
                    a: self.dims().to_vec(),
                    b: dims.to_vec(),
                })
            }
        }
        let values = crate::ops::broadcast_values(self, &target);
        let out = Tensor::from_computed(&values, target.clone(), self.dtype());
        let input_shape = self.shape().clone();
        Ok(record(out, &[self], || {
            Box::new(BroadcastBackward { input_shape, output_shape: target })
        }))
    }

    /// Strided slice `[start, stop)` with `step` per axis.
    pub fn slice(&self, start: &[usize], stop: &[usize], step: &[usize]) -> Result<Tensor> {
        let ndim = self.ndim();
        if start.len() != ndim || stop.len() != ndim || step.len() != ndim {
            return Err(FuseError::invalid(
                "slice",
                format!("start, stop and step must each have {ndim} entries."),
            ));
        }
        let mut out_dims = Vec::with_capacity(ndim);
        for d in 0..ndim {
            let size = self.dims()[d];
            if step[d] == 0 || start[d] > stop[d] || stop[d] > size {
                return Err(FuseError::invalid(
                    "slice",
                    format!(
                        "invalid range {}..{} step {} for axis {d} of size {size}.",
                        start[d], stop[d], step[d]
                    ),
                ));
            }
            out_dims.push((stop[d] - start[d]).div_ceil(step[d]));
        }
        let strides = self.shape().contiguous_strides();
        let read: Vec<usize> = (0..ndim).map(|d| strides[d] * step[d]).collect();
        let base: usize = (0..ndim).map(|d| start[d] * strides[d]).sum();
        let values = if out_dims.iter().product::<usize>() == 0 {
            Vec::new()
        } else {
            gather_strided(&self.to_vec_f64(), &out_dims, &read, base)
        };
        let output_shape = Shape::new(&out_dims);
        let out = Tensor::from_computed(&values, output_shape.clone(), self.dtype());
        let input_shape = self.shape().clone();
        Ok(record(out, &[self], || {
            Box::new(SliceBackward {
                input_shape,
                output_shape,
                start: start.to_vec(),
                step: step.to_vec(),
            })
        }))
    }

    /// Slice a single axis, keeping all others whole.
    pub fn slice_axis(&self, axis: isize, start: usize, stop: usize, step: usize) -> Result<Tensor> {
        let a = self.shape().normalize_axis(axis)?;
        let mut starts = vec![0; self.ndim()];
        let mut stops = self.dims().to_vec();
        let mut steps = vec![1; self.ndim()];
        starts[a] = start;
        stops[a] = stop;
        steps[a] = step;
        self.slice(&starts, &stops, &steps)
    }

    /// The `index`-th sub-tensor along `axis` (that axis removed).
    pub fn index_axis(&self, axis: isize, index: usize) -> Result<Tensor> {
        self.slice_axis(axis, index, index + 1, 1)?.squeeze(axis)
    }

    /// Join tensors along an existing axis.
    pub fn concatenate(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| FuseError::invalid("concatenate", "no arrays provided."))?;
        let ndim = first.ndim();
        let a = normalize_axis(axis, ndim)?;
        for t in tensors {
            let same_rank = t.ndim() == ndim;
            let same_other = same_rank
                && (0..ndim).all(|d| d == a || t.dims()[d] == first.dims()[d]);
            if !same_other {
                return Err(FuseError::ShapeMismatch {
                    expected: first.dims().to_vec(),
                    got: t.dims().to_vec(),
                });
            }
        }
        let dtypes: Vec<DType> = tensors.iter().map(|t| t.dtype()).collect();
        let dtype = DType::result_type(&dtypes).unwrap_or(DType::F32);

        let outer: usize = first.dims()[..a].iter().product();
        let inner: usize = first.dims()[a + 1..].iter().product();
        let sizes: Vec<usize> = tensors.iter().map(|t| t.dims()[a]).collect();
        let total: usize = sizes.iter().sum();
        let blocks: Vec<Vec<f64>> = tensors.iter().map(|t| t.to_vec_f64()).collect();

        let mut values = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for (block, &size) in blocks.iter().zip(&sizes) {
                let len = size * inner;
                values.extend_from_slice(&block[o * len..(o + 1) * len]);
            }
        }
        let mut dims = first.dims().to_vec();
        dims[a] = total;
        let out = Tensor::from_computed(&values, Shape::new(&dims), dtype);
        let input_shapes: Vec<Shape> = tensors.iter().map(|t| t.shape().clone()).collect();
        Ok(record(out, tensors, || {
            Box::new(ConcatBackward { axis: a, input_shapes })
        }))
    }

    /// Join tensors along a new axis.
    pub fn stack(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
        let expanded = tensors
            .iter()
            .map(|t| t.expand_dims(axis))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Tensor> = expanded.iter().collect();
        Tensor::concatenate(&refs, axis)
    }

    /// Softmax along `axis`, computed in f64 and stored in the input's float dtype.
    pub fn softmax(&self, axis: isize) -> Result<Tensor> {
        let a = self.shape().normalize_axis(axis)?;
        if a != self.ndim() - 1 {
            return self.swapaxes(a as isize, -1)?.softmax(-1)?.swapaxes(a as isize, -1);
        }
        let row = self.dims()[a];
        let mut values = self.to_vec_f64();
        if row > 0 {
            for r in values.chunks_mut(row) {
                let max = r.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let mut sum = 0.0;
                for v in r.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                for v in r.iter_mut() {
                    *v /= sum;
                }
            }
        }
        let out = Tensor::from_computed(&values, self.shape().clone(), self.dtype().to_float());
        let saved = out.clone();
        Ok(record(out, &[self], || Box::new(SoftmaxBackward { output: saved })))
    }
}

/// Place `src` into a zero tensor of `full` shape at the strided window
/// `start + i * step`. Gradient of [`Tensor::slice`].
pub(crate) fn slice_scatter(src: &Tensor, full: &Shape, start: &[usize], step: &[usize]) -> Tensor {
    let strides = full.contiguous_strides();
    let write: Vec<usize> = (0..full.ndim()).map(|d| strides[d] * step[d]).collect();
    let base: usize = (0..full.ndim()).map(|d| start[d] * strides[d]).sum();
    let mut dst = vec![0.0f64; full.numel()];
    if src.numel() > 0 {
        scatter_strided(&mut dst, &src.to_vec_f64(), src.dims(), &write, base);
    }
    Tensor::from_computed(&dst, full.clone(), src.dtype())
}

/// Split `t` along `axis` into consecutive pieces of the given sizes.
pub(crate) fn split_sizes(t: &Tensor, axis: usize, sizes: &[usize]) -> Result<Vec<Tensor>> {
    let mut offset = 0;
    let mut out = Vec::with_capacity(sizes.len());
    for &s in sizes {
        out.push(t.slice_axis(axis as isize, offset, offset + s, 1)?);
        offset += s;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t23() -> Tensor {
        Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])
    }

    #[test]
    fn test_reshape() {
        let r = t23().reshape(&[3, 2]).unwrap();
        assert_eq!(r.dims(), &[3, 2]);
        assert_eq!(r.to_vec_f32(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(t23().reshape(&[4, 2]).is_err());
    }

    #[test]
    fn test_reshape_infer() {
        let r = t23().reshape(&[-1, 2]).unwrap();
        assert_eq!(r.dims(), &[3, 2]);
    }

    #[test]
    fn test_expand_squeeze() {
        let e = t23().expand_dims(-1).unwrap();
        assert_eq!(e.dims(), &[2, 3, 1]);
        let e = t23().expand_dims(0).unwrap();
        assert_eq!(e.dims(), &[1, 2, 3]);
        assert_eq!(e.squeeze(0).unwrap().dims(), &[2, 3]);
        assert!(t23().squeeze(0).is_err());
    }

    #[test]
    fn test_transpose() {
        let tr = t23().transpose().unwrap();
        assert_eq!(tr.dims(), &[3, 2]);
        assert_eq!(tr.to_vec_f32(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_broadcast_to() {
        let b = Tensor::from_f32(&[1.0, 2.0], &[2, 1]).broadcast_to(&[2, 3]).unwrap();
        assert_eq!(b.to_vec_f32(), vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert!(t23().broadcast_to(&[3, 3]).is_err());
    }

    #[test]
    fn test_strided_slice() {
        let t = Tensor::from_f32(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], &[2, 4]);
        let even = t.slice_axis(-1, 0, 4, 2).unwrap();
        assert_eq!(even.dims(), &[2, 2]);
        assert_eq!(even.to_vec_f32(), vec![0.0, 2.0, 4.0, 6.0]);
        let odd = t.slice_axis(1, 1, 4, 2).unwrap();
        assert_eq!(odd.to_vec_f32(), vec![1.0, 3.0, 5.0, 7.0]);
        assert!(t.slice_axis(1, 0, 5, 1).is_err());
    }

    #[test]
    fn test_slice_scatter_inverts_slice() {
        let full = Shape::new(&[2, 4]);
        let src = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let s = slice_scatter(&src, &full, &[0, 1], &[1, 2]);
        assert_eq!(s.to_vec_f32(), vec![0.0, 1.0, 0.0, 2.0, 0.0, 3.0, 0.0, 4.0]);
    }

    #[test]
    fn test_concatenate_and_stack() {
        let a = Tensor::from_f32(&[1.0, 2.0], &[2, 1]);
        let b = Tensor::from_f32(&[3.0, 4.0, 5.0, 6.0], &[2, 2]);
        let c = Tensor::concatenate(&[&a, &b], -1).unwrap();
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(c.to_vec_f32(), vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);

        let x = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let y = Tensor::from_f32(&[3.0, 4.0], &[2]);
        let s = Tensor::stack(&[&x, &y], 0).unwrap();
        assert_eq!(s.dims(), &[2, 2]);
        let s = Tensor::stack(&[&x, &y], -1).unwrap();
        assert_eq!(s.to_vec_f32(), vec![1.0, 3.0, 2.0, 4.0]);

        assert!(Tensor::concatenate(&[&a, &x], 0).is_err());
    }

    #[test]
    fn test_index_axis() {
        let r = t23().index_axis(0, 1).unwrap();
        assert_eq!(r.dims(), &[3]);
        assert_eq!(r.to_vec_f32(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_softmax() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 1.0, 1.0, 1.0], &[2, 3]);
        let s = t.softmax(-1).unwrap().to_vec_f32();
        assert!((s[0] + s[1] + s[2] - 1.0).abs() < 1e-6);
        assert!(s[2] > s[1] && s[1] > s[0]);
        assert!((s[3] - 1.0 / 3.0).abs() < 1e-6);

        let c = t.softmax(0).unwrap().to_vec_f32();
        assert!((c[0] + c[3] - 1.0).abs() < 1e-6);
    }
}
