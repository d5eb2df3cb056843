//! Reductions over axis lists.

use rayon::prelude::*;

use crate::autograd::backward_fns::SumBackward;
use crate::autograd::record;
use crate::dtype::DType;
use crate::error::FuseError;
use crate::ops::PAR_THRESHOLD;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

/// Normalize, sort and dedupe a list of axes.
pub(crate) fn normalize_axes(axes: &[isize], ndim: usize) -> Result<Vec<usize>> {
    let mut out = axes
        .iter()
        .map(|&a| crate::shape::normalize_axis(a, ndim))
        .collect::<Result<Vec<_>>>()?;
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// Shape after reducing `axes`, with size-1 placeholders kept.
pub(crate) fn keepdims_shape(dims: &[usize], axes: &[usize]) -> Vec<usize> {
    dims.iter()
        .enumerate()
        .map(|(i, &d)| if axes.contains(&i) { 1 } else { d })
        .collect()
}

fn reduced_shape(dims: &[usize], axes: &[usize], keepdims: bool) -> Shape {
    if keepdims {
        Shape::new(&keepdims_shape(dims, axes))
    } else {
        let kept: Vec<usize> = dims
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, &d)| d)
            .collect();
        Shape::new(&kept)
    }
}

/// Fold `values` (row-major, shape `dims`) over `axes` into the keepdims layout.
fn fold_axes<F>(values: &[f64], dims: &[usize], axes: &[usize], init: f64, f: F) -> Vec<f64>
where
    F: Fn(f64, f64) -> f64 + Sync + Send,
{
    let ndim = dims.len();
    let keep = Shape::new(&keepdims_shape(dims, axes));

    // Fast path: reduce only the innermost axis, one row per task.
    if axes == [ndim - 1] && dims[ndim - 1] > 0 {
        let row = dims[ndim - 1];
        return if values.len() >= PAR_THRESHOLD {
            values
                .par_chunks(row)
                .map(|r| r.iter().fold(init, |acc, &v| f(acc, v)))
                .collect()
        } else {
            values
                .chunks(row)
                .map(|r| r.iter().fold(init, |acc, &v| f(acc, v)))
                .collect()
        };
    }

    let in_strides = Shape::new(dims).contiguous_strides();
    let keep_strides = keep.contiguous_strides();
    let mut acc = vec![init; keep.numel()];
    for (flat, &v) in values.iter().enumerate() {
        let mut rem = flat;
        let mut o = 0;
        for d in 0..ndim {
            let c = rem / in_strides[d];
            rem %= in_strides[d];
            if !axes.contains(&d) {
                o += c * keep_strides[d];
            }
        }
        acc[o] = f(acc[o], v);
    }
    acc
}

impl Tensor {
    /// Sum over `axes`. Bool inputs sum as int32.
    pub fn sum_axes(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        let axes = normalize_axes(axes, self.ndim())?;
        let dtype = if self.dtype() == DType::Bool { DType::I32 } else { self.dtype() };
        if axes.is_empty() {
            return self.astype(dtype);
        }
        let values = fold_axes(&self.to_vec_f64(), self.dims(), &axes, 0.0, |a, b| a + b);
        let out = Tensor::from_computed(&values, reduced_shape(self.dims(), &axes, keepdims), dtype);
        let input_shape = self.shape().clone();
        Ok(record(out, &[self], || {
            Box::new(SumBackward { input_shape, axes, keepdims })
        }))
    }

    /// Mean over `axes`. Integer inputs produce float32.
    pub fn mean_axes(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        let norm = normalize_axes(axes, self.ndim())?;
        let count: usize = norm.iter().map(|&a| self.dims()[a]).product();
        let base = self.astype(self.dtype().to_float())?;
        base.sum_axes(axes, keepdims)?.mul_scalar(1.0 / count as f64)
    }

    /// Maximum over `axes` (not differentiable).
    pub fn max_axes(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        self.extremum(axes, keepdims, f64::NEG_INFINITY, f64::max)
    }

    /// Minimum over `axes` (not differentiable).
    pub fn min_axes(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        self.extremum(axes, keepdims, f64::INFINITY, f64::min)
    }

    fn extremum(
        &self,
        axes: &[isize],
        keepdims: bool,
        init: f64,
        f: fn(f64, f64) -> f64,
    ) -> Result<Tensor> {
        let axes = normalize_axes(axes, self.ndim())?;
        if axes.iter().any(|&a| self.dims()[a] == 0) {
            return Err(FuseError::invalid("reduce", "cannot take the extremum of an empty axis."));
        }
        let values = if axes.is_empty() {
            self.to_vec_f64()
        } else {
            fold_axes(&self.to_vec_f64(), self.dims(), &axes, init, f)
        };
        Ok(Tensor::from_computed(
            &values,
            reduced_shape(self.dims(), &axes, keepdims),
            self.dtype(),
        ))
    }

    /// Sum of all elements (0-D result).
    pub fn sum(&self) -> Result<Tensor> {
        let all: Vec<isize> = (0..self.ndim() as isize).collect();
        self.sum_axes(&all, false)
    }

    /// Mean of all elements (0-D result).
    pub fn mean(&self) -> Result<Tensor> {
        let all: Vec<isize> = (0..self.ndim() as isize).collect();
        self.mean_axes(&all, false)
    }

    /// Sum a broadcast result back down to `target` (the inverse of broadcasting).
    pub fn sum_to_shape(&self, target: &[usize]) -> Result<Tensor> {
        if self.dims() == target {
            return Ok(self.clone());
        }
        let broadcast_err = || FuseError::BroadcastError {
            a: self.dims().to_vec(),
            b: target.to_vec(),
        };
        if target.len() > self.ndim() {
            return Err(broadcast_err());
        }
        let lead = self.ndim() - target.len();
        let mut axes: Vec<isize> = (0..lead as isize).collect();
        for (i, &t) in target.iter().enumerate() {
            let d = self.dims()[lead + i];
            if t == d {
                continue;
            }
            if t != 1 {
                return Err(broadcast_err());
            }
            axes.push((lead + i) as isize);
        }
        let target: Vec<isize> = target.iter().map(|&d| d as isize).collect();
        self.sum_axes(&axes, true)?.reshape(&target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_last_axis() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let s = t.sum_axes(&[-1], false).unwrap();
        assert_eq!(s.dims(), &[2]);
        assert_eq!(s.to_vec_f32(), vec![6.0, 15.0]);
        let k = t.sum_axes(&[1], true).unwrap();
        assert_eq!(k.dims(), &[2, 1]);
    }

    #[test]
    fn test_sum_leading_axes() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &[2, 2, 2]);
        let s = t.sum_axes(&[0, 1], false).unwrap();
        assert_eq!(s.dims(), &[2]);
        assert_eq!(s.to_vec_f32(), vec![16.0, 20.0]);
    }

    #[test]
    fn test_sum_all() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let s = t.sum().unwrap();
        assert!(s.is_scalar());
        assert_eq!(s.item().unwrap(), 10.0);
    }

    #[test]
    fn test_sum_u32_keeps_dtype() {
        let t = Tensor::from_u32(&[1 << 31, 1 << 30, 1, 2], &[2, 2]);
        let s = t.sum_axes(&[-1], false).unwrap();
        assert_eq!(s.dtype(), DType::U32);
        assert_eq!(s.to_vec_u32(), vec![(1 << 31) + (1 << 30), 3]);
    }

    #[test]
    fn test_mean() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let m = t.mean_axes(&[-1], true).unwrap();
        assert_eq!(m.dims(), &[2, 1]);
        assert_eq!(m.to_vec_f32(), vec![2.0, 5.0]);
    }

    #[test]
    fn test_max_min() {
        let t = Tensor::from_f32(&[1.0, -5.0, 3.0, 4.0, 0.0, -6.0], &[2, 3]);
        assert_eq!(t.max_axes(&[-1], false).unwrap().to_vec_f32(), vec![3.0, 4.0]);
        assert_eq!(t.min_axes(&[-1], false).unwrap().to_vec_f32(), vec![-5.0, -6.0]);
        assert_eq!(t.max_axes(&[0], false).unwrap().to_vec_f32(), vec![4.0, 0.0, 3.0]);
    }

    #[test]
    fn test_sum_to_shape() {
        let t = Tensor::ones(&[2, 3, 4], DType::F32);
        let s = t.sum_to_shape(&[3, 1]).unwrap();
        assert_eq!(s.dims(), &[3, 1]);
        assert_eq!(s.to_vec_f32(), vec![8.0; 3]);
        assert!(t.sum_to_shape(&[2, 4]).is_err());
    }

    #[test]
    fn test_invalid_axis() {
        let t = Tensor::zeros(&[2, 3], DType::F32);
        assert!(matches!(t.sum_axes(&[2], false), Err(FuseError::InvalidAxis { .. })));
    }
}
