//! Rotary position encoding.
//!
//! Positions run along the second-to-last axis; the first `dims` features of
//! each position are rotated in pairs, the rest pass through. Pairs are
//! adjacent `(x[2i], x[2i+1])` in traditional mode and split halves
//! `(x[i], x[i + dims/2])` otherwise.

use fuse_core::{FuseError, Result, Tensor};
use fuse_kernels::{fused_rope, RopeConfig};

use crate::dispatch::{self, Context};
use crate::graph::{make_array, single, Array, OutputSpec};
use crate::primitive::{Op, Primitive};

/// Rotation parameters. `forward == false` applies the inverse rotation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RopeParams {
    pub dims: usize,
    pub traditional: bool,
    pub base: f32,
    pub scale: f32,
    pub offset: i32,
    pub forward: bool,
}

impl RopeParams {
    /// Rotate the first `dims` features with base 10000, unit scale and no
    /// offset.
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            traditional: false,
            base: 10000.0,
            scale: 1.0,
            offset: 0,
            forward: true,
        }
    }

    pub fn traditional(mut self, traditional: bool) -> Self {
        self.traditional = traditional;
        self
    }

    pub fn base(mut self, base: f32) -> Self {
        self.base = base;
        self
    }

    pub fn scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn offset(mut self, offset: i32) -> Self {
        self.offset = offset;
        self
    }

    /// The same rotation run the other way.
    pub fn inverted(mut self) -> Self {
        self.forward = !self.forward;
        self
    }
}

impl From<RopeParams> for RopeConfig {
    fn from(p: RopeParams) -> Self {
        RopeConfig {
            dims: p.dims,
            traditional: p.traditional,
            base: p.base,
            scale: p.scale,
            offset: p.offset,
            forward: p.forward,
        }
    }
}

/// Apply the rotation described by `params` to `x` (`[..., seq, features]`).
pub fn rope(x: &Array, params: RopeParams, ctx: &Context) -> Result<Array> {
    if x.ndim() < 3 {
        return Err(FuseError::invalid(
            "rope",
            format!(
                "Input must have at least 3 dimensions but got input with {} dimensions.",
                x.ndim()
            ),
        ));
    }
    let d = x.dims()[x.ndim() - 1];
    if params.dims == 0 || params.dims % 2 != 0 || params.dims > d {
        return Err(FuseError::invalid(
            "rope",
            format!(
                "dims must be a positive even number no larger than the feature size {d} but got {}.",
                params.dims
            ),
        ));
    }
    if !x.dtype().is_float() {
        return Err(FuseError::invalid(
            "rope",
            format!("Received unsupported type {}.", x.dtype()),
        ));
    }

    if dispatch::use_fused_rope(ctx) {
        return Ok(make_array(
            Primitive::new(ctx.stream, Op::Rope(params)),
            vec![x.clone()],
            OutputSpec::like(x),
        ));
    }
    single(rope_fallback(&[x.eval()?], params)?, "rope")
}

/// Rotate `(a, b)` pairs by the angles whose cosines and sines are given.
fn rotate(a: &Tensor, b: &Tensor, cos: &Tensor, sin: &Tensor, forward: bool) -> Result<[Tensor; 2]> {
    if forward {
        Ok([
            a.mul(cos)?.sub(&b.mul(sin)?)?,
            a.mul(sin)?.add(&b.mul(cos)?)?,
        ])
    } else {
        Ok([
            b.mul(sin)?.add(&a.mul(cos)?)?,
            b.mul(cos)?.sub(&a.mul(sin)?)?,
        ])
    }
}

pub(crate) fn rope_fallback(inputs: &[Tensor], p: RopeParams) -> Result<Vec<Tensor>> {
    let input = &inputs[0];
    let shape = input.dims().to_vec();
    let n = shape.len();
    let (seq, feat) = (shape[n - 2], shape[n - 1]);
    let rows: usize = shape[..n - 2].iter().product();
    let x = input.reshape_to(&[rows, seq, feat])?;
    let t = x.dtype();

    // angle table [seq, dims / 2], built in the input dtype
    let half = p.dims / 2;
    let start = p.offset as f64;
    let positions = Tensor::arange(start, start + seq as f64, 1.0, t)?
        .mul(&Tensor::scalar(p.scale as f64, t))?;
    let step = (p.base as f64).ln() / half as f64;
    let freqs = Tensor::arange(0.0, half as f64, 1.0, t)?
        .neg()?
        .mul(&Tensor::scalar(step, t))?
        .exp()?;
    let theta = positions.expand_dims(1)?.mul(&freqs.expand_dims(0)?)?;
    let (cos, sin) = (theta.cos()?, theta.sin()?);

    let rest = (p.dims < feat)
        .then(|| x.slice(&[0, 0, p.dims], &[rows, seq, feat], &[1, 1, 1]))
        .transpose()?;

    let out = if p.traditional {
        let a = x.slice(&[0, 0, 0], &[rows, seq, p.dims], &[1, 1, 2])?;
        let b = x.slice(&[0, 0, 1], &[rows, seq, p.dims], &[1, 1, 2])?;
        let [ra, rb] = rotate(&a, &b, &cos, &sin, p.forward)?;
        let interleaved = Tensor::concatenate(&[&ra.expand_dims(3)?, &rb.expand_dims(3)?], 3)?;
        match rest {
            Some(rest) => {
                let rotated = interleaved.reshape_to(&[rows, seq, p.dims])?;
                Tensor::concatenate(&[&rotated, &rest], 2)?
            }
            None => interleaved,
        }
    } else {
        let a = x.slice(&[0, 0, 0], &[rows, seq, half], &[1, 1, 1])?;
        let b = x.slice(&[0, 0, half], &[rows, seq, p.dims], &[1, 1, 1])?;
        let [ra, rb] = rotate(&a, &b, &cos, &sin, p.forward)?;
        let mut parts = vec![&ra, &rb];
        if let Some(rest) = rest.as_ref() {
            parts.push(rest);
        }
        Tensor::concatenate(&parts, 2)?
    };
    Ok(vec![out.reshape_to(&shape)?])
}

pub(crate) fn rope_accelerated(inputs: &[Tensor], p: RopeParams) -> Result<Vec<Tensor>> {
    Ok(vec![fused_rope(&inputs[0], &p.into())?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuse_core::DType;

    fn close(a: &[f32], b: &[f32], tol: f32) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tol)
    }

    #[test]
    fn test_rope_rank_error() {
        let x = Array::from(Tensor::zeros(&[4, 8], DType::F32));
        let err = rope(&x, RopeParams::new(8), &Context::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "[rope] Input must have at least 3 dimensions but got input with 2 dimensions."
        );
    }

    #[test]
    fn test_rope_rejects_odd_dims() {
        let x = Array::from(Tensor::zeros(&[1, 4, 8], DType::F32));
        let err = rope(&x, RopeParams::new(5), &Context::default()).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_position_zero_is_identity() {
        let x = Tensor::randn_seeded(&[1, 1, 8], 3);
        for traditional in [false, true] {
            let out = rope_fallback(&[x.clone()], RopeParams::new(8).traditional(traditional)).unwrap();
            assert!(close(&out[0].to_vec_f32(), &x.to_vec_f32(), 1e-6));
        }
    }

    #[test]
    fn test_half_pairs_rotate_by_position() {
        // one pair (x0, x1), base irrelevant for i = 0: angle = position
        let x = Tensor::from_f32(&[1.0, 0.0, 1.0, 0.0], &[1, 2, 2]);
        let out = rope_fallback(&[x], RopeParams::new(2)).unwrap()[0].to_vec_f32();
        let (c, s) = (1.0f32.cos(), 1.0f32.sin());
        assert!(close(&out, &[1.0, 0.0, c, s], 1e-6));
    }

    #[test]
    fn test_fallback_accepts_empty_sequence() {
        let x = Tensor::zeros(&[1, 0, 8], DType::F32);
        for traditional in [false, true] {
            let out = rope_fallback(&[x.clone()], RopeParams::new(8).traditional(traditional)).unwrap();
            assert_eq!(out[0].dims(), &[1, 0, 8]);
        }
    }

    #[test]
    fn test_partial_dims_pass_through() {
        let x = Tensor::randn_seeded(&[2, 3, 8], 5);
        for traditional in [false, true] {
            let out = rope_fallback(&[x.clone()], RopeParams::new(4).traditional(traditional).offset(2))
                .unwrap()
                .remove(0);
            let tail = out.slice_axis(-1, 4, 8, 1).unwrap();
            let expect = x.slice_axis(-1, 4, 8, 1).unwrap();
            assert_eq!(tail.to_vec_f32(), expect.to_vec_f32());
        }
    }

    #[test]
    fn test_kernel_matches_fallback() {
        let x = Tensor::randn_seeded(&[2, 2, 5, 16], 11);
        for traditional in [false, true] {
            for dims in [8, 16] {
                let p = RopeParams::new(dims).traditional(traditional).base(500.0).scale(0.5).offset(3);
                let a = rope_fallback(&[x.clone()], p).unwrap();
                let k = rope_accelerated(&[x.clone()], p).unwrap();
                assert_eq!(a[0].dims(), x.dims());
                assert!(close(&a[0].to_vec_f32(), &k[0].to_vec_f32(), 1e-4));
            }
        }
    }

    #[test]
    fn test_inverse_undoes_forward() {
        let x = Tensor::randn_seeded(&[1, 6, 8], 2);
        let p = RopeParams::new(8).traditional(true).offset(4);
        let y = rope_fallback(&[x.clone()], p).unwrap().remove(0);
        let back = rope_fallback(&[y], p.inverted()).unwrap().remove(0);
        assert!(close(&back.to_vec_f32(), &x.to_vec_f32(), 1e-5));
    }
}
