//! Affine group quantization.
//!
//! Every run of `group_size` features along the last axis shares a
//! `(scale, bias)` pair, and `w ≈ q * scale + bias` with `q` an unsigned
//! `bits`-wide integer. `32 / bits` values are packed per u32 word, the
//! first value in the lowest bits.

use fuse_core::{DType, FuseError, Result, Tensor};
use fuse_kernels::{affine_dequantize as kernel_dequantize, affine_pack, affine_quantize as kernel_quantize};

use crate::dispatch::{self, Context};
use crate::graph::{make_array, make_arrays, single, Array, OutputSpec};
use crate::primitive::{Op, Primitive};

/// Which half of the codec a node runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QuantMode {
    /// Estimate scales and biases, then pack.
    Quantize,
    /// Pack against given scales and biases.
    Pack,
    /// Unpack and rescale.
    Dequantize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuantParams {
    pub group_size: usize,
    pub bits: u32,
    pub mode: QuantMode,
}

impl QuantParams {
    fn per_word(&self) -> usize {
        32 / self.bits as usize
    }

    fn n_bins(&self) -> f64 {
        ((1u64 << self.bits) - 1) as f64
    }
}

const SCALE_EPS: f64 = 1e-7;

/// `dims` with the last axis replaced.
fn with_last(dims: &[usize], last: usize) -> Vec<usize> {
    let mut out = dims.to_vec();
    if let Some(l) = out.last_mut() {
        *l = last;
    }
    out
}

/// Shared validation of the quantize entry points; returns the params.
fn check_quantize(w: &Array, group_size: i32, bits: i32, mode: QuantMode) -> Result<QuantParams> {
    if !matches!(group_size, 32 | 64 | 128) {
        return Err(FuseError::invalid(
            "quantize",
            format!(
                "The requested group size {group_size} is not supported. The supported group sizes are 32, 64 and 128."
            ),
        ));
    }
    if !matches!(bits, 2 | 4 | 8) {
        return Err(FuseError::invalid(
            "quantize",
            format!("The requested number of bits {bits} is not supported. The supported bits are 2, 4 and 8."),
        ));
    }
    if w.ndim() < 2 {
        return Err(FuseError::invalid(
            "quantize",
            format!(
                "The matrix to be quantized must have at least 2 dimension but it has only {}.",
                w.ndim()
            ),
        ));
    }
    let features = w.dims()[w.ndim() - 1];
    if features % group_size as usize != 0 {
        return Err(FuseError::invalid(
            "quantize",
            format!(
                "The last dimension of the matrix needs to be divisible by the quantization group size {group_size}. However the provided matrix has shape {}",
                w.shape()
            ),
        ));
    }
    let per_word = 32 / bits as usize;
    if features < 32 * per_word {
        return Err(FuseError::invalid(
            "quantize",
            format!(
                "The feature dimension (2nd dimension of the matrix) is too small for quantization. We support >=512 for 2 bits, >= 256 for 4 bits and >= 128 for 8 bits. The provided matrix has shape {}.",
                w.shape()
            ),
        ));
    }
    if !w.dtype().is_float() {
        return Err(FuseError::invalid(
            "quantize",
            format!("Received unsupported type {}.", w.dtype()),
        ));
    }
    Ok(QuantParams {
        group_size: group_size as usize,
        bits: bits as u32,
        mode,
    })
}

// ============================================================================
// Public operators
// ============================================================================

/// Quantize `w` (`[..., N]`) into `(packed, scales, biases)`, shaped
/// `[..., N * bits / 32]` (u32) and `[..., N / group_size]` twice (w's
/// dtype).
pub fn affine_quantize(
    w: &Array,
    group_size: i32,
    bits: i32,
    ctx: &Context,
) -> Result<(Array, Array, Array)> {
    let params = check_quantize(w, group_size, bits, QuantMode::Quantize)?;
    let features = w.dims()[w.ndim() - 1];

    let mut outputs = if dispatch::use_fused_quantize(ctx, "quantize", w.dtype()) {
        let sshape = with_last(w.dims(), features / params.group_size);
        make_arrays(
            Primitive::new(ctx.stream, Op::AffineQuantize(params)),
            vec![w.clone()],
            vec![
                OutputSpec::new(&with_last(w.dims(), features / params.per_word()), DType::U32),
                OutputSpec::new(&sshape, w.dtype()),
                OutputSpec::new(&sshape, w.dtype()),
            ],
        )
    } else {
        quantize_fallback(&[w.eval()?], params)?
            .into_iter()
            .map(Array::Ready)
            .collect()
    };
    if outputs.len() != 3 {
        return Err(FuseError::Kernel(format!(
            "quantize produced {} outputs, expected 3",
            outputs.len()
        )));
    }
    let biases = outputs.remove(2);
    let scales = outputs.remove(1);
    let packed = outputs.remove(0);
    Ok((packed, scales, biases))
}

/// Pack `w` against previously estimated `scales` and `biases`.
pub fn affine_quantize_with(
    w: &Array,
    scales: &Array,
    biases: &Array,
    group_size: i32,
    bits: i32,
    ctx: &Context,
) -> Result<Array> {
    let params = check_quantize(w, group_size, bits, QuantMode::Pack)?;
    let features = w.dims()[w.ndim() - 1];
    let sshape = with_last(w.dims(), features / params.group_size);
    if scales.dims() != sshape.as_slice() || biases.dims() != sshape.as_slice() {
        return Err(FuseError::invalid(
            "quantize",
            format!(
                "Shape of scales and biases does not match the matrix. Expected {:?} for a matrix of shape {} but got scales {} and biases {}.",
                sshape,
                w.shape(),
                scales.shape(),
                biases.shape()
            ),
        ));
    }

    if dispatch::use_fused_quantize(ctx, "quantize", w.dtype()) {
        return Ok(make_array(
            Primitive::new(ctx.stream, Op::AffineQuantize(params)),
            vec![w.clone(), scales.clone(), biases.clone()],
            OutputSpec::new(&with_last(w.dims(), features / params.per_word()), DType::U32),
        ));
    }
    single(
        quantize_fallback(&[w.eval()?, scales.eval()?, biases.eval()?], params)?,
        "quantize",
    )
}

/// Unpack `w` and rescale it. The result has `scales`' dtype and `w`'s
/// shape with the last axis widened by `32 / bits`.
pub fn affine_dequantize(
    w: &Array,
    scales: &Array,
    biases: &Array,
    group_size: i32,
    bits: i32,
    ctx: &Context,
) -> Result<Array> {
    if bits <= 0 {
        return Err(FuseError::invalid("dequantize", format!("Invalid value for bits: {bits}")));
    }
    if group_size <= 0 {
        return Err(FuseError::invalid(
            "dequantize",
            format!("Invalid value for group_size: {group_size}"),
        ));
    }
    if 32 % bits != 0 {
        return Err(FuseError::invalid(
            "dequantize",
            format!("bits must divide 32 but got {bits}."),
        ));
    }
    if w.ndim() < 2 || scales.ndim() < 2 || biases.ndim() < 2 {
        return Err(FuseError::invalid(
            "dequantize",
            format!(
                "The matrix to be dequantized must have at least 2 dimension but it has only {}.",
                w.ndim().min(scales.ndim()).min(biases.ndim())
            ),
        ));
    }
    let leading = |a: &Array| a.dims()[..a.ndim() - 1].to_vec();
    if leading(w) != leading(scales) || scales.dims() != biases.dims() {
        return Err(FuseError::invalid(
            "dequantize",
            "Shape of scales and biases does not match the matrix",
        ));
    }
    if w.dtype() != DType::U32 {
        return Err(FuseError::invalid(
            "dequantize",
            "The matrix should be given as a uint32",
        ));
    }
    if !scales.dtype().is_float() {
        return Err(FuseError::invalid(
            "dequantize",
            format!("Received unsupported type {}.", scales.dtype()),
        ));
    }

    let per_word = 32 / bits as usize;
    let words = w.dims()[w.ndim() - 1];
    let groups = scales.dims()[scales.ndim() - 1];
    if words * per_word != groups * group_size as usize {
        return Err(FuseError::invalid(
            "dequantize",
            format!(
                "Shape of scales and biases does not match the matrix given the quantization parameters. Provided matrix of shape {} and scales/biases of shape {} with group_size={group_size} and bits={bits}.",
                w.shape(),
                scales.shape()
            ),
        ));
    }

    let params = QuantParams {
        group_size: group_size as usize,
        bits: bits as u32,
        mode: QuantMode::Dequantize,
    };
    if dispatch::use_fused_quantize(ctx, "dequantize", scales.dtype()) {
        return Ok(make_array(
            Primitive::new(ctx.stream, Op::AffineQuantize(params)),
            vec![w.clone(), scales.clone(), biases.clone()],
            OutputSpec::new(&with_last(w.dims(), words * per_word), scales.dtype()),
        ));
    }
    single(
        quantize_fallback(&[w.eval()?, scales.eval()?, biases.eval()?], params)?,
        "dequantize",
    )
}

// ============================================================================
// Decomposition
// ============================================================================

/// Product of every axis but the last. Concrete sizes keep empty inputs
/// reshapeable, where `-1` inference would be ambiguous.
fn leading_rows(dims: &[usize]) -> usize {
    dims[..dims.len().saturating_sub(1)].iter().product()
}

/// Quantize grouped values `[rows, groups, group_size]` against broadcastable
/// scales and biases and pack them into `[rows, words]` u32.
fn pack_groups(grouped: &Tensor, scales: &Tensor, biases: &Tensor, p: QuantParams) -> Result<Tensor> {
    let (rows, groups) = (grouped.dims()[0], grouped.dims()[1]);
    let per_word = p.per_word();
    let words = groups * p.group_size / per_word;
    let q = grouped
        .sub(biases)?
        .div(scales)?
        .round()?
        .clip(0.0, p.n_bins())?
        .astype(DType::U32)?;
    let shifts: Vec<u32> = (0..per_word).map(|i| 1u32 << (p.bits as usize * i)).collect();
    let shifts = Tensor::from_u32(&shifts, &[per_word]);
    q.reshape_to(&[rows, words, per_word])?
        .mul(&shifts)?
        .sum_axes(&[2], false)
}

fn estimate_and_pack(w: &Tensor, p: QuantParams) -> Result<Vec<Tensor>> {
    let t = w.dtype();
    let features = w.dims()[w.ndim() - 1];
    let groups = features / p.group_size;
    let zero = Tensor::scalar(0.0, t);

    let grouped = w.reshape_to(&[leading_rows(w.dims()), groups, p.group_size])?;
    let w_max = grouped.max_axes(&[-1], true)?;
    let w_min = grouped.min_axes(&[-1], true)?;
    let anchor_min = w_min.abs()?.greater(&w_max.abs()?)?;

    let scales = w_max
        .sub(&w_min)?
        .div(&Tensor::scalar(p.n_bins(), t))?
        .maximum(&Tensor::scalar(SCALE_EPS, t))?;
    let scales = Tensor::where_cond(&anchor_min, &scales, &scales.neg()?)?;
    let edge = Tensor::where_cond(&anchor_min, &w_min, &w_max)?;
    let q0 = edge.div(&scales)?.round()?;
    let scales = Tensor::where_cond(&q0.not_equal(&zero)?, &edge.div(&q0)?, &scales)?;
    let biases = Tensor::where_cond(&q0.equal(&zero)?, &zero, &edge)?;

    let packed = pack_groups(&grouped, &scales, &biases, p)?;
    let param_dims = with_last(w.dims(), groups);
    Ok(vec![
        packed.reshape_to(&with_last(w.dims(), features / p.per_word()))?,
        scales.reshape_to(&param_dims)?,
        biases.reshape_to(&param_dims)?,
    ])
}

fn pack_with(w: &Tensor, scales: &Tensor, biases: &Tensor, p: QuantParams) -> Result<Vec<Tensor>> {
    let features = w.dims()[w.ndim() - 1];
    let (rows, groups) = (leading_rows(w.dims()), features / p.group_size);
    let grouped = w.reshape_to(&[rows, groups, p.group_size])?;
    let scales = scales.reshape_to(&[rows, groups, 1])?;
    let biases = biases.reshape_to(&[rows, groups, 1])?;
    let packed = pack_groups(&grouped, &scales, &biases, p)?;
    Ok(vec![packed.reshape_to(&with_last(w.dims(), features / p.per_word()))?])
}

fn unpack_and_scale(w: &Tensor, scales: &Tensor, biases: &Tensor, p: QuantParams) -> Result<Vec<Tensor>> {
    let bits = p.bits as usize;
    let fields = (0..32)
        .step_by(bits)
        .map(|start| {
            w.left_shift(&Tensor::scalar((32 - (start + bits)) as f64, DType::U32))?
                .right_shift(&Tensor::scalar((32 - bits) as f64, DType::U32))?
                .expand_dims(-1)
        })
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<&Tensor> = fields.iter().collect();
    let unpacked = Tensor::concatenate(&refs, -1)?;

    let groups = scales.dims()[scales.ndim() - 1];
    let mut grouped_shape = with_last(w.dims(), groups);
    grouped_shape.push(p.group_size);
    let out = unpacked
        .reshape_to(&grouped_shape)?
        .mul(&scales.expand_dims(-1)?)?
        .add(&biases.expand_dims(-1)?)?;
    Ok(vec![out.reshape_to(&with_last(scales.dims(), groups * p.group_size))?])
}

pub(crate) fn quantize_fallback(inputs: &[Tensor], p: QuantParams) -> Result<Vec<Tensor>> {
    match p.mode {
        QuantMode::Quantize => estimate_and_pack(&inputs[0], p),
        QuantMode::Pack => pack_with(&inputs[0], &inputs[1], &inputs[2], p),
        QuantMode::Dequantize => unpack_and_scale(&inputs[0], &inputs[1], &inputs[2], p),
    }
}

/// The packing kernels take f32 values only and handle 2, 4 and 8 bits.
pub(crate) fn quantize_accelerated(inputs: &[Tensor], p: QuantParams) -> Option<Result<Vec<Tensor>>> {
    if !matches!(p.bits, 2 | 4 | 8) {
        return None;
    }
    let f32_at = |i: usize| inputs.get(i).map_or(false, |t| t.dtype() == DType::F32);
    match p.mode {
        QuantMode::Quantize if f32_at(0) => Some(
            kernel_quantize(&inputs[0], p.group_size, p.bits).map(|(q, s, b)| vec![q, s, b]),
        ),
        QuantMode::Pack if f32_at(0) && f32_at(1) && f32_at(2) => Some(
            affine_pack(&inputs[0], &inputs[1], &inputs[2], p.group_size, p.bits).map(|q| vec![q]),
        ),
        QuantMode::Dequantize if f32_at(1) && f32_at(2) => Some(
            kernel_dequantize(&inputs[0], &inputs[1], &inputs[2], p.group_size, p.bits)
                .map(|w| vec![w]),
        ),
        _ => None,
    }
}
