//! Affine sub-byte quantization kernels.
//!
//! Layout: each row of `N` features is split into groups of `group_size`
//! sharing one `(scale, bias)`; `32 / bits` quantized values are packed per
//! u32 word, lowest bits first.
//!
//! The kernels perform the same sequence of f32 operations as the
//! decomposed reference (each step rounded to f32), so packed words are
//! bit-identical to it. Only f32 inputs are accepted.

use fuse_core::{DType, FuseError, Result, Tensor};

use crate::cpu_fused::for_each_row;

/// Lower bound on the magnitude of a scale.
pub const SCALE_EPS: f64 = 1e-7;

fn require_f32(t: &Tensor) -> Result<()> {
    if t.dtype() != DType::F32 {
        return Err(FuseError::UnsupportedDType(t.dtype()));
    }
    Ok(())
}

struct Layout {
    rows: usize,
    features: usize,
    groups: usize,
    group_size: usize,
    bits: u32,
    per_word: usize,
}

impl Layout {
    fn new(dims: &[usize], features: usize, group_size: usize, bits: u32) -> Result<Self> {
        if !matches!(bits, 2 | 4 | 8) {
            return Err(FuseError::invalid(
                "quantize",
                format!("unsupported number of bits {bits}."),
            ));
        }
        if group_size == 0 || features % group_size != 0 {
            return Err(FuseError::invalid(
                "quantize",
                format!("{features} features do not split into groups of {group_size}."),
            ));
        }
        let per_word = (32 / bits) as usize;
        if group_size % per_word != 0 {
            return Err(FuseError::invalid(
                "quantize",
                format!("group size {group_size} is not a multiple of {per_word}."),
            ));
        }
        let numel: usize = dims.iter().product();
        Ok(Self {
            rows: if features == 0 { 0 } else { numel / features },
            features,
            groups: features / group_size,
            group_size,
            bits,
            per_word,
        })
    }

    fn n_bins(&self) -> f32 {
        ((1u32 << self.bits) - 1) as f32
    }

    fn words_per_row(&self) -> usize {
        self.features / self.per_word
    }

    fn with_last(dims: &[usize], last: usize) -> Vec<usize> {
        let mut out = dims.to_vec();
        if let Some(l) = out.last_mut() {
            *l = last;
        }
        out
    }
}

/// Estimate `(scale, bias)` for one group.
fn group_params(values: &[f32], n_bins: f32) -> (f32, f32) {
    let w_max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let w_min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let anchor_min = w_min.abs() > w_max.abs();
    let mut scale = ((w_max - w_min) / n_bins).max(SCALE_EPS as f32);
    if !anchor_min {
        scale = -scale;
    }
    let edge = if anchor_min { w_min } else { w_max };
    let q0 = (edge / scale).round_ties_even();
    if q0 != 0.0 {
        (edge / q0, edge)
    } else {
        (scale, 0.0)
    }
}

/// Quantize and pack one row of `features` values into `out` words.
fn pack_row(row: &[f32], scales: &[f32], biases: &[f32], layout: &Layout, out: &mut [u32]) {
    let n_bins = layout.n_bins();
    for (w, word) in out.iter_mut().enumerate() {
        let mut acc = 0u32;
        for j in 0..layout.per_word {
            let i = w * layout.per_word + j;
            let g = i / layout.group_size;
            let q = ((row[i] - biases[g]) / scales[g])
                .round_ties_even()
                .clamp(0.0, n_bins) as u32;
            acc |= q << (layout.bits as usize * j);
        }
        *word = acc;
    }
}

/// Quantize `w` (`[..., N]`, f32), returning `(packed, scales, biases)` with
/// shapes `[..., N * bits / 32]`, `[..., N / group_size]` twice.
pub fn affine_quantize(w: &Tensor, group_size: usize, bits: u32) -> Result<(Tensor, Tensor, Tensor)> {
    require_f32(w)?;
    let features = w.dims().last().copied().unwrap_or(0);
    let layout = Layout::new(w.dims(), features, group_size, bits)?;
    let ws = w.to_vec_f32();

    let n_params = layout.rows * layout.groups;
    let mut params = vec![(0.0f32, 0.0f32); n_params];
    for_each_row(&mut params, layout.groups.max(1), |r, row| {
        for (g, p) in row.iter_mut().enumerate() {
            let start = r * layout.features + g * group_size;
            *p = group_params(&ws[start..start + group_size], layout.n_bins());
        }
    });
    let scales: Vec<f32> = params.iter().map(|p| p.0).collect();
    let biases: Vec<f32> = params.iter().map(|p| p.1).collect();

    let words = layout.words_per_row();
    let mut packed = vec![0u32; layout.rows * words];
    for_each_row(&mut packed, words, |r, out| {
        let (gs, ge) = (r * layout.groups, (r + 1) * layout.groups);
        pack_row(
            &ws[r * layout.features..(r + 1) * layout.features],
            &scales[gs..ge],
            &biases[gs..ge],
            &layout,
            out,
        );
    });

    let pshape = Layout::with_last(w.dims(), words);
    let sshape = Layout::with_last(w.dims(), layout.groups);
    Ok((
        Tensor::from_u32(&packed, &pshape),
        Tensor::from_f32(&scales, &sshape),
        Tensor::from_f32(&biases, &sshape),
    ))
}

/// Pack `w` against known `scales` / `biases` (no estimation).
pub fn affine_pack(
    w: &Tensor,
    scales: &Tensor,
    biases: &Tensor,
    group_size: usize,
    bits: u32,
) -> Result<Tensor> {
    for t in [w, scales, biases] {
        require_f32(t)?;
    }
    let features = w.dims().last().copied().unwrap_or(0);
    let layout = Layout::new(w.dims(), features, group_size, bits)?;
    let expected = layout.rows * layout.groups;
    if scales.numel() != expected || biases.numel() != expected {
        return Err(FuseError::invalid(
            "quantize",
            format!(
                "expected {expected} scales and biases, got {} and {}.",
                scales.numel(),
                biases.numel()
            ),
        ));
    }
    let (ws, ss, bs) = (w.to_vec_f32(), scales.to_vec_f32(), biases.to_vec_f32());

    let words = layout.words_per_row();
    let mut packed = vec![0u32; layout.rows * words];
    for_each_row(&mut packed, words, |r, out| {
        let (gs, ge) = (r * layout.groups, (r + 1) * layout.groups);
        pack_row(
            &ws[r * layout.features..(r + 1) * layout.features],
            &ss[gs..ge],
            &bs[gs..ge],
            &layout,
            out,
        );
    });
    Ok(Tensor::from_u32(&packed, &Layout::with_last(w.dims(), words)))
}

/// Unpack and rescale: `w = q * scale + bias` per group. Output has the
/// scales' shape with the last axis widened to the full feature count.
pub fn affine_dequantize(
    packed: &Tensor,
    scales: &Tensor,
    biases: &Tensor,
    group_size: usize,
    bits: u32,
) -> Result<Tensor> {
    if packed.dtype() != DType::U32 {
        return Err(FuseError::UnsupportedDType(packed.dtype()));
    }
    require_f32(scales)?;
    require_f32(biases)?;
    let words = packed.dims().last().copied().unwrap_or(0);
    let per_word = 32 / bits.max(1) as usize;
    let features = words * per_word;
    let out_dims = Layout::with_last(packed.dims(), features);
    let layout = Layout::new(&out_dims, features, group_size, bits)?;
    if scales.numel() != layout.rows * layout.groups || biases.numel() != scales.numel() {
        return Err(FuseError::invalid(
            "dequantize",
            format!(
                "packed shape {} does not match scales shape {}.",
                packed.shape(),
                scales.shape()
            ),
        ));
    }

    let (qs, ss, bs) = (packed.to_vec_u32(), scales.to_vec_f32(), biases.to_vec_f32());
    let mask = (1u32 << bits) - 1;
    let mut out = vec![0.0f32; layout.rows * features];
    for_each_row(&mut out, features, |r, row| {
        for (i, o) in row.iter_mut().enumerate() {
            let word = qs[r * words + i / per_word];
            let q = (word >> (bits as usize * (i % per_word))) & mask;
            let g = r * layout.groups + i / group_size;
            *o = q as f32 * ss[g] + bs[g];
        }
    });
    Ok(Tensor::from_f32(&out, &out_dims))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequential(rows: usize, cols: usize) -> Tensor {
        let data: Vec<f32> = (0..rows * cols).map(|i| i as f32).collect();
        Tensor::from_f32(&data, &[rows, cols])
    }

    #[test]
    fn test_group_params_positive_range() {
        // |min| <= |max| -> anchored at the max with a negative scale
        let vals: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let (s, b) = group_params(&vals, 15.0);
        assert_eq!(s, -1.0);
        assert_eq!(b, 15.0);
    }

    #[test]
    fn test_group_params_constant_zero() {
        let (s, b) = group_params(&[0.0; 8], 15.0);
        assert_eq!(b, 0.0);
        assert!(s.abs() >= SCALE_EPS as f32);
    }

    #[test]
    fn test_sequential_4bit_layout() {
        let w = sequential(2, 256);
        let (packed, scales, biases) = affine_quantize(&w, 64, 4).unwrap();
        assert_eq!(packed.dims(), &[2, 32]);
        assert_eq!(scales.dims(), &[2, 4]);
        assert_eq!(biases.dims(), &[2, 4]);

        // group 0 spans 0..=63: scale = -63/15, bias = 63
        let s0 = scales.to_vec_f32()[0];
        assert_eq!(biases.to_vec_f32()[0], 63.0);
        assert_eq!(s0, 63.0f32 / -15.0);
        // nibbles run 15, 15-..., low bits first: value 0 maps to q = 15
        let first = packed.to_vec_u32()[0];
        assert_eq!(first & 0xF, 15);
    }

    #[test]
    fn test_dequantize_error_bound() {
        // same-sign groups never clip, so every element lands within half a step
        let w = Tensor::rand_uniform_seeded(&[4, 128], 0.0, 1.0, 9);
        let (packed, scales, biases) = affine_quantize(&w, 32, 8).unwrap();
        let back = affine_dequantize(&packed, &scales, &biases, 32, 8).unwrap();
        let (wv, bv, sv) = (w.to_vec_f32(), back.to_vec_f32(), scales.to_vec_f32());
        for i in 0..wv.len() {
            let bound = sv[i / 32].abs() / 2.0 + 1e-6;
            assert!((wv[i] - bv[i]).abs() <= bound, "element {i}");
        }
    }

    #[test]
    fn test_pack_with_returned_params_is_identical() {
        let w = Tensor::randn_seeded(&[3, 256], 4);
        let (packed, scales, biases) = affine_quantize(&w, 128, 2).unwrap();
        let again = affine_pack(&w, &scales, &biases, 128, 2).unwrap();
        assert_eq!(packed.to_vec_u32(), again.to_vec_u32());
    }

    #[test]
    fn test_rejects_non_f32() {
        let w = Tensor::zeros(&[2, 64], DType::F16);
        assert!(matches!(
            affine_quantize(&w, 64, 4),
            Err(FuseError::UnsupportedDType(DType::F16))
        ));
    }
}
