//! End-to-end checks of the autodiff tape against finite differences.

use fuse_core::autograd::{backward_many, forward_tangents};
use fuse_core::{DType, Tensor};
use std::collections::HashMap;

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "element {} differs: {} vs {} (tol={})",
            i, x, y, tol
        );
    }
}

/// Central differences of a scalar-valued function, computed in f64.
fn numeric_grad(f: impl Fn(&Tensor) -> Tensor, x: &[f64], shape: &[usize]) -> Vec<f32> {
    let h = 1e-5;
    (0..x.len())
        .map(|i| {
            let mut plus = x.to_vec();
            let mut minus = x.to_vec();
            plus[i] += h;
            minus[i] -= h;
            let fp = f(&Tensor::from_f64(&plus, shape)).item().unwrap();
            let fm = f(&Tensor::from_f64(&minus, shape)).item().unwrap();
            ((fp - fm) / (2.0 * h)) as f32
        })
        .collect()
}

fn composite(x: &Tensor) -> Tensor {
    // sum(softmax(x) * exp(x / 2)) + mean(x^2)
    let s = x.softmax(-1).unwrap();
    let e = x.mul_scalar(0.5).unwrap().exp().unwrap();
    let a = s.mul(&e).unwrap().sum().unwrap();
    let b = x.square().unwrap().mean().unwrap();
    a.add(&b).unwrap()
}

// ============================================================================
// Reverse mode
// ============================================================================

#[test]
fn test_composite_matches_finite_differences() {
    let values = [0.3, -1.2, 0.8, 2.0, -0.5, 0.1];
    let x = Tensor::from_f64(&values, &[2, 3]).to_leaf();
    composite(&x).backward().unwrap();
    let expected = numeric_grad(composite, &values, &[2, 3]);
    assert_close(&x.grad().unwrap().to_vec_f32(), &expected, 1e-4);
}

#[test]
fn test_rms_style_expression() {
    // x * rsqrt(mean(x^2) + eps), the reference form of RMS normalization
    let f = |x: &Tensor| {
        let ms = x.square().unwrap().mean_axes(&[-1], true).unwrap();
        let inv = ms.add_scalar(1e-5).unwrap().rsqrt().unwrap();
        let w = Tensor::from_f64(&[1.0, 2.0, 3.0, 4.0], &[4]);
        x.mul(&inv).unwrap().mul(&w).unwrap().sum().unwrap()
    };
    let values = [0.5, -1.0, 1.5, 2.0];
    let x = Tensor::from_f64(&values, &[4]).to_leaf();
    f(&x).backward().unwrap();
    let expected = numeric_grad(f, &values, &[4]);
    assert_close(&x.grad().unwrap().to_vec_f32(), &expected, 1e-4);
}

#[test]
fn test_slice_concat_roundtrip_grad() {
    let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[6]).to_leaf();
    let lo = x.slice_axis(0, 0, 3, 1).unwrap();
    let hi = x.slice_axis(0, 3, 6, 1).unwrap();
    let swapped = Tensor::concatenate(&[&hi, &lo], 0).unwrap();
    let w = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[6]);
    swapped.mul(&w).unwrap().sum().unwrap().backward().unwrap();
    assert_eq!(x.grad().unwrap().to_vec_f32(), vec![4.0, 5.0, 6.0, 1.0, 2.0, 3.0]);
}

#[test]
fn test_backward_many_accumulates_seeds() {
    let x = Tensor::from_f32(&[1.0, 2.0], &[2]).to_leaf();
    let a = x.mul_scalar(3.0).unwrap();
    let b = x.square().unwrap();
    let seeds = vec![
        (a.grad_node().unwrap().clone(), Tensor::ones(&[2], DType::F32)),
        (b.grad_node().unwrap().clone(), Tensor::from_f32(&[1.0, 0.5], &[2])),
    ];
    backward_many(&seeds).unwrap();
    // 3 + 2x * seed_b
    assert_eq!(x.grad().unwrap().to_vec_f32(), vec![5.0, 5.0]);
}

// ============================================================================
// Forward mode
// ============================================================================

#[test]
fn test_forward_tangents_match_reverse() {
    let values = [0.3, -1.2, 0.8];
    let x = Tensor::from_f64(&values, &[3]).to_leaf();
    let y = composite(&x);
    let v = Tensor::from_f64(&[1.0, 0.0, -2.0], &[3]);

    let seeds: HashMap<usize, Tensor> = [(x.grad_node().unwrap().id, v.clone())].into();
    let out = forward_tangents(&[y.grad_node().unwrap().clone()], &seeds).unwrap();
    let jvp = out[0].as_ref().unwrap().item().unwrap();

    y.backward().unwrap();
    let g = x.grad().unwrap().to_vec_f64();
    let expected: f64 = g.iter().zip(v.to_vec_f64()).map(|(a, b)| a * b).sum();
    assert!((jvp - expected).abs() < 1e-9, "{jvp} vs {expected}");
}

#[test]
fn test_unrelated_seed_yields_no_tangent() {
    let x = Tensor::from_f32(&[1.0], &[1]).to_leaf();
    let z = Tensor::from_f32(&[2.0], &[1]).to_leaf();
    let y = x.exp().unwrap();
    let seeds: HashMap<usize, Tensor> = [(z.grad_node().unwrap().id, Tensor::ones(&[1], DType::F32))].into();
    let out = forward_tangents(&[y.grad_node().unwrap().clone()], &seeds).unwrap();
    assert!(out[0].is_none());
}
