//! Consistency between the three transforms on composite functions.

use fuse_autograd::{jvp, vjp, vmap};
use fuse_core::{Result, Tensor};

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

/// A two-input, two-output function exercising broadcasting and matmul.
fn model(xs: &[Tensor]) -> Result<Vec<Tensor>> {
    let (x, w) = (&xs[0], &xs[1]);
    let h = x.matmul(w)?.sin()?;
    let s = h.softmax(-1)?;
    Ok(vec![s, h.square()?.mean_axes(&[-1], false)?])
}

#[test]
fn test_vjp_jvp_duality() {
    let x = Tensor::randn_seeded(&[3, 4], 7);
    let w = Tensor::randn_seeded(&[4, 5], 11);
    let u = Tensor::randn_seeded(&[3, 4], 13);
    let v = Tensor::randn_seeded(&[4, 5], 17);
    let ct0 = Tensor::randn_seeded(&[3, 5], 19);
    let ct1 = Tensor::randn_seeded(&[3], 23);

    // <ct, J [u, v]> == <J^T ct, [u, v]>
    let (_, tangents) = jvp(model, &[x.clone(), w.clone()], &[u.clone(), v.clone()]).unwrap();
    let lhs: f32 = tangents[0].mul(&ct0).unwrap().sum().unwrap().item().unwrap() as f32
        + tangents[1].mul(&ct1).unwrap().sum().unwrap().item().unwrap() as f32;

    let (_, grads) = vjp(model, &[x, w], &[ct0, ct1]).unwrap();
    let rhs: f32 = grads[0].mul(&u).unwrap().sum().unwrap().item().unwrap() as f32
        + grads[1].mul(&v).unwrap().sum().unwrap().item().unwrap() as f32;

    assert!((lhs - rhs).abs() < 1e-3, "{lhs} vs {rhs}");
}

#[test]
fn test_vmap_matches_direct_rows() {
    let x = Tensor::randn_seeded(&[4, 3, 4], 3);
    let w = Tensor::randn_seeded(&[4, 5], 5);
    let batched = vmap(model, vec![Some(0), None])(&[x.clone(), w.clone()]).unwrap();
    assert_eq!(batched[0].dims(), &[4, 3, 5]);
    assert_eq!(batched[1].dims(), &[4, 3]);

    let direct = model(&[x, w]).unwrap();
    assert_close(&batched[0].to_vec_f32(), &direct[0].to_vec_f32(), 1e-6);
    assert_close(&batched[1].to_vec_f32(), &direct[1].to_vec_f32(), 1e-6);
}

#[test]
fn test_vjp_through_vmap() {
    let x = Tensor::randn_seeded(&[2, 3], 29);
    let batched_sum = vmap(|xs: &[Tensor]| Ok(vec![xs[0].exp()?.sum()?]), vec![Some(0)]);
    let ones = Tensor::ones(&[2], fuse_core::DType::F32);
    let (_, grads) = vjp(|xs: &[Tensor]| batched_sum(xs), &[x.clone()], &[ones]).unwrap();
    assert_close(&grads[0].to_vec_f32(), &x.exp().unwrap().to_vec_f32(), 1e-5);
}
