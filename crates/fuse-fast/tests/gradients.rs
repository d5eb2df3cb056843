//! Closed-form gradient nodes against gradients replayed through the
//! decompositions, plus the default rules of user operators.

use fuse_autograd::vjp;
use fuse_core::{DType, Result, Stream, Tensor};
use fuse_fast::{layer_norm, rms_norm, rope, Array, Context, CustomOp, Op, OutputSpec, Primitive, RopeParams};

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

/// Gradients of `f` through the fused node on the default context.
fn node_grads(
    f: impl Fn(&[Array], &Context) -> Result<Array>,
    primals: &[Tensor],
    cotangent: &Tensor,
) -> Vec<Tensor> {
    let leaves: Vec<Tensor> = primals.iter().map(Tensor::to_leaf).collect();
    let args: Vec<Array> = leaves.iter().map(Array::from).collect();
    let out = f(&args, &Context::default()).unwrap();
    assert!(out.is_pending());
    out.eval().unwrap().backward_with(cotangent).unwrap();
    leaves.iter().map(|l| l.grad().unwrap()).collect()
}

/// Gradients of `f` replayed through its eager decomposition.
fn replay_grads(
    f: impl Fn(&[Array], &Context) -> Result<Array>,
    primals: &[Tensor],
    cotangent: &Tensor,
) -> Vec<Tensor> {
    let ctx = Context::fallback_only();
    let (_, grads) = vjp(
        |xs: &[Tensor]| {
            let args: Vec<Array> = xs.iter().map(Array::from).collect();
            Ok(vec![f(&args, &ctx)?.eval()?])
        },
        primals,
        std::slice::from_ref(cotangent),
    )
    .unwrap();
    grads
}

#[test]
fn test_rms_norm_closed_form_matches_replay() {
    let f = |a: &[Array], ctx: &Context| rms_norm(&a[0], &a[1], 1e-5, ctx);
    let primals = [Tensor::randn_seeded(&[3, 2, 8], 1), Tensor::randn_seeded(&[8], 2)];
    let g = Tensor::randn_seeded(&[3, 2, 8], 3);

    let fused = node_grads(f, &primals, &g);
    let replay = replay_grads(f, &primals, &g);
    assert_eq!(fused[1].dims(), &[8]);
    assert_close(&fused[0].to_vec_f32(), &replay[0].to_vec_f32(), 1e-4);
    assert_close(&fused[1].to_vec_f32(), &replay[1].to_vec_f32(), 1e-4);
}

#[test]
fn test_layer_norm_closed_form_matches_replay() {
    let f = |a: &[Array], ctx: &Context| layer_norm(&a[0], Some(&a[1]), Some(&a[2]), 1e-5, ctx);
    let primals = [
        Tensor::randn_seeded(&[4, 16], 4),
        Tensor::randn_seeded(&[16], 5),
        Tensor::randn_seeded(&[16], 6),
    ];
    let g = Tensor::randn_seeded(&[4, 16], 7);

    let fused = node_grads(f, &primals, &g);
    let replay = replay_grads(f, &primals, &g);
    for (a, b) in fused.iter().zip(&replay) {
        assert_eq!(a.dims(), b.dims());
        assert_close(&a.to_vec_f32(), &b.to_vec_f32(), 1e-4);
    }
}

#[test]
fn test_layer_norm_without_params_matches_replay() {
    let f = |a: &[Array], ctx: &Context| layer_norm(&a[0], None, None, 1e-5, ctx);
    let primals = [Tensor::randn_seeded(&[2, 3, 8], 8)];
    let g = Tensor::randn_seeded(&[2, 3, 8], 9);

    let fused = node_grads(f, &primals, &g);
    let replay = replay_grads(f, &primals, &g);
    assert_close(&fused[0].to_vec_f32(), &replay[0].to_vec_f32(), 1e-4);
}

#[test]
fn test_rope_gradient_is_inverse_rotation() {
    let p = RopeParams::new(8).traditional(true).offset(1);
    let f = move |a: &[Array], ctx: &Context| rope(&a[0], p, ctx);
    let primals = [Tensor::randn_seeded(&[1, 4, 8], 10)];
    let g = Tensor::randn_seeded(&[1, 4, 8], 11);

    let fused = node_grads(f, &primals, &g);
    let inverse = rope(&Array::from(&g), p.inverted(), &Context::fallback_only())
        .unwrap()
        .eval()
        .unwrap();
    assert_close(&fused[0].to_vec_f32(), &inverse.to_vec_f32(), 1e-5);

    let replay = replay_grads(f, &primals, &g);
    assert_close(&fused[0].to_vec_f32(), &replay[0].to_vec_f32(), 1e-5);
}

// ============================================================================
// User operators
// ============================================================================

/// `x^2 + y`
fn square_plus() -> CustomOp {
    CustomOp::new("square_plus", |xs: &[Tensor]| Ok(vec![xs[0].square()?.add(&xs[1])?]))
}

#[test]
fn test_custom_op_backward_replays_fallback() {
    let x = Tensor::from_f32(&[1.0, -2.0, 0.5], &[3]).to_leaf();
    let y = Tensor::from_f32(&[0.0, 1.0, 2.0], &[3]).to_leaf();
    let out = square_plus()
        .call(
            &[Array::from(&x), Array::from(&y)],
            vec![OutputSpec::new(&[3], DType::F32)],
            &Context::default(),
        )
        .unwrap();
    out[0].eval().unwrap().sum().unwrap().backward().unwrap();
    assert_close(&x.grad().unwrap().to_vec_f32(), &[2.0, -4.0, 1.0], 1e-6);
    assert_close(&y.grad().unwrap().to_vec_f32(), &[1.0, 1.0, 1.0], 1e-6);
}

#[test]
fn test_custom_op_default_jvp() {
    let prim = Primitive::new(Stream::default(), Op::Custom(square_plus()));
    let x = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
    let y = Tensor::ones(&[3], DType::F32);
    let u = Tensor::from_f32(&[0.5, 0.5, -1.0], &[3]);

    // d/dx only: 2 x u
    let t = prim.jvp(&[x.clone(), y.clone()], &[u.clone()], &[0]).unwrap();
    assert_close(&t[0].eval().unwrap().to_vec_f32(), &[1.0, 2.0, -6.0], 1e-6);

    // d/dy only: the tangent itself
    let t = prim.jvp(&[x, y], &[u.clone()], &[1]).unwrap();
    assert_close(&t[0].eval().unwrap().to_vec_f32(), &u.to_vec_f32(), 1e-6);
}

#[test]
fn test_custom_op_default_vmap() {
    let prim = Primitive::new(Stream::default(), Op::Custom(square_plus()));
    let xb = Tensor::randn_seeded(&[4, 3], 12);
    let y = Tensor::randn_seeded(&[3], 13);
    let (outs, axes) = prim.vmap(&[xb.clone(), y.clone()], &[Some(0), None]).unwrap();
    assert_eq!(axes, vec![0]);
    let batched = outs[0].eval().unwrap();
    assert_eq!(batched.dims(), &[4, 3]);
    let direct = xb.square().unwrap().add(&y).unwrap();
    assert_close(&batched.to_vec_f32(), &direct.to_vec_f32(), 1e-6);
}

#[test]
fn test_custom_op_vjp_selects_argnums() {
    let prim = Primitive::new(Stream::default(), Op::Custom(square_plus()));
    let x = Tensor::from_f32(&[3.0], &[1]);
    let y = Tensor::from_f32(&[5.0], &[1]);
    let g = Tensor::from_f32(&[2.0], &[1]);
    let out = prim.eval(&[x.clone(), y.clone()]).unwrap();
    let grads = prim.vjp(&[x, y], &[g], &[1, 0], &out).unwrap();
    assert_eq!(grads.len(), 2);
    assert_close(&grads[0].eval().unwrap().to_vec_f32(), &[2.0], 1e-6);
    assert_close(&grads[1].eval().unwrap().to_vec_f32(), &[12.0], 1e-6);
}
