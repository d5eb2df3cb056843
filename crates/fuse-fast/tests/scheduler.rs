//! Deferred realization and equivalence-keyed node merging.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fuse_core::{DType, Tensor};
use fuse_fast::{affine_quantize, rms_norm, Array, Context, CustomOp, OutputSpec, Scheduler};

/// `2x`, counting how often it actually runs.
fn counted_double(count: &Arc<AtomicUsize>) -> CustomOp {
    let count = Arc::clone(count);
    CustomOp::new("double", move |xs: &[Tensor]| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(vec![xs[0].mul_scalar(2.0)?])
    })
}

fn spec() -> Vec<OutputSpec> {
    vec![OutputSpec::new(&[4], DType::F32)]
}

#[test]
fn test_node_realizes_once() {
    let count = Arc::new(AtomicUsize::new(0));
    let x = Array::from(Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[4]));
    let y = counted_double(&count).call(&[x], spec(), &Context::default()).unwrap().remove(0);
    assert_eq!(count.load(Ordering::SeqCst), 0);

    assert_eq!(y.eval().unwrap().to_vec_f32(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(y.eval().unwrap().to_vec_f32(), vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(y.node().unwrap().is_realized());
}

#[test]
fn test_concurrent_realization_computes_once() {
    let count = Arc::new(AtomicUsize::new(0));
    let x = Array::from(Tensor::randn_seeded(&[4], 1));
    let y = counted_double(&count).call(&[x], spec(), &Context::default()).unwrap().remove(0);

    let results: Vec<Vec<f32>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| y.eval().unwrap().to_vec_f32()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(results.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_equivalent_nodes_merge() {
    let x = Array::from(Tensor::randn_seeded(&[2, 8], 2));
    let w = Array::from(Tensor::randn_seeded(&[8], 3));
    let ctx = Context::default();
    let a = rms_norm(&x, &w, 1e-5, &ctx).unwrap();
    let b = rms_norm(&x, &w, 1e-5, &ctx).unwrap();
    let c = rms_norm(&x, &w, 1e-6, &ctx).unwrap();

    let sched = Scheduler::new();
    let outs = sched.eval_all(&[a, b.clone(), c]).unwrap();
    assert_eq!(sched.cache_hits(), 1);
    assert_eq!(sched.cached_nodes(), 2);
    assert_eq!(outs[0].to_vec_f32(), outs[1].to_vec_f32());
    // b was answered by a's node
    assert!(!b.node().unwrap().is_realized());
}

#[test]
fn test_merging_follows_pending_inputs() {
    let count = Arc::new(AtomicUsize::new(0));
    let op = counted_double(&count);
    let x = Array::from(Tensor::randn_seeded(&[4], 4));
    let ctx = Context::default();

    // two separately built chains double(double(x))
    let chain = || {
        let inner = op.call(&[x.clone()], spec(), &ctx).unwrap().remove(0);
        op.call(&[inner], spec(), &ctx).unwrap().remove(0)
    };
    let (first, second) = (chain(), chain());

    let sched = Scheduler::new();
    let a = sched.eval(&first).unwrap();
    let b = sched.eval(&second).unwrap();
    assert_eq!(a.to_vec_f32(), b.to_vec_f32());
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(sched.cache_hits(), 2);
}

#[test]
fn test_distinct_custom_ops_do_not_merge() {
    let count = Arc::new(AtomicUsize::new(0));
    let x = Array::from(Tensor::randn_seeded(&[4], 5));
    let ctx = Context::default();
    let a = counted_double(&count).call(&[x.clone()], spec(), &ctx).unwrap().remove(0);
    let b = counted_double(&count).call(&[x], spec(), &ctx).unwrap().remove(0);

    let sched = Scheduler::new();
    sched.eval_all(&[a, b]).unwrap();
    assert_eq!(sched.cache_hits(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn test_quantize_outputs_share_one_node() {
    let w = Array::from(Tensor::randn_seeded(&[2, 256], 6));
    let (packed, scales, biases) = affine_quantize(&w, 64, 4, &Context::default()).unwrap();
    let node = packed.node().unwrap();
    assert!(Arc::ptr_eq(node, scales.node().unwrap()));
    assert!(Arc::ptr_eq(node, biases.node().unwrap()));

    scales.eval().unwrap();
    assert!(node.is_realized());
    assert_eq!(packed.eval().unwrap().dtype(), DType::U32);
}

#[test]
fn test_tracked_input_does_not_merge_with_detached_copy() {
    let leaf = Tensor::randn_seeded(&[2, 8], 7).to_leaf();
    let w = Array::from(Tensor::ones(&[8], DType::F32));
    let ctx = Context::default();
    let plain = rms_norm(&Array::from(leaf.detach()), &w, 1e-5, &ctx).unwrap();
    let tracked = rms_norm(&Array::from(&leaf), &w, 1e-5, &ctx).unwrap();

    let sched = Scheduler::new();
    let a = sched.eval(&plain).unwrap();
    let b = sched.eval(&tracked).unwrap();
    assert_eq!(sched.cache_hits(), 0);
    assert_eq!(a.to_vec_f32(), b.to_vec_f32());
    assert!(!a.tracks_grad());
    assert!(b.tracks_grad());

    b.sum().unwrap().backward().unwrap();
    assert_eq!(leaf.grad().unwrap().dims(), &[2, 8]);
}

#[test]
fn test_clear_forgets_cached_nodes() {
    let count = Arc::new(AtomicUsize::new(0));
    let op = counted_double(&count);
    let x = Array::from(Tensor::randn_seeded(&[4], 8));
    let ctx = Context::default();

    let sched = Scheduler::new();
    sched.eval(&op.call(&[x.clone()], spec(), &ctx).unwrap().remove(0)).unwrap();
    assert_eq!(sched.cached_nodes(), 1);

    sched.clear();
    assert_eq!(sched.cached_nodes(), 0);
    sched.eval(&op.call(&[x], spec(), &ctx).unwrap().remove(0)).unwrap();
    assert_eq!(sched.cache_hits(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 2);
}
