//! Reverse- and forward-mode products of tensor functions.

use std::collections::HashMap;

use fuse_core::autograd::{backward_many, forward_tangents, EnableGradGuard};
use fuse_core::{FuseError, Result, Tensor};

fn fresh_leaves(primals: &[Tensor]) -> Vec<Tensor> {
    primals.iter().map(Tensor::to_leaf).collect()
}

/// Trace `f` on leaf copies of `primals` with recording forced on.
fn trace<F>(f: &F, primals: &[Tensor]) -> Result<(Vec<Tensor>, Vec<Tensor>)>
where
    F: Fn(&[Tensor]) -> Result<Vec<Tensor>>,
{
    let leaves = fresh_leaves(primals);
    let _guard = EnableGradGuard::new();
    let outputs = f(&leaves)?;
    Ok((leaves, outputs))
}

/// Vector-Jacobian product.
///
/// Returns `(outputs, grads)` where `grads[i]` is the gradient of
/// `sum(outputs[j] * cotangents[j])` with respect to `primals[i]`. Inputs the
/// outputs do not depend on get zeros.
pub fn vjp<F>(f: F, primals: &[Tensor], cotangents: &[Tensor]) -> Result<(Vec<Tensor>, Vec<Tensor>)>
where
    F: Fn(&[Tensor]) -> Result<Vec<Tensor>>,
{
    let (leaves, outputs) = trace(&f, primals)?;
    if outputs.len() != cotangents.len() {
        return Err(FuseError::invalid(
            "vjp",
            format!(
                "expected {} cotangents but received {}.",
                outputs.len(),
                cotangents.len()
            ),
        ));
    }

    let mut roots = Vec::with_capacity(outputs.len());
    for (out, ct) in outputs.iter().zip(cotangents) {
        if out.dims() != ct.dims() {
            return Err(FuseError::ShapeMismatch {
                expected: out.dims().to_vec(),
                got: ct.dims().to_vec(),
            });
        }
        if let Some(node) = out.grad_node() {
            roots.push((node.clone(), ct.clone()));
        }
    }
    if !roots.is_empty() {
        backward_many(&roots)?;
    }
    tracing::trace!(n_primals = primals.len(), n_roots = roots.len(), "vjp");

    let grads = leaves
        .iter()
        .map(|leaf| leaf.grad().unwrap_or_else(|| Tensor::zeros_like(leaf)))
        .collect();
    let outputs = outputs.iter().map(Tensor::detach).collect();
    Ok((outputs, grads))
}

/// Jacobian-vector product.
///
/// Returns `(outputs, tangents_out)`; outputs that do not depend on any
/// primal get zero tangents.
pub fn jvp<F>(f: F, primals: &[Tensor], tangents: &[Tensor]) -> Result<(Vec<Tensor>, Vec<Tensor>)>
where
    F: Fn(&[Tensor]) -> Result<Vec<Tensor>>,
{
    if primals.len() != tangents.len() {
        return Err(FuseError::invalid(
            "jvp",
            format!(
                "expected {} tangents but received {}.",
                primals.len(),
                tangents.len()
            ),
        ));
    }
    for (p, t) in primals.iter().zip(tangents) {
        if p.dims() != t.dims() {
            return Err(FuseError::ShapeMismatch {
                expected: p.dims().to_vec(),
                got: t.dims().to_vec(),
            });
        }
    }

    let (leaves, outputs) = trace(&f, primals)?;
    let seeds: HashMap<usize, Tensor> = leaves
        .iter()
        .zip(tangents)
        .filter_map(|(leaf, t)| leaf.grad_node().map(|n| (n.id, t.clone())))
        .collect();

    let tracked: Vec<_> = outputs.iter().filter_map(|o| o.grad_node().cloned()).collect();
    let mut pushed = forward_tangents(&tracked, &seeds)?.into_iter();

    let mut tangents_out = Vec::with_capacity(outputs.len());
    for out in &outputs {
        let t = if out.tracks_grad() { pushed.next().flatten() } else { None };
        let t = match t {
            Some(t) if t.dims() == out.dims() => t,
            Some(t) => t.broadcast_to(out.dims())?,
            None => Tensor::zeros_like(out),
        };
        tangents_out.push(t);
    }
    tracing::trace!(n_primals = primals.len(), n_outputs = outputs.len(), "jvp");

    let outputs = outputs.iter().map(Tensor::detach).collect();
    Ok((outputs, tangents_out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuse_core::DType;

    fn square_sum(xs: &[Tensor]) -> Result<Vec<Tensor>> {
        Ok(vec![xs[0].square()?.sum()?])
    }

    #[test]
    fn test_vjp_square_sum() {
        let x = Tensor::from_f32(&[1.0, -2.0, 3.0], &[3]);
        let (out, grads) = vjp(square_sum, &[x.clone()], &[Tensor::scalar(1.0, DType::F32)]).unwrap();
        assert_eq!(out[0].item().unwrap(), 14.0);
        assert_eq!(grads[0].to_vec_f32(), vec![2.0, -4.0, 6.0]);
        // caller's tensor is untouched
        assert!(!x.tracks_grad());
    }

    #[test]
    fn test_vjp_unused_input_gets_zeros() {
        let x = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let y = Tensor::from_f32(&[5.0, 6.0, 7.0], &[3]);
        let (_, grads) = vjp(square_sum, &[x, y], &[Tensor::scalar(1.0, DType::F32)]).unwrap();
        assert_eq!(grads[1].to_vec_f32(), vec![0.0; 3]);
    }

    #[test]
    fn test_vjp_cotangent_count_checked() {
        let x = Tensor::from_f32(&[1.0], &[1]);
        let err = vjp(square_sum, &[x], &[]).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_jvp_square_sum() {
        let x = Tensor::from_f32(&[1.0, -2.0, 3.0], &[3]);
        let v = Tensor::from_f32(&[1.0, 1.0, 0.0], &[3]);
        let (_, t) = jvp(square_sum, &[x], &[v]).unwrap();
        // 2 * (1 - 2)
        assert_eq!(t[0].item().unwrap(), -2.0);
    }

    #[test]
    fn test_jvp_constant_output() {
        let x = Tensor::from_f32(&[1.0], &[1]);
        let f = |_: &[Tensor]| Ok(vec![Tensor::ones(&[2], DType::F32)]);
        let (_, t) = jvp(f, &[x.clone()], &[x]).unwrap();
        assert_eq!(t[0].to_vec_f32(), vec![0.0, 0.0]);
    }
}
