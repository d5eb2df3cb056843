//! Batching by loop-and-stack.
//!
//! `f` is applied once per batch index to the sliced inputs and the results
//! are stacked on a new leading axis. Every output is reported batched on
//! axis 0.

use fuse_core::{FuseError, Result, Tensor};

/// Common batch size of the mapped inputs.
fn batch_size(inputs: &[Tensor], in_axes: &[Option<usize>]) -> Result<usize> {
    if inputs.len() != in_axes.len() {
        return Err(FuseError::invalid(
            "vmap",
            format!(
                "received {} inputs but {} input axes.",
                inputs.len(),
                in_axes.len()
            ),
        ));
    }
    let mut size = None;
    for (i, (t, axis)) in inputs.iter().zip(in_axes).enumerate() {
        let Some(axis) = *axis else { continue };
        if axis >= t.ndim() {
            return Err(FuseError::invalid(
                "vmap",
                format!(
                    "input {i} with {} dimensions cannot be mapped over axis {axis}.",
                    t.ndim()
                ),
            ));
        }
        let n = t.dims()[axis];
        match size {
            None => size = Some(n),
            Some(s) if s != n => {
                return Err(FuseError::invalid(
                    "vmap",
                    format!("inconsistent batch sizes {s} and {n}."),
                ));
            }
            Some(_) => {}
        }
    }
    match size {
        None => Err(FuseError::invalid("vmap", "at least one input must be mapped.")),
        Some(0) => Err(FuseError::invalid("vmap", "cannot map over an empty axis.")),
        Some(n) => Ok(n),
    }
}

/// Apply `f` across the batch axes of `inputs` (`None` = broadcast as is).
pub fn vmap_apply<F>(f: &F, inputs: &[Tensor], in_axes: &[Option<usize>]) -> Result<Vec<Tensor>>
where
    F: Fn(&[Tensor]) -> Result<Vec<Tensor>> + ?Sized,
{
    let n = batch_size(inputs, in_axes)?;
    tracing::trace!(batch = n, n_inputs = inputs.len(), "vmap");

    let mut per_output: Vec<Vec<Tensor>> = Vec::new();
    for b in 0..n {
        let slice = inputs
            .iter()
            .zip(in_axes)
            .map(|(t, axis)| match axis {
                Some(a) => t.index_axis(*a as isize, b),
                None => Ok(t.clone()),
            })
            .collect::<Result<Vec<_>>>()?;
        let outs = f(&slice)?;
        if b == 0 {
            per_output = outs.into_iter().map(|o| vec![o]).collect();
            continue;
        }
        if outs.len() != per_output.len() {
            return Err(FuseError::invalid(
                "vmap",
                "function returned a different number of outputs across the batch.",
            ));
        }
        for (slot, o) in per_output.iter_mut().zip(outs) {
            slot.push(o);
        }
    }

    per_output
        .iter()
        .map(|pieces| {
            let refs: Vec<&Tensor> = pieces.iter().collect();
            Tensor::stack(&refs, 0)
        })
        .collect()
}

/// Lift `f` to a batched function over `in_axes`.
pub fn vmap<F>(f: F, in_axes: Vec<Option<usize>>) -> impl Fn(&[Tensor]) -> Result<Vec<Tensor>>
where
    F: Fn(&[Tensor]) -> Result<Vec<Tensor>>,
{
    move |inputs: &[Tensor]| vmap_apply(&f, inputs, &in_axes)
}
