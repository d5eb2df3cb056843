//! User-defined fused operators.
//!
//! A [`CustomOp`] pairs a decomposition with an optional accelerated
//! implementation. Its gradients, tangents and batching all replay the
//! decomposition, so only the forward pass has to be written.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fuse_core::{FuseError, Result, Tensor};

use crate::dispatch::Context;
use crate::graph::{make_arrays, Array, OutputSpec};
use crate::primitive::{Op, Primitive};

/// Host implementation of a custom operator.
pub type CustomFn = Arc<dyn Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync>;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// A named operator built from a decomposition. Clones share an identity, so
/// nodes of the same op merge in the scheduler.
#[derive(Clone)]
pub struct CustomOp {
    name: Arc<str>,
    id: usize,
    fallback: CustomFn,
    accelerated: Option<CustomFn>,
}

impl CustomOp {
    pub fn new<F>(name: &str, fallback: F) -> Self
    where
        F: Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            fallback: Arc::new(fallback),
            accelerated: None,
        }
    }

    /// Use `f` instead of the decomposition when the node is realized.
    pub fn with_accelerated<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync + 'static,
    {
        self.accelerated = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn run_fallback(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        (self.fallback)(inputs)
    }

    pub(crate) fn run_accelerated(&self, inputs: &[Tensor]) -> Option<Result<Vec<Tensor>>> {
        self.accelerated.as_ref().map(|f| f(inputs))
    }

    /// Build a node on `ctx`'s stream producing `outputs`.
    pub fn call(&self, inputs: &[Array], outputs: Vec<OutputSpec>, ctx: &Context) -> Result<Vec<Array>> {
        if outputs.is_empty() {
            return Err(FuseError::invalid(self.name(), "a custom op needs at least one output."));
        }
        tracing::debug!(op = self.name(), stream = %ctx.stream, fused = true, reason = "custom", "dispatch");
        Ok(make_arrays(
            Primitive::new(ctx.stream, Op::Custom(self.clone())),
            inputs.to_vec(),
            outputs,
        ))
    }
}

impl fmt::Debug for CustomOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomOp")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("accelerated", &self.accelerated.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuse_core::DType;

    fn square_plus() -> CustomOp {
        CustomOp::new("square_plus", |xs: &[Tensor]| {
            Ok(vec![xs[0].square()?.add(&xs[1])?])
        })
    }

    #[test]
    fn test_call_defers_until_eval() {
        let op = square_plus();
        let x = Array::from(Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]));
        let y = Array::from(Tensor::ones(&[3], DType::F32));
        let out = op
            .call(&[x, y], vec![OutputSpec::new(&[3], DType::F32)], &Context::default())
            .unwrap();
        assert!(out[0].is_pending());
        assert_eq!(out[0].eval().unwrap().to_vec_f32(), vec![2.0, 5.0, 10.0]);
    }

    #[test]
    fn test_accelerated_takes_precedence() {
        let op = square_plus().with_accelerated(|xs: &[Tensor]| Ok(vec![Tensor::zeros_like(&xs[0])]));
        let x = Array::from(Tensor::from_f32(&[1.0, 2.0], &[2]));
        let out = op
            .call(&[x.clone(), x], vec![OutputSpec::new(&[2], DType::F32)], &Context::default())
            .unwrap();
        assert_eq!(out[0].eval().unwrap().to_vec_f32(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_clones_share_identity() {
        let a = square_plus();
        let b = a.clone();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), square_plus().id());
    }

    #[test]
    fn test_output_spec_mismatch_is_reported() {
        let op = square_plus();
        let x = Array::from(Tensor::from_f32(&[1.0, 2.0], &[2]));
        let out = op
            .call(&[x.clone(), x], vec![OutputSpec::new(&[3], DType::F32)], &Context::default())
            .unwrap();
        assert!(out[0].eval().is_err());
    }
}
