//! # fuse-autograd
//!
//! Functional transforms over the fuse-core tape.
//!
//! Provides:
//! - `vjp`: reverse-mode products against output cotangents
//! - `jvp`: forward-mode products against input tangents
//! - `vmap`: loop-and-stack batching over chosen input axes
//!
//! Each transform takes fresh leaf copies of its primals, so calls never
//! touch gradients accumulated on the caller's tensors.

pub mod transforms;
pub mod vmap;

pub use transforms::{jvp, vjp};
pub use vmap::{vmap, vmap_apply};
