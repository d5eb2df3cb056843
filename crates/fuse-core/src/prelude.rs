//! Convenience re-exports.

pub use crate::autograd::{is_grad_enabled, EnableGradGuard, GradFn, GradNode, NoGradGuard};
pub use crate::device::{Device, DeviceCaps, Stream};
pub use crate::dtype::DType;
pub use crate::error::FuseError;
pub use crate::shape::Shape;
pub use crate::tensor::Tensor;
pub use crate::Result;
