//! # fuse-core
//!
//! Tensor engine underneath the fused operators.
//!
//! Provides the `Tensor` value the fused operators consume and produce:
//! - Immutable, `Arc`-backed host storage (bool, integer, f16/bf16/f32/f64)
//! - Broadcasting element-wise ops evaluated in f64 and stored in the result dtype
//! - Reductions, shape manipulation and batched matmul
//! - A reverse-mode tape with forward-mode tangent propagation
//! - Streams and device capability probing

pub mod autograd;
pub mod device;
pub mod dtype;
pub mod error;
pub mod ops;
pub mod prelude;
pub mod shape;
pub mod storage;
pub mod tensor;

pub use device::{Device, DeviceCaps, SimdTier, Stream};
pub use dtype::DType;
pub use error::FuseError;
pub use shape::Shape;
pub use storage::Storage;
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, FuseError>;
