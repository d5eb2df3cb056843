use std::fmt;
use std::sync::Arc;

use crate::autograd::{self, GradNode};
use crate::dtype::DType;
use crate::error::FuseError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Result;

/// An immutable multi-dimensional array.
///
/// Every operation returns a new tensor; storage is shared through an `Arc`
/// and never written after construction. Tensors optionally carry a node of
/// the autodiff tape.
///
/// # Examples
///
/// ```
/// use fuse_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(t.shape().dims(), &[2, 2]);
/// assert_eq!(t.numel(), 4);
///
/// let flat = t.reshape(&[4]).unwrap();
/// assert_eq!(flat.shape().dims(), &[4]);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    requires_grad: bool,
    grad_node: Option<Arc<GradNode>>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from f32 data with the given shape.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self::from_storage(Storage::from_f32(data), s)
    }

    /// Create a tensor from f64 data with the given shape.
    pub fn from_f64(data: &[f64], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(s.numel(), data.len());
        Self::from_storage(Storage::from_f64_values(data, DType::F64), s)
    }

    /// Create a tensor from u32 data with the given shape.
    pub fn from_u32(data: &[u32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(s.numel(), data.len());
        Self::from_storage(Storage::from_u32(data), s)
    }

    /// Create a tensor of `dtype` from f64 values, checking the element count.
    pub fn from_values(values: &[f64], shape: &[usize], dtype: DType) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != values.len() {
            return Err(FuseError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![values.len()],
            });
        }
        Ok(Self::from_storage(Storage::from_f64_values(values, dtype), s))
    }

    /// Wrap existing storage. The caller guarantees `storage.numel() == shape.numel()`.
    pub(crate) fn from_storage(storage: Storage, shape: Shape) -> Self {
        debug_assert_eq!(storage.numel(), shape.numel());
        Self {
            storage,
            shape,
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Build a tensor from computed f64 values (length already matches `shape`).
    pub(crate) fn from_computed(values: &[f64], shape: Shape, dtype: DType) -> Self {
        Self::from_storage(Storage::from_f64_values(values, dtype), shape)
    }

    /// Build a tensor from raw storage, checking the element count.
    pub fn from_raw(storage: Storage, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != storage.numel() {
            return Err(FuseError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![storage.numel()],
            });
        }
        Ok(Self::from_storage(storage, s))
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        Self::from_storage(Storage::zeros(dtype, s.numel()), s)
    }

    /// Create a tensor of ones with the given shape and dtype.
    pub fn ones(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, 1.0, dtype)
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: &[usize], value: f64, dtype: DType) -> Self {
        let s = Shape::new(shape);
        let values = vec![value; s.numel()];
        Self::from_computed(&values, s, dtype)
    }

    /// Create a 0-D tensor.
    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self::from_computed(&[value], Shape::scalar(), dtype)
    }

    pub fn zeros_like(other: &Tensor) -> Self {
        Self::zeros(other.dims(), other.dtype())
    }

    pub fn ones_like(other: &Tensor) -> Self {
        Self::ones(other.dims(), other.dtype())
    }

    /// Create a tensor with random values from standard normal distribution N(0,1).
    pub fn randn(shape: &[usize]) -> Self {
        Self::randn_with(shape, &mut rand::thread_rng())
    }

    /// Reproducible N(0,1) samples.
    pub fn randn_seeded(shape: &[usize], seed: u64) -> Self {
        use rand::SeedableRng;
        Self::randn_with(shape, &mut rand::rngs::StdRng::seed_from_u64(seed))
    }

    fn randn_with<R: rand::Rng>(shape: &[usize], rng: &mut R) -> Self {
        let s = Shape::new(shape);
        // Box-Muller transform for normal distribution
        let data: Vec<f32> = (0..s.numel())
            .map(|_| {
                let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
                let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
                (-2.0 * u1.ln()).sqrt() * u2.cos()
            })
            .collect();
        Self::from_f32(&data, shape)
    }

    /// Create a tensor with random values uniformly distributed in [low, high).
    pub fn rand_uniform(shape: &[usize], low: f32, high: f32) -> Self {
        use rand::Rng;
        let s = Shape::new(shape);
        let mut rng = rand::thread_rng();
        let data: Vec<f32> = (0..s.numel()).map(|_| rng.gen_range(low..high)).collect();
        Self::from_f32(&data, shape)
    }

    /// Reproducible uniform samples in [low, high).
    pub fn rand_uniform_seeded(shape: &[usize], low: f32, high: f32, seed: u64) -> Self {
        use rand::{Rng, SeedableRng};
        let s = Shape::new(shape);
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..s.numel()).map(|_| rng.gen_range(low..high)).collect();
        Self::from_f32(&data, shape)
    }

    /// 1-D tensor of `dtype` holding `start, start+step, ...` below `stop`.
    pub fn arange(start: f64, stop: f64, step: f64, dtype: DType) -> Result<Self> {
        if step == 0.0 || !step.is_finite() {
            return Err(FuseError::invalid("arange", "step must be a finite non-zero value."));
        }
        let count = ((stop - start) / step).ceil().max(0.0) as usize;
        let values: Vec<f64> = (0..count).map(|i| start + i as f64 * step).collect();
        Ok(Self::from_computed(&values, Shape::new(&[count]), dtype))
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Size of `axis` (negative counts from the end).
    pub fn dim(&self, axis: isize) -> Result<usize> {
        let a = self.shape.normalize_axis(axis)?;
        Ok(self.shape.dims()[a])
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar()
    }

    // =========================================================================
    // Data access
    // =========================================================================

    pub fn to_vec_f64(&self) -> Vec<f64> {
        self.storage.to_f64_vec()
    }

    pub fn to_vec_f32(&self) -> Vec<f32> {
        self.storage.to_f32_vec()
    }

    pub fn to_vec_u32(&self) -> Vec<u32> {
        self.storage.to_u32_vec()
    }

    /// Element at a flat row-major index.
    pub fn get_f64(&self, flat_index: usize) -> Option<f64> {
        if flat_index >= self.numel() {
            return None;
        }
        let size = self.dtype().element_size();
        let bytes = &self.storage.as_bytes()[flat_index * size..(flat_index + 1) * size];
        let one = Storage::from_bytes(self.dtype(), 1, bytes.to_vec()).ok()?;
        one.to_f64_vec().first().copied()
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Result<f64> {
        if self.numel() != 1 {
            return Err(FuseError::ShapeMismatch {
                expected: vec![1],
                got: self.dims().to_vec(),
            });
        }
        self.get_f64(0)
            .ok_or_else(|| FuseError::StorageError("empty storage".into()))
    }

    // =========================================================================
    // Autograd
    // =========================================================================

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Mark this tensor as a leaf that accumulates gradients.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if requires_grad && self.grad_node.is_none() {
            self.grad_node = Some(GradNode::leaf());
        }
        if !requires_grad {
            self.grad_node = None;
        }
    }

    pub fn grad_node(&self) -> Option<&Arc<GradNode>> {
        self.grad_node.as_ref()
    }

    /// Attach a tape node (produced by an op that recorded this tensor).
    pub fn with_grad_node(mut self, node: Arc<GradNode>) -> Self {
        self.requires_grad = true;
        self.grad_node = Some(node);
        self
    }

    /// Whether this tensor participates in the tape.
    pub fn tracks_grad(&self) -> bool {
        self.grad_node.is_some()
    }

    /// Same data, no tape node.
    pub fn detach(&self) -> Tensor {
        Self::from_storage(self.storage.clone(), self.shape.clone())
    }

    /// Same data attached to a fresh leaf node.
    pub fn to_leaf(&self) -> Tensor {
        let mut t = self.detach();
        t.set_requires_grad(true);
        t
    }

    /// Accumulated gradient of a leaf or intermediate after `backward`.
    pub fn grad(&self) -> Option<Tensor> {
        self.grad_node.as_ref().and_then(|n| n.get_grad())
    }

    pub fn zero_grad(&self) {
        if let Some(node) = &self.grad_node {
            node.zero_grad();
        }
    }

    /// Reverse-mode sweep from a one-element tensor, seeded with 1.
    pub fn backward(&self) -> Result<()> {
        if self.numel() != 1 {
            return Err(FuseError::ShapeMismatch {
                expected: vec![1],
                got: self.dims().to_vec(),
            });
        }
        self.backward_with(&Tensor::ones(self.dims(), self.dtype()))
    }

    /// Reverse-mode sweep seeded with an explicit cotangent.
    pub fn backward_with(&self, grad_output: &Tensor) -> Result<()> {
        if grad_output.dims() != self.dims() {
            return Err(FuseError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: grad_output.dims().to_vec(),
            });
        }
        let node = self.grad_node.as_ref().ok_or_else(|| {
            FuseError::Autograd("backward() called on tensor without grad tracking".into())
        })?;
        autograd::backward(node, grad_output.clone())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, requires_grad={})",
            self.shape,
            self.dtype(),
            self.requires_grad,
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.to_vec_f64();
        if data.len() <= 20 {
            write!(f, "tensor({:?}, shape={}, dtype={})", data, self.shape, self.dtype())
        } else {
            write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={}, dtype={})",
                data[0],
                data[1],
                data[data.len() - 1],
                self.shape,
                self.dtype()
            )
        }
    }
}
