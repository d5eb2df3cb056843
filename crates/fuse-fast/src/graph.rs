//! Deferred arrays, primitive nodes and the caching scheduler.
//!
//! An [`Array`] is either a realized tensor or output `index` of a pending
//! [`Node`]. Shapes and dtypes of pending outputs are declared when the node
//! is built, so operators can validate and chain without evaluating anything.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use fuse_core::autograd::{record, GradFn, NoGradGuard};
use fuse_core::{DType, FuseError, Result, Shape, Stream, Tensor};

use crate::primitive::{EquivalenceKey, Primitive};

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

/// Declared shape and dtype of one node output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputSpec {
    pub dims: Vec<usize>,
    pub dtype: DType,
}

impl OutputSpec {
    pub fn new(dims: &[usize], dtype: DType) -> Self {
        Self {
            dims: dims.to_vec(),
            dtype,
        }
    }

    /// Spec matching an existing array.
    pub fn like(a: &Array) -> Self {
        Self::new(a.dims(), a.dtype())
    }
}

// ============================================================================
// Node
// ============================================================================

/// A primitive applied to inputs, realized at most once.
pub struct Node {
    id: usize,
    primitive: Primitive,
    inputs: Vec<Array>,
    outputs: Vec<OutputSpec>,
    realized: Mutex<Option<Vec<Tensor>>>,
}

impl Node {
    pub fn new(primitive: Primitive, inputs: Vec<Array>, outputs: Vec<OutputSpec>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            primitive,
            inputs,
            outputs,
            realized: Mutex::new(None),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn primitive(&self) -> &Primitive {
        &self.primitive
    }

    pub fn inputs(&self) -> &[Array] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputSpec] {
        &self.outputs
    }

    pub fn stream(&self) -> Stream {
        self.primitive.stream()
    }

    pub fn is_realized(&self) -> bool {
        self.realized.lock().is_some()
    }

    /// Realize every output, evaluating inputs first.
    pub fn realize(&self) -> Result<Vec<Tensor>> {
        self.realize_with(&|a: &Array| a.eval())
    }

    /// Realize with a caller-chosen input evaluator. The slot lock is held
    /// for the whole evaluation so concurrent callers compute once.
    pub(crate) fn realize_with(&self, eval_input: &dyn Fn(&Array) -> Result<Tensor>) -> Result<Vec<Tensor>> {
        let mut slot = self.realized.lock();
        if let Some(outputs) = slot.as_ref() {
            return Ok(outputs.clone());
        }

        let inputs = self
            .inputs
            .iter()
            .map(eval_input)
            .collect::<Result<Vec<_>>>()?;
        tracing::trace!(node = self.id, op = self.primitive.name(), stream = %self.stream(), "realize");

        let detached: Vec<Tensor> = inputs.iter().map(Tensor::detach).collect();
        let outputs = {
            let _guard = NoGradGuard::new();
            self.primitive.eval(&detached)?
        };
        self.check_outputs(&outputs)?;
        let outputs = self.attach_tape(&inputs, detached, outputs);

        *slot = Some(outputs.clone());
        Ok(outputs)
    }

    fn check_outputs(&self, outputs: &[Tensor]) -> Result<()> {
        if outputs.len() != self.outputs.len() {
            return Err(FuseError::Kernel(format!(
                "{} produced {} outputs but declares {}",
                self.primitive.name(),
                outputs.len(),
                self.outputs.len()
            )));
        }
        for (t, spec) in outputs.iter().zip(&self.outputs) {
            if t.dims() != spec.dims.as_slice() || t.dtype() != spec.dtype {
                return Err(FuseError::Kernel(format!(
                    "{} produced {} {} but declares {} {}",
                    self.primitive.name(),
                    t.dtype(),
                    t.shape(),
                    spec.dtype,
                    Shape::new(&spec.dims)
                )));
            }
        }
        Ok(())
    }

    /// Single-output nodes join the tape with rules that delegate to the
    /// primitive, so closed-form gradients drive ordinary `backward()`.
    fn attach_tape(&self, inputs: &[Tensor], primals: Vec<Tensor>, mut outputs: Vec<Tensor>) -> Vec<Tensor> {
        if outputs.len() != 1 {
            return outputs;
        }
        let out = outputs.remove(0);
        let saved = out.detach();
        let refs: Vec<&Tensor> = inputs.iter().collect();
        let primitive = self.primitive.clone();
        vec![record(out, &refs, move || {
            Box::new(PrimitiveBackward {
                primitive,
                primals,
                output: saved,
            })
        })]
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("op", &self.primitive.name())
            .field("stream", &self.stream())
            .field("n_inputs", &self.inputs.len())
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Tape rules of a realized primitive.
struct PrimitiveBackward {
    primitive: Primitive,
    primals: Vec<Tensor>,
    output: Tensor,
}

impl GradFn for PrimitiveBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let argnums: Vec<usize> = (0..self.primals.len()).collect();
        let grads = self.primitive.vjp(
            &self.primals,
            std::slice::from_ref(grad_output),
            &argnums,
            std::slice::from_ref(&self.output),
        )?;
        grads.iter().map(|g| g.eval().map(Some)).collect()
    }

    fn tangent(&self, input_tangents: &[Option<Tensor>]) -> Result<Option<Tensor>> {
        let (argnums, tangents): (Vec<usize>, Vec<Tensor>) = input_tangents
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.clone().map(|t| (i, t)))
            .unzip();
        let outs = self.primitive.jvp(&self.primals, &tangents, &argnums)?;
        match outs.first() {
            Some(t) => Ok(Some(t.eval()?)),
            None => Ok(None),
        }
    }

    fn name(&self) -> &str {
        self.primitive.name()
    }
}

// ============================================================================
// Array
// ============================================================================

/// A value flowing between operators: realized, or a pending node output.
#[derive(Clone)]
pub enum Array {
    Ready(Tensor),
    Pending { node: Arc<Node>, index: usize },
}

impl Array {
    pub fn dims(&self) -> &[usize] {
        match self {
            Array::Ready(t) => t.dims(),
            Array::Pending { node, index } => &node.outputs[*index].dims,
        }
    }

    pub fn ndim(&self) -> usize {
        self.dims().len()
    }

    pub fn dtype(&self) -> DType {
        match self {
            Array::Ready(t) => t.dtype(),
            Array::Pending { node, index } => node.outputs[*index].dtype,
        }
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.dims())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Array::Pending { .. })
    }

    pub fn node(&self) -> Option<&Arc<Node>> {
        match self {
            Array::Pending { node, .. } => Some(node),
            Array::Ready(_) => None,
        }
    }

    /// Realize this value.
    pub fn eval(&self) -> Result<Tensor> {
        match self {
            Array::Ready(t) => Ok(t.clone()),
            Array::Pending { node, index } => Ok(node.realize()?.swap_remove(*index)),
        }
    }

    /// Cast to `dtype`; pending values are realized first.
    pub fn astype(&self, dtype: DType) -> Result<Array> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        Ok(Array::Ready(self.eval()?.astype(dtype)?))
    }
}

impl From<Tensor> for Array {
    fn from(t: Tensor) -> Self {
        Array::Ready(t)
    }
}

impl From<&Tensor> for Array {
    fn from(t: &Tensor) -> Self {
        Array::Ready(t.clone())
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Array::Ready(t) => write!(f, "Array::Ready({} {})", t.dtype(), t.shape()),
            Array::Pending { node, index } => write!(
                f,
                "Array::Pending(node={}, op={}, index={index}, {} {})",
                node.id,
                node.primitive.name(),
                self.dtype(),
                self.shape()
            ),
        }
    }
}

/// Build a node and return one array per declared output.
pub fn make_arrays(primitive: Primitive, inputs: Vec<Array>, outputs: Vec<OutputSpec>) -> Vec<Array> {
    let n = outputs.len();
    let node = Node::new(primitive, inputs, outputs);
    (0..n)
        .map(|index| Array::Pending {
            node: Arc::clone(&node),
            index,
        })
        .collect()
}

/// Single-output [`make_arrays`].
pub fn make_array(primitive: Primitive, inputs: Vec<Array>, output: OutputSpec) -> Array {
    Array::Pending {
        node: Node::new(primitive, inputs, vec![output]),
        index: 0,
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Identity of a node input for cache lookups.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum InputId {
    /// `grad` is the tape node id, so a tracked leaf never merges with a
    /// detached view of the same storage.
    Tensor { storage: usize, dims: Vec<usize>, grad: Option<usize> },
    Output { node: usize, index: usize },
}

type CacheKey = (EquivalenceKey, Stream, Vec<InputId>);

/// Realizes arrays while merging equivalent nodes.
///
/// Two nodes merge when their primitives report the same equivalence key on
/// the same stream and their inputs are the same values. Only the first node
/// of each class is ever realized.
///
/// The cache keeps every canonical node, and with it the node's input graph,
/// alive until [`Scheduler::clear`] or drop.
#[derive(Default)]
pub struct Scheduler {
    cache: Mutex<HashMap<CacheKey, Arc<Node>>>,
    canonical: Mutex<HashMap<usize, Arc<Node>>>,
    hits: AtomicUsize,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eval(&self, array: &Array) -> Result<Tensor> {
        match array {
            Array::Ready(t) => Ok(t.clone()),
            Array::Pending { node, index } => {
                let node = self.canonicalize(node)?;
                Ok(node.realize_with(&|a: &Array| self.eval(a))?.swap_remove(*index))
            }
        }
    }

    pub fn eval_all(&self, arrays: &[Array]) -> Result<Vec<Tensor>> {
        arrays.iter().map(|a| self.eval(a)).collect()
    }

    /// Number of nodes answered by an earlier equivalent node.
    pub fn cache_hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Forget every cached node. Arrays already evaluated keep their values.
    pub fn clear(&self) {
        self.cache.lock().clear();
        self.canonical.lock().clear();
    }

    /// Number of distinct cached nodes.
    pub fn cached_nodes(&self) -> usize {
        self.cache.lock().len()
    }

    fn canonicalize(&self, node: &Arc<Node>) -> Result<Arc<Node>> {
        if let Some(c) = self.canonical.lock().get(&node.id) {
            return Ok(Arc::clone(c));
        }
        let Some(key) = node.primitive.equivalence_key() else {
            return Ok(Arc::clone(node));
        };
        let ids = node
            .inputs
            .iter()
            .map(|a| self.input_id(a))
            .collect::<Result<Vec<_>>>()?;

        let canon = {
            let mut cache = self.cache.lock();
            let entry = cache.entry((key, node.stream(), ids)).or_insert_with(|| Arc::clone(node));
            if entry.id != node.id {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(node = node.id, merged_into = entry.id, op = node.primitive.name(), "cache hit");
            }
            Arc::clone(entry)
        };
        self.canonical.lock().insert(node.id, Arc::clone(&canon));
        Ok(canon)
    }

    fn input_id(&self, a: &Array) -> Result<InputId> {
        Ok(match a {
            Array::Ready(t) => InputId::Tensor {
                storage: t.storage().ptr_id(),
                dims: t.dims().to_vec(),
                grad: t.grad_node().map(|g| g.id),
            },
            Array::Pending { node, index } => InputId::Output {
                node: self.canonicalize(node)?.id,
                index: *index,
            },
        })
    }
}

/// Wrap the only output of an eagerly run fallback.
pub(crate) fn single(outputs: Vec<Tensor>, op: &str) -> Result<Array> {
    outputs
        .into_iter()
        .next()
        .map(Array::Ready)
        .ok_or_else(|| FuseError::Kernel(format!("{op} produced no output")))
}
