//! Core autograd types for automatic differentiation.
//!
//! Defines the `GradFn` trait and `GradNode` tape node. These live in
//! fuse-core so that `Tensor` can carry gradient tracking without circular
//! dependencies. Each node knows both its reverse rule (`apply`) and its
//! forward rule (`tangent`), so the same tape drives vjp and jvp.

pub mod backward_fns;

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::tensor::Tensor;
use crate::Result;

// ============================================================================
// GradFn trait
// ============================================================================

/// Differentiation rules of one recorded operation.
pub trait GradFn: Send + Sync {
    /// Reverse mode: gradients for each input given the output gradient.
    /// `None` means the input receives no gradient.
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>>;

    /// Forward mode: output tangent given one tangent slot per input
    /// (`None` is a zero tangent). Returns `None` for a zero output tangent.
    fn tangent(&self, input_tangents: &[Option<Tensor>]) -> Result<Option<Tensor>>;

    /// Name of this gradient function (for debugging).
    fn name(&self) -> &str;
}

// ============================================================================
// GradNode
// ============================================================================

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A node in the autograd tape.
///
/// Inputs are held strongly: a node keeps the subgraph it was computed from
/// alive for as long as its output tensor lives. Saved tensors inside a
/// `GradFn` never carry the node that owns them, so there are no cycles.
pub struct GradNode {
    pub id: usize,
    pub grad_fn: Option<Box<dyn GradFn>>,
    /// One slot per operand; `None` for operands that do not track gradients.
    pub inputs: Vec<Option<Arc<GradNode>>>,
    pub grad: RwLock<Option<Tensor>>,
}

impl GradNode {
    /// Create a new leaf node (no grad_fn, e.g., a parameter).
    pub fn leaf() -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            grad_fn: None,
            inputs: Vec::new(),
            grad: RwLock::new(None),
        })
    }

    /// Create a new interior node with a gradient function and inputs.
    pub fn with_grad_fn(grad_fn: Box<dyn GradFn>, inputs: Vec<Option<Arc<GradNode>>>) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            grad_fn: Some(grad_fn),
            inputs,
            grad: RwLock::new(None),
        })
    }

    /// Whether this is a leaf node (no grad_fn).
    pub fn is_leaf(&self) -> bool {
        self.grad_fn.is_none()
    }

    /// Accumulate gradient into this node (thread-safe).
    pub fn accumulate_grad(&self, grad: &Tensor) -> Result<()> {
        let mut lock = self.grad.write();
        let next = match lock.as_ref() {
            Some(existing) => existing.add(grad)?,
            None => grad.clone(),
        };
        *lock = Some(next);
        Ok(())
    }

    /// Get the current accumulated gradient.
    pub fn get_grad(&self) -> Option<Tensor> {
        self.grad.read().clone()
    }

    /// Clear the accumulated gradient.
    pub fn zero_grad(&self) {
        *self.grad.write() = None;
    }
}

/// Attach a tape node to `output` when grad mode is on and any operand tracks
/// gradients. `grad_fn` is only built when a node is actually recorded.
pub fn record<F>(output: Tensor, inputs: &[&Tensor], grad_fn: F) -> Tensor
where
    F: FnOnce() -> Box<dyn GradFn>,
{
    if !is_grad_enabled() || !inputs.iter().any(|t| t.tracks_grad()) {
        return output;
    }
    let nodes = inputs.iter().map(|t| t.grad_node().cloned()).collect();
    output.with_grad_node(GradNode::with_grad_fn(grad_fn(), nodes))
}

// ============================================================================
// Traversal
// ============================================================================

/// Kahn ordering of everything reachable from `roots`: every node appears
/// before all of its inputs.
pub fn topological_order(roots: &[Arc<GradNode>]) -> Vec<Arc<GradNode>> {
    let mut nodes: HashMap<usize, Arc<GradNode>> = HashMap::new();
    let mut consumers: HashMap<usize, usize> = HashMap::new();
    let mut stack = Vec::new();
    for root in roots {
        if nodes.insert(root.id, Arc::clone(root)).is_none() {
            stack.push(Arc::clone(root));
        }
    }
    while let Some(node) = stack.pop() {
        for input in node.inputs.iter().flatten() {
            *consumers.entry(input.id).or_insert(0) += 1;
            if nodes.insert(input.id, Arc::clone(input)).is_none() {
                stack.push(Arc::clone(input));
            }
        }
    }

    let mut ready: VecDeque<Arc<GradNode>> = roots
        .iter()
        .filter(|n| !consumers.contains_key(&n.id))
        .cloned()
        .collect();
    let mut seen_ready: std::collections::HashSet<usize> = ready.iter().map(|n| n.id).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(node) = ready.pop_front() {
        for input in node.inputs.iter().flatten() {
            if let Some(count) = consumers.get_mut(&input.id) {
                *count -= 1;
                if *count == 0 && seen_ready.insert(input.id) {
                    ready.push_back(Arc::clone(input));
                }
            }
        }
        order.push(node);
    }
    order
}

// ============================================================================
// Backward pass
// ============================================================================

/// Execute the backward pass from a root node.
pub fn backward(root: &Arc<GradNode>, grad_output: Tensor) -> Result<()> {
    backward_many(&[(Arc::clone(root), grad_output)])
}

/// Reverse sweep seeded at several roots at once.
///
/// Each node's rule runs exactly once, after every consumer has contributed
/// to its gradient. Rules run with recording disabled.
pub fn backward_many(roots: &[(Arc<GradNode>, Tensor)]) -> Result<()> {
    let _guard = NoGradGuard::new();
    for (node, grad) in roots {
        node.accumulate_grad(grad)?;
    }
    let root_nodes: Vec<Arc<GradNode>> = roots.iter().map(|(n, _)| Arc::clone(n)).collect();

    let order = topological_order(&root_nodes);
    tracing::trace!(roots = roots.len(), nodes = order.len(), "backward");

    for node in order {
        let Some(grad_fn) = node.grad_fn.as_ref() else {
            continue;
        };
        let Some(node_grad) = node.get_grad() else {
            continue;
        };
        tracing::trace!(node = node.id, rule = grad_fn.name(), "apply");
        let input_grads = grad_fn.apply(&node_grad)?;
        for (input, grad) in node.inputs.iter().zip(input_grads) {
            if let (Some(input), Some(grad)) = (input, grad) {
                input.accumulate_grad(&grad)?;
            }
        }
    }
    Ok(())
}

/// Forward sweep: push `seeds` (tangents keyed by node id) through the tape
/// toward `outputs`, returning each output's tangent (`None` when zero).
pub fn forward_tangents(
    outputs: &[Arc<GradNode>],
    seeds: &HashMap<usize, Tensor>,
) -> Result<Vec<Option<Tensor>>> {
    let _guard = NoGradGuard::new();
    let mut tangents: HashMap<usize, Option<Tensor>> = HashMap::new();

    for node in topological_order(outputs).into_iter().rev() {
        let tangent = if let Some(seed) = seeds.get(&node.id) {
            Some(seed.clone())
        } else if let Some(grad_fn) = node.grad_fn.as_ref() {
            let inputs: Vec<Option<Tensor>> = node
                .inputs
                .iter()
                .map(|i| i.as_ref().and_then(|n| tangents.get(&n.id).cloned().flatten()))
                .collect();
            if inputs.iter().all(Option::is_none) {
                None
            } else {
                grad_fn.tangent(&inputs)?
            }
        } else {
            None
        };
        tangents.insert(node.id, tangent);
    }

    Ok(outputs
        .iter()
        .map(|n| tangents.get(&n.id).cloned().flatten())
        .collect())
}

// ============================================================================
// Grad-mode scopes
// ============================================================================

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Check if gradient recording is currently enabled.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

fn set_grad_enabled(enabled: bool) -> bool {
    GRAD_ENABLED.with(|g| {
        let prev = g.get();
        g.set(enabled);
        prev
    })
}

/// RAII guard that disables gradient recording in its scope.
///
/// # Example
/// ```ignore
/// let _guard = NoGradGuard::new();
/// // All operations here skip gradient tracking
/// ```
pub struct NoGradGuard {
    prev: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        Self {
            prev: set_grad_enabled(false),
        }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}

/// RAII guard that re-enables recording, e.g. to replay a function under a
/// transform while a backward sweep is running.
pub struct EnableGradGuard {
    prev: bool,
}

impl EnableGradGuard {
    pub fn new() -> Self {
        Self {
            prev: set_grad_enabled(true),
        }
    }
}

impl Default for EnableGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EnableGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;

    fn leaf(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_f32(data, shape).to_leaf()
    }

    #[test]
    fn test_leaf_node() {
        let node = GradNode::leaf();
        assert!(node.is_leaf());
        assert!(node.get_grad().is_none());
    }

    #[test]
    fn test_accumulate_grad() {
        let node = GradNode::leaf();
        node.accumulate_grad(&Tensor::from_f32(&[1.0, 2.0], &[2])).unwrap();
        node.accumulate_grad(&Tensor::from_f32(&[3.0, 4.0], &[2])).unwrap();
        assert_eq!(node.get_grad().unwrap().to_vec_f32(), vec![4.0, 6.0]);
        node.zero_grad();
        assert!(node.get_grad().is_none());
    }

    #[test]
    fn test_mul_add_backward() {
        let x = leaf(&[2.0, 3.0], &[2]);
        let y = leaf(&[4.0, 5.0], &[2]);
        // z = sum(x * y + x)
        let z = x.mul(&y).unwrap().add(&x).unwrap().sum().unwrap();
        z.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec_f32(), vec![5.0, 6.0]);
        assert_eq!(y.grad().unwrap().to_vec_f32(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_diamond_graph_runs_each_rule_once() {
        let x = leaf(&[3.0], &[1]);
        let a = x.mul_scalar(2.0).unwrap();
        let b = a.mul(&a).unwrap();
        let c = b.add(&a).unwrap().sum().unwrap();
        c.backward().unwrap();
        // c = 4x^2 + 2x -> dc/dx = 8x + 2
        assert_eq!(x.grad().unwrap().to_vec_f32(), vec![26.0]);
    }

    #[test]
    fn test_broadcast_grad_reduces() {
        let x = leaf(&[1.0, 2.0, 3.0], &[3]);
        let y = leaf(&[1.0, 1.0, 1.0, 2.0, 2.0, 2.0], &[2, 3]);
        x.mul(&y).unwrap().sum().unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec_f32(), vec![3.0, 3.0, 3.0]);
        assert_eq!(x.grad().unwrap().dims(), &[3]);
    }

    #[test]
    fn test_no_grad_guard() {
        let x = leaf(&[1.0], &[1]);
        {
            let _g = NoGradGuard::new();
            assert!(!is_grad_enabled());
            assert!(!x.mul_scalar(2.0).unwrap().tracks_grad());
            let _e = EnableGradGuard::new();
            assert!(x.mul_scalar(2.0).unwrap().tracks_grad());
        }
        assert!(is_grad_enabled());
    }

    #[test]
    fn test_forward_tangents() {
        let x = leaf(&[2.0], &[1]);
        let y = x.square().unwrap().sin().unwrap();
        let seeds: HashMap<usize, Tensor> =
            [(x.grad_node().unwrap().id, Tensor::ones(&[1], DType::F32))].into();
        let t = forward_tangents(&[y.grad_node().unwrap().clone()], &seeds).unwrap();
        let expected = (4.0f64).cos() * 4.0;
        assert!((t[0].as_ref().unwrap().item().unwrap() - expected).abs() < 1e-5);
    }

    #[test]
    fn test_backward_requires_tracking() {
        let t = Tensor::from_f32(&[1.0], &[1]);
        assert!(t.backward().is_err());
    }
}
