//! The reverse-mode automatic differentiation engine.
//!
//! The graph lives in an arena: an `Engine` owns a `Vec<Node>` in
//! creation order, and every `NodeId` is just an index into it. This
//! sidesteps `Rc<RefCell<_>>` graphs entirely — parents are plain
//! `usize` indices, the arena frees the whole graph in one drop, and
//! there is no interior mutability to reason about for the forward
//! pass. `Operation` is a sealed enum, one variant per differentiable
//! op, each carrying only the saved tensors its backward rule needs —
//! exhaustive compile-time coverage with no vtable dispatch.

pub mod grad_check;
pub mod losses;
pub mod ops;

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::array::Array;
use crate::array::ops as array_ops;
use crate::error::{GrowError, GrowResult};
use crate::kernels::matmul;

/// An index into an [`Engine`]'s node arena. Stable for the lifetime
/// of the engine that produced it; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// The saved state each differentiable op's backward rule needs.
/// Exhaustive by construction: adding an op means adding a variant and
/// a `backward` match arm, not a new trait object.
#[derive(Debug)]
pub enum Operation {
    Add { lhs: NodeId, rhs: NodeId },
    Sub { lhs: NodeId, rhs: NodeId },
    Mul { lhs: NodeId, rhs: NodeId, lhs_value: Array, rhs_value: Array },
    MatMul { lhs: NodeId, rhs: NodeId, lhs_value: Array, rhs_value: Array },
    Transpose { input: NodeId },
    Sum { input: NodeId, input_shape: Vec<usize> },
    Exp { input: NodeId, output: Array },
    Log { input: NodeId, input_value: Array },
    Reshape { input: NodeId, input_shape: Vec<usize> },
    Relu { input: NodeId, input_value: Array },
    Sigmoid { input: NodeId, output: Array },
    Tanh { input: NodeId, output: Array },
    Mse { pred: NodeId, diff: Array },
    SoftmaxCe { logits: NodeId, softmax: Array, onehot: Array, batch: usize },
    Hinge { pred: NodeId, target: Array, margin_positive: Array, n: usize },
}

/// One vertex of the computation DAG: the value it computed, its
/// (lazily allocated) gradient, and the operation that produced it.
/// `parents` is redundant with `operation`'s own fields but kept
/// explicit so the backward traversal never needs to match on
/// `Operation` just to find the DAG edges.
pub struct Node {
    pub value: Array,
    pub grad: Option<Array>,
    pub parents: Vec<NodeId>,
    pub operation: Option<Operation>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.parents.is_empty()
    }

    /// Resets `grad` to zeros matching `value`'s shape. A no-op for a
    /// node with no gradient buffer yet (nothing to zero).
    pub fn zero_grad(&mut self) {
        if let Some(grad) = &mut self.grad {
            *grad = self.value.zero_grad_like();
        }
    }

    fn ensure_grad(&mut self) -> &mut Array {
        if self.grad.is_none() {
            self.grad = Some(self.value.zero_grad_like());
        }
        self.grad.as_mut().unwrap()
    }
}

static NO_GRAD_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// True while inside a `no_grad` scope. The counter is process-global,
/// not thread-local — see DESIGN.md for why.
pub fn is_no_grad() -> bool {
    NO_GRAD_DEPTH.load(Ordering::SeqCst) > 0
}

/// RAII guard returned by [`no_grad`]; decrements the nesting counter
/// on drop so an early return or `?` inside the scope still exits it.
pub struct NoGradGuard {
    _private: (),
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        NO_GRAD_DEPTH.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Enters a `no_grad` scope: every op performed while the returned
/// guard is alive skips parent recording, operation recording, and
/// gradient allocation. Scopes nest; the counter only reaches zero
/// again once every guard it produced has been dropped.
pub fn no_grad() -> NoGradGuard {
    NO_GRAD_DEPTH.fetch_add(1, Ordering::SeqCst);
    NoGradGuard { _private: () }
}

/// Owns the node arena for one computation graph. Not `Sync`: a graph
/// must be built and backward-traversed by a single thread. Reusable
/// across multiple `backward` calls — `backward` reads the graph and
/// writes into gradient buffers but never tears down the arena, so
/// layering another forward pass followed by another `backward` on
/// the same engine is supported (see DESIGN.md for the reasoning).
pub struct Engine {
    nodes: Vec<Node>,
}

impl Engine {
    pub fn new() -> Engine {
        Engine { nodes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn value(&self, id: NodeId) -> &Array {
        &self.nodes[id.0].value
    }

    /// Creates a leaf Node wrapping `value`, participating in autograd
    /// (unless `no_grad` is active, in which case it is still a leaf
    /// but carries no gradient buffer until first written).
    pub fn require_grad(&mut self, value: Array) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            value,
            grad: None,
            parents: Vec::new(),
            operation: None,
        });
        id
    }

    /// Pushes a non-differentiable constant leaf: same as
    /// `require_grad` but documents intent at call sites that never
    /// expect a gradient to land here.
    pub fn constant(&mut self, value: Array) -> NodeId {
        self.require_grad(value)
    }

    /// Records a new node. When `no_grad` is active, `parents` and
    /// `operation` are discarded: the node is created as an
    /// unconnected leaf with no gradient buffer allocated.
    pub(crate) fn push(&mut self, value: Array, parents: Vec<NodeId>, operation: Operation) -> NodeId {
        let id = NodeId(self.nodes.len());
        if is_no_grad() {
            self.nodes.push(Node {
                value,
                grad: None,
                parents: Vec::new(),
                operation: None,
            });
        } else {
            self.nodes.push(Node {
                value,
                grad: None,
                parents,
                operation: Some(operation),
            });
        }
        id
    }

    fn accumulate(&mut self, id: NodeId, contribution: Array) -> GrowResult<()> {
        let node = &mut self.nodes[id.0];
        let grad = node.ensure_grad();
        array_ops::add_in_place(grad, &contribution)
    }

    /// Seeds `root.grad` with ones, walks the DAG in post-order from
    /// `root`, then replays that order in reverse, invoking each
    /// visited node's operation backward rule. `root.value` must be a
    /// one-element array.
    pub fn backward(&mut self, root: NodeId) -> GrowResult<()> {
        if self.nodes[root.0].value.len() != 1 {
            return Err(GrowError::shape(
                "backward requires a scalar root",
                self.nodes[root.0].value.shape(),
                &[1],
            ));
        }

        let order = self.post_order(root);

        {
            let root_node = &mut self.nodes[root.0];
            root_node.grad = Some(Array::ones(root_node.value.shape())?);
        }

        for id in order.into_iter().rev() {
            self.backward_one(id)?;
        }
        Ok(())
    }

    fn post_order(&self, root: NodeId) -> Vec<NodeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
        visited[root.0] = true;

        while let Some((id, next_parent)) = stack.pop() {
            let parents = &self.nodes[id.0].parents;
            if next_parent < parents.len() {
                stack.push((id, next_parent + 1));
                let parent = parents[next_parent];
                if !visited[parent.0] {
                    visited[parent.0] = true;
                    stack.push((parent, 0));
                }
            } else {
                order.push(id);
            }
        }
        order
    }

    fn backward_one(&mut self, id: NodeId) -> GrowResult<()> {
        let grad = match &self.nodes[id.0].grad {
            Some(g) => g.clone(),
            None => return Ok(()),
        };
        let operation = match self.nodes[id.0].operation.take() {
            Some(op) => op,
            None => return Ok(()),
        };

        let result = self.apply_backward(&operation, &grad);
        self.nodes[id.0].operation = Some(operation);
        result
    }

    fn apply_backward(&mut self, operation: &Operation, grad: &Array) -> GrowResult<()> {
        match operation {
            Operation::Add { lhs, rhs } => {
                self.accumulate(*lhs, grad.clone())?;
                self.accumulate(*rhs, grad.clone())?;
            }
            Operation::Sub { lhs, rhs } => {
                self.accumulate(*lhs, grad.clone())?;
                let neg = array_ops::apply_f64_or_f32(grad, |x| -x)?;
                self.accumulate(*rhs, neg)?;
            }
            Operation::Mul { lhs, rhs, lhs_value, rhs_value } => {
                let d_lhs = array_ops::mul(rhs_value, grad)?;
                let d_rhs = array_ops::mul(lhs_value, grad)?;
                self.accumulate(*lhs, d_lhs)?;
                self.accumulate(*rhs, d_rhs)?;
            }
            Operation::MatMul { lhs, rhs, lhs_value, rhs_value } => {
                let rhs_t = array_ops::transpose(rhs_value)?;
                let d_lhs = matmul::matmul(grad, &rhs_t)?;
                let lhs_t = array_ops::transpose(lhs_value)?;
                let d_rhs = matmul::matmul(&lhs_t, grad)?;
                self.accumulate(*lhs, d_lhs)?;
                self.accumulate(*rhs, d_rhs)?;
            }
            Operation::Transpose { input } => {
                let grad_t = array_ops::transpose(grad)?;
                self.accumulate(*input, grad_t)?;
            }
            Operation::Sum { input, input_shape } => {
                let broadcast = broadcast_scalar(grad, input_shape)?;
                self.accumulate(*input, broadcast)?;
            }
            Operation::Exp { input, output } => {
                let d = array_ops::mul(output, grad)?;
                self.accumulate(*input, d)?;
            }
            Operation::Log { input, input_value } => {
                let reciprocal = array_ops::apply_f64_or_f32(input_value, |x| 1.0 / x)?;
                let d = array_ops::mul(&reciprocal, grad)?;
                self.accumulate(*input, d)?;
            }
            Operation::Reshape { input, input_shape } => {
                let reshaped = grad.reshape(input_shape)?;
                self.accumulate(*input, reshaped)?;
            }
            Operation::Relu { input, input_value } => {
                let mask = array_ops::apply_f64_or_f32(input_value, |x| if x > 0.0 { 1.0 } else { 0.0 })?;
                let d = array_ops::mul(&mask, grad)?;
                self.accumulate(*input, d)?;
            }
            Operation::Sigmoid { input, output } => {
                let one_minus = array_ops::apply_f64_or_f32(output, |y| 1.0 - y)?;
                let d = array_ops::mul(output, &one_minus)?;
                let d = array_ops::mul(&d, grad)?;
                self.accumulate(*input, d)?;
            }
            Operation::Tanh { input, output } => {
                let one_minus_sq = array_ops::apply_f64_or_f32(output, |y| 1.0 - y * y)?;
                let d = array_ops::mul(&one_minus_sq, grad)?;
                self.accumulate(*input, d)?;
            }
            Operation::Mse { pred, diff } => {
                let n = diff.len() as f64;
                let g0 = grad.as_scalar()?;
                let scale = (2.0 / n) * g0;
                let d = array_ops::apply_f64_or_f32(diff, move |x| x * scale)?;
                self.accumulate(*pred, d)?;
            }
            Operation::SoftmaxCe { logits, softmax, onehot, batch } => {
                let g0 = grad.as_scalar()?;
                let scale = g0 / (*batch as f64);
                let diff = array_ops::sub(softmax, onehot)?;
                let d = array_ops::apply_f64_or_f32(&diff, move |x| x * scale)?;
                self.accumulate(*logits, d)?;
            }
            Operation::Hinge { pred, target, margin_positive, n } => {
                let g0 = grad.as_scalar()?;
                let scale = -g0 / (*n as f64);
                let masked = array_ops::mul(margin_positive, target)?;
                let d = array_ops::apply_f64_or_f32(&masked, move |x| x * scale)?;
                self.accumulate(*pred, d)?;
            }
        }
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Engine {
        Engine::new()
    }
}

/// Broadcasts a one-element gradient back to `shape` (the backward
/// rule for `sum`). Every element of the result equals the scalar.
fn broadcast_scalar(grad: &Array, shape: &[usize]) -> GrowResult<Array> {
    let scalar = grad.as_scalar()?;
    let n: usize = shape.iter().product();
    match grad.dtype() {
        crate::dtype::DType::F32 => Array::from_f32(vec![scalar as f32; n], shape.to_vec()),
        crate::dtype::DType::F64 => Array::from_f64(vec![scalar; n], shape.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{set_default_dtype, DType};

    #[test]
    fn shared_parent_gradients_accumulate_linearly() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let a = engine.require_grad(Array::from_f64(vec![1.0, 2.0, 3.0], vec![3]).unwrap());
        let b = engine.require_grad(Array::from_f64(vec![4.0, 5.0, 6.0], vec![3]).unwrap());
        let prod = ops::mul(&mut engine, a, b).unwrap();
        let y = ops::sum(&mut engine, prod).unwrap();
        engine.backward(y).unwrap();
        assert_eq!(engine.node(a).grad.as_ref().unwrap().to_vec_f64(), vec![4.0, 5.0, 6.0]);
        assert_eq!(engine.node(b).grad.as_ref().unwrap().to_vec_f64(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn no_grad_neutrality() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let a = engine.require_grad(Array::from_f64(vec![1.0, 2.0], vec![2]).unwrap());
        let b = engine.require_grad(Array::from_f64(vec![3.0, 4.0], vec![2]).unwrap());
        let guard = no_grad();
        let sum_node = ops::add(&mut engine, a, b).unwrap();
        drop(guard);
        let node = engine.node(sum_node);
        assert!(node.is_leaf());
        assert!(node.grad.is_none());
    }

    #[test]
    fn accumulates_into_shared_parent() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let x = engine.require_grad(Array::from_f64(vec![2.0], vec![1]).unwrap());
        let y1 = ops::mul(&mut engine, x, x).unwrap();
        let y2 = ops::add(&mut engine, y1, x).unwrap();
        engine.backward(y2).unwrap();
        // d/dx (x*x + x) = 2x + 1 = 5
        assert_eq!(engine.node(x).grad.as_ref().unwrap().to_vec_f64(), vec![5.0]);
    }
}
