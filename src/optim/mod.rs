//! Parameter update rules consuming the gradients Autograd produced:
//! SGD, Momentum, RMSProp, Adam, all sharing one contract — `step`,
//! `zero_grad`, `set_learning_rate`, optional L2 weight decay folded
//! into the gradient before the update, and an internal `parallel_for`
//! split once a parameter is large enough to be worth it.

pub mod adam;
pub mod momentum;
pub mod rmsprop;
pub mod sgd;

pub use adam::Adam;
pub use momentum::Momentum;
pub use rmsprop::RmsProp;
pub use sgd::Sgd;

use crate::autograd::{Engine, NodeId};
use crate::error::GrowResult;
use crate::scheduler::parallel_for;

/// Below this many elements, splitting a parameter update across
/// `parallel_for` workers would spend more on dispatch than it saves.
pub const PARALLEL_THRESHOLD: usize = 1024;

/// Runs `body(start, end)` over `[0, n)`, letting `parallel_for`'s own
/// size check decide sequential vs. threaded.
pub(crate) fn parallel_range(n: usize, body: impl Fn(usize, usize) + Sync) {
    parallel_for(n, PARALLEL_THRESHOLD, body);
}

/// Shared update-rule contract every optimizer in this module
/// implements.
pub trait Optimizer {
    /// Applies one update to every parameter in `params` whose
    /// gradient is non-empty; parameters with no gradient yet are left
    /// untouched.
    fn step(&mut self, engine: &mut Engine, params: &[NodeId]) -> GrowResult<()>;

    /// Zeroes every listed parameter's gradient buffer.
    fn zero_grad(&self, engine: &mut Engine, params: &[NodeId]) {
        for &id in params {
            engine.node_mut(id).zero_grad();
        }
    }

    fn set_learning_rate(&mut self, lr: f64);
}

/// Copies `value`/`grad` out to flat `f64` vectors, so every
/// optimizer's per-element math is dtype-agnostic; callers narrow back
/// with [`crate::array::Array::set_f64`].
pub(crate) fn read_value_and_grad(engine: &Engine, id: NodeId) -> Option<(Vec<f64>, Vec<f64>)> {
    let node = engine.node(id);
    let grad = node.grad.as_ref()?;
    Some((node.value.to_vec_f64(), grad.to_vec_f64()))
}

pub(crate) fn write_value(engine: &mut Engine, id: NodeId, values: &[f64]) {
    let node = engine.node_mut(id);
    for (i, &v) in values.iter().enumerate() {
        node.value.set_f64(i, v);
    }
}
