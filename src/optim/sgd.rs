//! Plain gradient descent: `v <- v - lr * g_eff`, no optimizer state.

use crate::autograd::{Engine, NodeId};
use crate::error::GrowResult;

use super::{parallel_range, read_value_and_grad, write_value, Optimizer};

pub struct Sgd {
    pub learning_rate: f64,
    pub weight_decay: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Sgd {
        Sgd { learning_rate, weight_decay: 0.0 }
    }

    pub fn with_weight_decay(learning_rate: f64, weight_decay: f64) -> Sgd {
        Sgd { learning_rate, weight_decay }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, engine: &mut Engine, params: &[NodeId]) -> GrowResult<()> {
        let lr = self.learning_rate;
        let decay = self.weight_decay;
        for &id in params {
            let Some((value, grad)) = read_value_and_grad(engine, id) else {
                continue;
            };
            let n = value.len();
            let mut updated = vec![0.0; n];
            let ptr = updated.as_mut_ptr() as usize;
            parallel_range(n, move |start, end| {
                let out = unsafe { std::slice::from_raw_parts_mut(ptr as *mut f64, n) };
                for i in start..end {
                    let g_eff = grad[i] + decay * value[i];
                    out[i] = value[i] - lr * g_eff;
                }
            });
            write_value(engine, id, &updated);
        }
        Ok(())
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}
