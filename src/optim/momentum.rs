//! Classical momentum: `u <- mu*u + lr*g_eff; v <- v - u`.

use std::collections::HashMap;

use crate::autograd::{Engine, NodeId};
use crate::error::GrowResult;

use super::{parallel_range, read_value_and_grad, write_value, Optimizer};

pub struct Momentum {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    velocity: HashMap<NodeId, Vec<f64>>,
}

impl Momentum {
    pub fn new(learning_rate: f64, momentum: f64) -> Momentum {
        Momentum { learning_rate, momentum, weight_decay: 0.0, velocity: HashMap::new() }
    }

    pub fn with_weight_decay(learning_rate: f64, momentum: f64, weight_decay: f64) -> Momentum {
        Momentum { learning_rate, momentum, weight_decay, velocity: HashMap::new() }
    }
}

impl Optimizer for Momentum {
    fn step(&mut self, engine: &mut Engine, params: &[NodeId]) -> GrowResult<()> {
        let lr = self.learning_rate;
        let mu = self.momentum;
        let decay = self.weight_decay;
        for &id in params {
            let Some((value, grad)) = read_value_and_grad(engine, id) else {
                continue;
            };
            let n = value.len();
            let velocity = self.velocity.entry(id).or_insert_with(|| vec![0.0; n]);
            let vel_ptr = velocity.as_mut_ptr() as usize;

            let mut new_value = vec![0.0; n];
            let new_ptr = new_value.as_mut_ptr() as usize;

            parallel_range(n, move |start, end| {
                let new_slice = unsafe { std::slice::from_raw_parts_mut(new_ptr as *mut f64, n) };
                let vel_slice = unsafe { std::slice::from_raw_parts_mut(vel_ptr as *mut f64, n) };
                for i in start..end {
                    let g_eff = grad[i] + decay * value[i];
                    vel_slice[i] = mu * vel_slice[i] + lr * g_eff;
                    new_slice[i] = value[i] - vel_slice[i];
                }
            });

            write_value(engine, id, &new_value);
        }
        Ok(())
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Array;
    use crate::autograd::{ops, Engine};
    use crate::dtype::{set_default_dtype, DType};

    #[test]
    fn momentum_descends_on_convex_quadratic() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let x = engine.require_grad(Array::from_f64(vec![10.0], vec![1]).unwrap());
        let mut opt = Momentum::new(0.01, 0.9);
        for _ in 0..100 {
            let y = ops::mul(&mut engine, x, x).unwrap();
            let loss = ops::sum(&mut engine, y).unwrap();
            engine.backward(loss).unwrap();
            opt.step(&mut engine, &[x]).unwrap();
            opt.zero_grad(&mut engine, &[x]);
        }
        assert!(engine.value(x).as_scalar().unwrap().abs() < 0.1);
    }

    #[test]
    fn weight_decay_shrinks_zero_gradient_parameter() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let x = engine.require_grad(Array::from_f64(vec![5.0], vec![1]).unwrap());
        engine.node_mut(x).grad = Some(Array::from_f64(vec![0.0], vec![1]).unwrap());
        let mut opt = Momentum::with_weight_decay(0.1, 0.9, 0.5);
        opt.step(&mut engine, &[x]).unwrap();
        assert!(engine.value(x).as_scalar().unwrap().abs() < 5.0);
    }
}
