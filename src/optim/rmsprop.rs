//! `s <- alpha*s + (1-alpha)*g_eff^2; v <- v - lr*g_eff / (sqrt(s) + eps)`.

use std::collections::HashMap;

use crate::autograd::{Engine, NodeId};
use crate::error::GrowResult;

use super::{parallel_range, read_value_and_grad, write_value, Optimizer};

pub struct RmsProp {
    pub learning_rate: f64,
    pub alpha: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    squared_grad: HashMap<NodeId, Vec<f64>>,
}

impl RmsProp {
    pub fn new(learning_rate: f64) -> RmsProp {
        RmsProp {
            learning_rate,
            alpha: 0.99,
            epsilon: 1e-8,
            weight_decay: 0.0,
            squared_grad: HashMap::new(),
        }
    }

    pub fn with_params(learning_rate: f64, alpha: f64, epsilon: f64, weight_decay: f64) -> RmsProp {
        RmsProp { learning_rate, alpha, epsilon, weight_decay, squared_grad: HashMap::new() }
    }
}

impl Optimizer for RmsProp {
    fn step(&mut self, engine: &mut Engine, params: &[NodeId]) -> GrowResult<()> {
        let lr = self.learning_rate;
        let alpha = self.alpha;
        let eps = self.epsilon;
        let decay = self.weight_decay;
        for &id in params {
            let Some((value, grad)) = read_value_and_grad(engine, id) else {
                continue;
            };
            let n = value.len();
            let s = self.squared_grad.entry(id).or_insert_with(|| vec![0.0; n]);
            let s_ptr = s.as_mut_ptr() as usize;

            let mut new_value = vec![0.0; n];
            let new_ptr = new_value.as_mut_ptr() as usize;

            parallel_range(n, move |start, end| {
                let new_slice = unsafe { std::slice::from_raw_parts_mut(new_ptr as *mut f64, n) };
                let s_slice = unsafe { std::slice::from_raw_parts_mut(s_ptr as *mut f64, n) };
                for i in start..end {
                    let g_eff = grad[i] + decay * value[i];
                    s_slice[i] = alpha * s_slice[i] + (1.0 - alpha) * g_eff * g_eff;
                    new_slice[i] = value[i] - lr * g_eff / (s_slice[i].sqrt() + eps);
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
    fn rmsprop_descends_on_convex_quadratic() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let x = engine.require_grad(Array::from_f64(vec![10.0], vec![1]).unwrap());
        let mut opt = RmsProp::new(0.1);
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
        let mut opt = RmsProp::with_params(0.1, 0.99, 1e-8, 0.5);
        opt.step(&mut engine, &[x]).unwrap();
        assert!(engine.value(x).as_scalar().unwrap().abs() < 5.0);
    }
}
