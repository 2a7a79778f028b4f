//! Adam: first and second moment estimates with bias correction. The
//! step counter `t` is per-optimizer-instance and increments once per
//! `step` call, not once per parameter.

use std::collections::HashMap;

use crate::autograd::{Engine, NodeId};
use crate::error::GrowResult;

use super::{parallel_range, read_value_and_grad, write_value, Optimizer};

struct MomentState {
    m: Vec<f64>,
    s: Vec<f64>,
}

pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    step_count: u64,
    moments: HashMap<NodeId, MomentState>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Adam {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            step_count: 0,
            moments: HashMap::new(),
        }
    }

    pub fn with_params(
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        weight_decay: f64,
    ) -> Adam {
        Adam {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            step_count: 0,
            moments: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, engine: &mut Engine, params: &[NodeId]) -> GrowResult<()> {
        self.step_count += 1;
        let t = self.step_count;
        let lr = self.learning_rate;
        let (b1, b2, eps, decay) = (self.beta1, self.beta2, self.epsilon, self.weight_decay);
        let bias1 = 1.0 - b1.powi(t as i32);
        let bias2 = 1.0 - b2.powi(t as i32);

        for &id in params {
            let Some((value, grad)) = read_value_and_grad(engine, id) else {
                continue;
            };
            let n = value.len();
            let state = self
                .moments
                .entry(id)
                .or_insert_with(|| MomentState { m: vec![0.0; n], s: vec![0.0; n] });
            let m_ptr = state.m.as_mut_ptr() as usize;
            let s_ptr = state.s.as_mut_ptr() as usize;

            let mut new_value = vec![0.0; n];
            let new_ptr = new_value.as_mut_ptr() as usize;

            parallel_range(n, move |start, end| {
                let new_slice = unsafe { std::slice::from_raw_parts_mut(new_ptr as *mut f64, n) };
                let m_slice = unsafe { std::slice::from_raw_parts_mut(m_ptr as *mut f64, n) };
                let s_slice = unsafe { std::slice::from_raw_parts_mut(s_ptr as *mut f64, n) };
                for i in start..end {
                    let g_eff = grad[i] + decay * value[i];
                    m_slice[i] = b1 * m_slice[i] + (1.0 - b1) * g_eff;
                    s_slice[i] = b2 * s_slice[i] + (1.0 - b2) * g_eff * g_eff;
                    let m_hat = m_slice[i] / bias1;
                    let s_hat = s_slice[i] / bias2;
                    new_slice[i] = value[i] - lr * m_hat / (s_hat.sqrt() + eps);
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
    fn adam_descends_on_convex_quadratic() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let x = engine.require_grad(Array::from_f64(vec![10.0], vec![1]).unwrap());
        let mut opt = Adam::new(0.1);
        for _ in 0..200 {
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
        let mut opt = Adam::with_params(0.1, 0.9, 0.999, 1e-8, 0.5);
        opt.step(&mut engine, &[x]).unwrap();
        assert!(engine.value(x).as_scalar().unwrap().abs() < 5.0);
    }

    #[test]
    fn step_counter_increments_once_per_call_not_per_parameter() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let a = engine.require_grad(Array::from_f64(vec![1.0], vec![1]).unwrap());
        let b = engine.require_grad(Array::from_f64(vec![1.0], vec![1]).unwrap());
        engine.node_mut(a).grad = Some(Array::from_f64(vec![1.0], vec![1]).unwrap());
        engine.node_mut(b).grad = Some(Array::from_f64(vec![1.0], vec![1]).unwrap());
        let mut opt = Adam::new(0.1);
        opt.step(&mut engine, &[a, b]).unwrap();
        assert_eq!(opt.step_count, 1);
    }
}
