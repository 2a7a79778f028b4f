//! Differentiable operations: each computes its forward value via the
//! array/kernel layer, then records a [`Operation`] variant carrying
//! exactly what its backward rule needs.

use crate::array::ops as array_ops;
use crate::error::GrowResult;
use crate::kernels::matmul;

use super::{Engine, NodeId, Operation};

pub fn add(engine: &mut Engine, lhs: NodeId, rhs: NodeId) -> GrowResult<NodeId> {
    let value = array_ops::add(engine.value(lhs), engine.value(rhs))?;
    Ok(engine.push(value, vec![lhs, rhs], Operation::Add { lhs, rhs }))
}

pub fn sub(engine: &mut Engine, lhs: NodeId, rhs: NodeId) -> GrowResult<NodeId> {
    let value = array_ops::sub(engine.value(lhs), engine.value(rhs))?;
    Ok(engine.push(value, vec![lhs, rhs], Operation::Sub { lhs, rhs }))
}

pub fn mul(engine: &mut Engine, lhs: NodeId, rhs: NodeId) -> GrowResult<NodeId> {
    let lhs_value = engine.value(lhs).clone();
    let rhs_value = engine.value(rhs).clone();
    let value = array_ops::mul(&lhs_value, &rhs_value)?;
    Ok(engine.push(
        value,
        vec![lhs, rhs],
        Operation::Mul { lhs, rhs, lhs_value, rhs_value },
    ))
}

pub fn matmul_op(engine: &mut Engine, lhs: NodeId, rhs: NodeId) -> GrowResult<NodeId> {
    let lhs_value = engine.value(lhs).clone();
    let rhs_value = engine.value(rhs).clone();
    let value = matmul::matmul(&lhs_value, &rhs_value)?;
    Ok(engine.push(
        value,
        vec![lhs, rhs],
        Operation::MatMul { lhs, rhs, lhs_value, rhs_value },
    ))
}

pub fn transpose(engine: &mut Engine, input: NodeId) -> GrowResult<NodeId> {
    let value = array_ops::transpose(engine.value(input))?;
    Ok(engine.push(value, vec![input], Operation::Transpose { input }))
}

pub fn sum(engine: &mut Engine, input: NodeId) -> GrowResult<NodeId> {
    let input_shape = engine.value(input).shape().to_vec();
    let value = array_ops::sum(engine.value(input))?;
    Ok(engine.push(value, vec![input], Operation::Sum { input, input_shape }))
}

pub fn exp(engine: &mut Engine, input: NodeId) -> GrowResult<NodeId> {
    let value = array_ops::exp(engine.value(input))?;
    let output = value.clone();
    Ok(engine.push(value, vec![input], Operation::Exp { input, output }))
}

/// Unchecked `ln`; its backward rule is `(1/x)·g`, which is only
/// finite for positive `x`. Callers that cannot guarantee positivity
/// should validate first (see `array::ops::log_checked`).
pub fn log(engine: &mut Engine, input: NodeId) -> GrowResult<NodeId> {
    let input_value = engine.value(input).clone();
    let value = array_ops::log(&input_value)?;
    Ok(engine.push(value, vec![input], Operation::Log { input, input_value }))
}

pub fn reshape(engine: &mut Engine, input: NodeId, shape: &[usize]) -> GrowResult<NodeId> {
    let input_shape = engine.value(input).shape().to_vec();
    let value = engine.value(input).reshape(shape)?;
    Ok(engine.push(value, vec![input], Operation::Reshape { input, input_shape }))
}

pub fn relu(engine: &mut Engine, input: NodeId) -> GrowResult<NodeId> {
    let input_value = engine.value(input).clone();
    let value = array_ops::apply_f64_or_f32(&input_value, |x| if x > 0.0 { x } else { 0.0 })?;
    Ok(engine.push(value, vec![input], Operation::Relu { input, input_value }))
}

pub fn sigmoid(engine: &mut Engine, input: NodeId) -> GrowResult<NodeId> {
    let value = array_ops::apply_f64_or_f32(engine.value(input), |x| 1.0 / (1.0 + (-x).exp()))?;
    let output = value.clone();
    Ok(engine.push(value, vec![input], Operation::Sigmoid { input, output }))
}

pub fn tanh(engine: &mut Engine, input: NodeId) -> GrowResult<NodeId> {
    let value = array_ops::apply_f64_or_f32(engine.value(input), |x| x.tanh())?;
    let output = value.clone();
    Ok(engine.push(value, vec![input], Operation::Tanh { input, output }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Array;
    use crate::autograd::Engine;
    use crate::dtype::{set_default_dtype, DType};

    #[test]
    fn matmul_forward_value() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let a = engine.require_grad(Array::from_f64(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap());
        let b = engine.require_grad(
            Array::from_f64(vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0], vec![3, 2]).unwrap(),
        );
        let c = matmul_op(&mut engine, a, b).unwrap();
        assert_eq!(engine.value(c).to_vec_f64(), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn relu_zeroes_negative_gradient() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let x = engine.require_grad(Array::from_f64(vec![-1.0, 2.0, -3.0, 4.0], vec![4]).unwrap());
        let y = relu(&mut engine, x).unwrap();
        let loss = sum(&mut engine, y).unwrap();
        engine.backward(loss).unwrap();
        assert_eq!(
            engine.node(x).grad.as_ref().unwrap().to_vec_f64(),
            vec![0.0, 1.0, 0.0, 1.0]
        );
    }

    #[test]
    fn sigmoid_gradient_matches_closed_form_at_zero() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let x = engine.require_grad(Array::from_f64(vec![0.0], vec![1]).unwrap());
        let y = sigmoid(&mut engine, x).unwrap();
        engine.backward(y).unwrap();
        // sigmoid'(0) = 0.25
        let g = engine.node(x).grad.as_ref().unwrap().to_vec_f64()[0];
        assert!((g - 0.25).abs() < 1e-12);
    }
}
