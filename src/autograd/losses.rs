//! The three loss ops: `mse`, `softmax_ce`, `hinge`. Each saves
//! exactly the intermediate its backward rule needs and nothing else.

use crate::array::Array;
use crate::dtype::DType;
use crate::error::{GrowError, GrowResult};

use super::{Engine, NodeId, Operation};

const SOFTMAX_LOG_EPS: f64 = 1e-15;

/// `mean((pred - target)^2)`. Only `pred` receives a gradient; `target`
/// is treated as data.
pub fn mse(engine: &mut Engine, pred: NodeId, target: NodeId) -> GrowResult<NodeId> {
    let pred_value = engine.value(pred);
    let target_value = engine.value(target);
    pred_value.require_same_shape(target_value, "mse")?;
    pred_value.require_same_dtype(target_value, "mse")?;

    let p = pred_value.to_vec_f64();
    let t = target_value.to_vec_f64();
    let n = p.len();
    let diff_vals: Vec<f64> = p.iter().zip(&t).map(|(a, b)| a - b).collect();
    let loss = diff_vals.iter().map(|d| d * d).sum::<f64>() / n as f64;

    let dtype = pred_value.dtype();
    let diff = Array::from_f64_as(diff_vals, vec![n], dtype)?;
    let value = Array::from_f64_as(vec![loss], vec![1], dtype)?;

    Ok(engine.push(value, vec![pred], Operation::Mse { pred, diff }))
}

/// Numerically-stable `-mean(onehot . log softmax(logits))`. `logits`
/// and `onehot` are both `[batch, classes]` (or `[classes]` for a
/// single sample, treated as `batch=1`). Subtracts the per-row max
/// before exponentiating and clamps the log argument to
/// [`SOFTMAX_LOG_EPS`].
pub fn softmax_ce(engine: &mut Engine, logits: NodeId, onehot: NodeId) -> GrowResult<NodeId> {
    let logits_value = engine.value(logits);
    let onehot_value = engine.value(onehot);
    logits_value.require_same_shape(onehot_value, "softmax_ce")?;
    logits_value.require_same_dtype(onehot_value, "softmax_ce")?;

    let shape = logits_value.shape().to_vec();
    let (batch, classes) = match shape.as_slice() {
        [c] => (1, *c),
        [b, c] => (*b, *c),
        _ => {
            return Err(GrowError::shape(
                "softmax_ce expects a 1-D or 2-D input",
                &shape,
                &[0, 0],
            ))
        }
    };

    let logit_vals = logits_value.to_vec_f64();
    let onehot_vals = onehot_value.to_vec_f64();
    let mut softmax_vals = vec![0.0f64; logit_vals.len()];
    let mut loss = 0.0f64;

    for row in 0..batch {
        let row_slice = &logit_vals[row * classes..(row + 1) * classes];
        let row_max = row_slice.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = row_slice.iter().map(|&x| (x - row_max).exp()).collect();
        let sum_exp: f64 = exps.iter().sum();
        for j in 0..classes {
            let p = exps[j] / sum_exp;
            softmax_vals[row * classes + j] = p;
            let target_j = onehot_vals[row * classes + j];
            if target_j != 0.0 {
                loss -= target_j * p.max(SOFTMAX_LOG_EPS).ln();
            }
        }
    }
    loss /= batch as f64;

    let dtype = logits_value.dtype();
    let softmax = Array::from_f64_as(softmax_vals, shape.clone(), dtype)?;
    let onehot_saved = Array::from_f64_as(onehot_vals, shape, dtype)?;
    let value = Array::from_f64_as(vec![loss], vec![1], dtype)?;

    Ok(engine.push(
        value,
        vec![logits],
        Operation::SoftmaxCe { logits, softmax, onehot: onehot_saved, batch },
    ))
}

/// `mean(max(0, 1 - target*pred))`. Saves the elementwise
/// `margin > 0 ? 1 : 0` mask rather than the margin itself, since the
/// backward rule only needs where the hinge was active.
pub fn hinge(engine: &mut Engine, pred: NodeId, target: NodeId) -> GrowResult<NodeId> {
    let pred_value = engine.value(pred);
    let target_value = engine.value(target);
    pred_value.require_same_shape(target_value, "hinge")?;
    pred_value.require_same_dtype(target_value, "hinge")?;

    let p = pred_value.to_vec_f64();
    let t = target_value.to_vec_f64();
    let n = p.len();

    let margins: Vec<f64> = p.iter().zip(&t).map(|(pv, tv)| 1.0 - tv * pv).collect();
    let loss = margins.iter().map(|m| m.max(0.0)).sum::<f64>() / n as f64;
    let mask: Vec<f64> = margins.iter().map(|&m| if m > 0.0 { 1.0 } else { 0.0 }).collect();

    let dtype = pred_value.dtype();
    let margin_positive = Array::from_f64_as(mask, vec![n], dtype)?;
    let target_saved = Array::from_f64_as(t, vec![n], dtype)?;
    let value = Array::from_f64_as(vec![loss], vec![1], dtype)?;

    Ok(engine.push(
        value,
        vec![pred],
        Operation::Hinge { pred, target: target_saved, margin_positive, n },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::set_default_dtype;

    #[test]
    fn mse_forward_and_backward_on_a_vector() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let pred = engine.require_grad(Array::from_f64(vec![1.0, 2.0, 3.0], vec![3]).unwrap());
        let target = engine.constant(Array::from_f64(vec![1.5, 2.5, 2.5], vec![3]).unwrap());
        let loss = mse(&mut engine, pred, target).unwrap();
        assert!((engine.value(loss).as_scalar().unwrap() - 0.25).abs() < 1e-12);
        engine.backward(loss).unwrap();
        let grad = engine.node(pred).grad.as_ref().unwrap().to_vec_f64();
        let expected = vec![-1.0 / 3.0, -1.0 / 3.0, 1.0 / 3.0];
        for (g, e) in grad.iter().zip(expected.iter()) {
            assert!((g - e).abs() < 1e-9);
        }
    }

    #[test]
    fn hinge_forward_and_backward_on_a_vector() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let pred = engine.require_grad(Array::from_f64(vec![0.5, -0.5, 1.5], vec![3]).unwrap());
        let target = engine.constant(Array::from_f64(vec![1.0, 1.0, 1.0], vec![3]).unwrap());
        let loss = hinge(&mut engine, pred, target).unwrap();
        assert!((engine.value(loss).as_scalar().unwrap() - 2.0 / 3.0).abs() < 1e-12);
        engine.backward(loss).unwrap();
        let grad = engine.node(pred).grad.as_ref().unwrap().to_vec_f64();
        let expected = vec![-1.0 / 3.0, -1.0 / 3.0, 0.0];
        for (g, e) in grad.iter().zip(expected.iter()) {
            assert!((g - e).abs() < 1e-9);
        }
    }

    #[test]
    fn softmax_ce_is_numerically_stable_for_extreme_logits() {
        set_default_dtype(DType::F64);
        let mut engine = Engine::new();
        let logits = engine.require_grad(Array::from_f64(vec![-1000.0, 1000.0, -500.0], vec![3]).unwrap());
        let onehot = engine.constant(Array::from_f64(vec![0.0, 1.0, 0.0], vec![3]).unwrap());
        let loss = softmax_ce(&mut engine, logits, onehot).unwrap();
        let loss_val = engine.value(loss).as_scalar().unwrap();
        assert!(loss_val.is_finite());
        assert!(loss_val < 1.0);
        engine.backward(loss).unwrap();
        let grad = engine.node(logits).grad.as_ref().unwrap().to_vec_f64();
        assert!(grad.iter().all(|g| g.is_finite()));
    }
}
