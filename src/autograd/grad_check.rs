//! Numeric gradient checker: central finite differences against the
//! analytic gradient from `backward`, compared with an
//! absolute+relative tolerance rather than a bare epsilon.

use crate::array::Array;
use crate::error::GrowResult;

use super::{Engine, NodeId};

pub const DEFAULT_EPS: f64 = 1e-6;
pub const DEFAULT_TOL: f64 = 1e-4;

/// One mismatching component found by [`check_gradient`].
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub index: usize,
    pub analytic: f64,
    pub numeric: f64,
    pub relative_error: f64,
}

/// `|a - b| <= atol + rtol * |a|`, an absolute+relative tolerance
/// check specialized here to a single scalar pair.
fn is_close(analytic: f64, numeric: f64, atol: f64, rtol: f64) -> bool {
    (analytic - numeric).abs() <= atol + rtol * analytic.abs()
}

/// Packs `x` into one flat `f64` vector, in leaf order, the same order
/// [`unpack_into`] expects it back in.
fn pack(leaves: &[&Array]) -> Vec<f64> {
    leaves.iter().flat_map(|a| a.to_vec_f64()).collect()
}

/// Packs `inputs` into a flat vector, computes the analytic gradient
/// via one forward/backward pass, then computes the numeric gradient
/// by rebuilding the graph at `x[i] +/- eps` for every `i` and
/// comparing with `is_close`. Returns every component that fails the
/// tolerance; an empty vector means the check passed.
pub fn check_gradient(
    inputs: Vec<Array>,
    eps: f64,
    tol: f64,
    mut builder: impl FnMut(&mut Engine, &[NodeId]) -> GrowResult<NodeId>,
) -> GrowResult<Vec<Mismatch>> {
    let shapes: Vec<Vec<usize>> = inputs.iter().map(|a| a.shape().to_vec()).collect();
    let dtypes: Vec<_> = inputs.iter().map(|a| a.dtype()).collect();
    let refs: Vec<&Array> = inputs.iter().collect();
    let flat = pack(&refs);

    let mut analytic_engine = Engine::new();
    let analytic_leaves: Vec<NodeId> = inputs
        .iter()
        .cloned()
        .map(|a| analytic_engine.require_grad(a))
        .collect();
    let root = builder(&mut analytic_engine, &analytic_leaves)?;
    analytic_engine.backward(root)?;

    let mut analytic = Vec::with_capacity(flat.len());
    for &id in &analytic_leaves {
        let grad = analytic_engine.node(id).grad.clone();
        let len = analytic_engine.value(id).len();
        match grad {
            Some(g) => analytic.extend(g.to_vec_f64()),
            None => analytic.extend(std::iter::repeat(0.0).take(len)),
        }
    }

    let mut numeric = vec![0.0; flat.len()];
    for i in 0..flat.len() {
        let mut plus = flat.clone();
        plus[i] += eps;
        let loss_plus = rebuild_and_eval(&shapes, &dtypes, &plus, &mut builder)?;

        let mut minus = flat.clone();
        minus[i] -= eps;
        let loss_minus = rebuild_and_eval(&shapes, &dtypes, &minus, &mut builder)?;

        numeric[i] = (loss_plus - loss_minus) / (2.0 * eps);
    }

    let mut mismatches = Vec::new();
    for (i, (&a, &n)) in itertools::izip!(&analytic, &numeric).enumerate() {
        if !is_close(a, n, tol, tol) {
            mismatches.push(Mismatch {
                index: i,
                analytic: a,
                numeric: n,
                relative_error: (a - n).abs() / a.abs().max(n.abs()).max(1e-12),
            });
        }
    }
    Ok(mismatches)
}

fn rebuild_and_eval(
    shapes: &[Vec<usize>],
    dtypes: &[crate::dtype::DType],
    flat: &[f64],
    builder: &mut impl FnMut(&mut Engine, &[NodeId]) -> GrowResult<NodeId>,
) -> GrowResult<f64> {
    let mut engine = Engine::new();
    let mut offset = 0;
    let mut leaves = Vec::with_capacity(shapes.len());
    for (shape, &dtype) in shapes.iter().zip(dtypes) {
        let len: usize = shape.iter().product();
        let values = flat[offset..offset + len].to_vec();
        offset += len;
        let array = Array::from_f64_as(values, shape.clone(), dtype)?;
        leaves.push(engine.require_grad(array));
    }
    let root = builder(&mut engine, &leaves)?;
    engine.value(root).as_scalar()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::ops;
    use crate::dtype::{set_default_dtype, DType};

    #[test]
    fn linear_function_matches_numeric_gradient() {
        set_default_dtype(DType::F64);
        let x = Array::from_f64(vec![1.0, -2.0, 3.0, 0.5, -0.5, 2.0, 1.5, -1.0], vec![8]).unwrap();
        let mismatches = check_gradient(vec![x], DEFAULT_EPS, DEFAULT_TOL, |engine, leaves| {
            let doubled = ops::mul(engine, leaves[0], leaves[0])?;
            ops::sum(engine, doubled)
        })
        .unwrap();
        assert!(mismatches.is_empty(), "{mismatches:?}");
    }

    #[test]
    fn pointwise_function_matches_numeric_gradient() {
        set_default_dtype(DType::F64);
        let x = Array::from_f64(vec![0.3, -0.7, 1.1, -1.4], vec![4]).unwrap();
        let mismatches = check_gradient(vec![x], DEFAULT_EPS, DEFAULT_TOL, |engine, leaves| {
            let e = ops::exp(engine, leaves[0])?;
            ops::sum(engine, e)
        })
        .unwrap();
        assert!(mismatches.is_empty(), "{mismatches:?}");
    }
}
