//! Cross-module scenario tests: these exercise Array, Engine/autograd,
//! kernels and Optimizer together rather than any one module in
//! isolation. Performance harnesses live separately under `benches/`.

use grownet_core::array::Array;
use grownet_core::autograd::{grad_check, losses, ops, Engine};
use grownet_core::optim::{Adam, Optimizer};
use grownet_core::{set_default_dtype, DType};

/// Linear regression `y = 2x + noise` trained with Adam should
/// converge `W[0]` to within 0.1 of 2.0.
#[test]
fn linear_regression_converges_with_adam() {
    set_default_dtype(DType::F64);

    let n_samples = 500usize;
    let seed = 42u64;
    let mut rng_state = seed;
    let mut next = || {
        // xorshift64 — deterministic, no external RNG needed for this
        // synthetic dataset beyond what Array::randn already covers
        // elsewhere.
        rng_state ^= rng_state << 13;
        rng_state ^= rng_state >> 7;
        rng_state ^= rng_state << 17;
        (rng_state as f64 / u64::MAX as f64) * 2.0 - 1.0
    };

    let xs: Vec<f64> = (0..n_samples).map(|_| next() * 3.0).collect();
    let ys: Vec<f64> = xs.iter().map(|&x| 2.0 * x + next() * 0.001).collect();

    let mut engine = Engine::new();
    let w = engine.require_grad(Array::from_f64(vec![0.0], vec![1, 1]).unwrap());
    let mut optimizer = Adam::with_params(0.1, 0.9, 0.999, 1e-8, 0.0);

    let batch = 32;
    for _epoch in 0..15 {
        for chunk in xs.chunks(batch).zip(ys.chunks(batch)) {
            let (x_chunk, y_chunk) = chunk;
            let n = x_chunk.len();
            let x_node = engine.constant(Array::from_f64(x_chunk.to_vec(), vec![n, 1]).unwrap());
            let target = engine.constant(Array::from_f64(y_chunk.to_vec(), vec![n, 1]).unwrap());

            let pred = ops::matmul_op(&mut engine, x_node, w).unwrap();
            let loss = losses::mse(&mut engine, pred, target).unwrap();
            engine.backward(loss).unwrap();
            optimizer.step(&mut engine, &[w]).unwrap();
            optimizer.zero_grad(&mut engine, &[w]);
        }
    }

    let final_w = engine.value(w).to_vec_f64()[0];
    assert!((final_w - 2.0).abs() < 0.1, "final W[0] = {final_w}");
}

/// For a small graph mixing matmul, activations and a reduction, the
/// analytic gradient from `backward` agrees with a numeric
/// central-difference gradient to within the default tolerance.
#[test]
fn analytic_gradient_matches_numeric_through_matmul_and_relu() {
    set_default_dtype(DType::F64);
    let x = Array::from_f64(vec![0.2, -0.5, 1.3, -0.8], vec![2, 2]).unwrap();
    let w = Array::from_f64(vec![0.7, -0.3, 0.1, 0.9], vec![2, 2]).unwrap();

    let mismatches = grad_check::check_gradient(
        vec![x, w],
        grad_check::DEFAULT_EPS,
        grad_check::DEFAULT_TOL,
        |engine, leaves| {
            let product = ops::matmul_op(engine, leaves[0], leaves[1])?;
            let activated = ops::relu(engine, product)?;
            ops::sum(engine, activated)
        },
    )
    .unwrap();
    assert!(mismatches.is_empty(), "{mismatches:?}");
}

/// A matmul large enough to take the blocked path, run from inside
/// another `parallel_for`, must still produce the same result as a
/// sequential top-level call — the scheduler's anti-nesting guard must
/// not corrupt output.
#[test]
fn nested_matmul_matches_top_level_matmul() {
    use grownet_core::kernels::matmul::matmul;
    use grownet_core::scheduler::parallel_for;

    set_default_dtype(DType::F64);
    let a = Array::randn(&[256, 256], 5).unwrap();
    let b = Array::randn(&[256, 256], 6).unwrap();
    let direct = matmul(&a, &b).unwrap();

    let nested = std::sync::Mutex::new(None);
    parallel_for(1024, 8, |_s, _e| {
        let result = matmul(&a, &b).unwrap();
        let mut slot = nested.lock().unwrap();
        if slot.is_none() {
            *slot = Some(result);
        }
    });

    let nested_result = nested.into_inner().unwrap().unwrap();
    assert_eq!(direct.to_vec_f64(), nested_result.to_vec_f64());
}
