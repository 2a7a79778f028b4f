//! A synthetic `y = 2x + noise` linear regression, trained with Adam
//! against an MSE loss, run end to end. Exercises every core component
//! together: Array, Engine/autograd, kernels, Optimizer.

use anyhow::Result;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use grownet_core::array::Array;
use grownet_core::autograd::{losses, ops, Engine};
use grownet_core::optim::{Adam, Optimizer};
use grownet_core::{set_default_dtype, DType};

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn make_dataset(n: usize, seed: u64) -> (Vec<f64>, Vec<f64>) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut xs = Vec::with_capacity(n);
    let mut ys = Vec::with_capacity(n);
    for _ in 0..n {
        let x: f64 = StandardNormal.sample(&mut rng);
        let noise: f64 = StandardNormal.sample(&mut rng) * 0.01;
        xs.push(x);
        ys.push(2.0 * x + noise);
    }
    (xs, ys)
}

fn shuffled_indices(n: usize, seed: u64) -> Vec<usize> {
    use rand::seq::SliceRandom;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut idx: Vec<usize> = (0..n).collect();
    idx.shuffle(&mut rng);
    idx
}

fn main() -> Result<()> {
    set_default_dtype(DType::F64);

    let lr = env_f64("GNN_LR", 0.1);
    let epochs = env_usize("GNN_EPOCHS", 15);
    let batch = env_usize("GNN_BATCH", 32);
    let seed = env_usize("GNN_SEED", 42) as u64;

    let n_samples = 500;
    let (xs, ys) = make_dataset(n_samples, seed);

    let mut engine = Engine::new();
    let w = engine.require_grad(Array::randn(&[1, 1], seed)?);
    let mut optimizer = Adam::with_params(lr, 0.9, 0.999, 1e-8, 0.0);

    for epoch in 0..epochs {
        let order = shuffled_indices(n_samples, seed + epoch as u64);
        let mut epoch_loss = 0.0;
        let mut batches = 0;

        for chunk in order.chunks(batch) {
            let batch_n = chunk.len();
            let x_vals: Vec<f64> = chunk.iter().map(|&i| xs[i]).collect();
            let y_vals: Vec<f64> = chunk.iter().map(|&i| ys[i]).collect();

            let x_node = engine.constant(Array::from_f64(x_vals, vec![batch_n, 1])?);
            let target = engine.constant(Array::from_f64(y_vals, vec![batch_n, 1])?);

            let pred = ops::matmul_op(&mut engine, x_node, w)?;
            let loss = losses::mse(&mut engine, pred, target)?;

            engine.backward(loss)?;
            optimizer.step(&mut engine, &[w])?;
            optimizer.zero_grad(&mut engine, &[w]);

            epoch_loss += engine.value(loss).as_scalar()?;
            batches += 1;
        }

        println!(
            "epoch {:>3}/{epochs}  mean loss = {:.6}  w = {:.6}",
            epoch + 1,
            epoch_loss / batches as f64,
            engine.value(w).to_vec_f64()[0]
        );
    }

    let final_w = engine.value(w).to_vec_f64()[0];
    println!("final W[0] = {final_w:.6} (target 2.0)");
    Ok(())
}
