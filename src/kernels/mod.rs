//! Numerical kernels that sit above `Array` and below `Autograd`:
//! the BLIS-style blocked matrix multiply and its supporting
//! packed-buffer pools. Elementwise/reduction kernels live in
//! `array::ops` since they need no workspace pooling.

pub mod matmul;
pub mod pool;

pub use matmul::{matmul, matmul_transpose_a, matmul_transpose_b};
