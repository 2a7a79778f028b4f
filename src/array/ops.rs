//! Elementwise and reduction kernels over [`Array`] buffers. Binary
//! ops require matching shape and dtype and return a fresh array;
//! in-place siblings mutate the left operand to avoid an allocation in
//! hot backward-pass loops.
//!
//! Inner loops are unrolled by a factor of 8 to help the compiler
//! autovectorize; a portable substitute for hand-written SIMD
//! intrinsics.

use num_traits::Float;

use super::{Array, Buffer};
use crate::dtype::{DType, Scalar};
use crate::error::{GrowError, GrowResult};

const UNROLL: usize = 8;

fn binary_elementwise<T: Scalar>(a: &[T], b: &[T], f: impl Fn(T, T) -> T) -> Vec<T> {
    debug_assert_eq!(a.len(), b.len());
    let mut out = Vec::with_capacity(a.len());
    let chunks = a.len() / UNROLL;
    for c in 0..chunks {
        let base = c * UNROLL;
        for i in 0..UNROLL {
            out.push(f(a[base + i], b[base + i]));
        }
    }
    for i in chunks * UNROLL..a.len() {
        out.push(f(a[i], b[i]));
    }
    out
}

fn binary_elementwise_in_place<T: Scalar>(a: &mut [T], b: &[T], f: impl Fn(T, T) -> T) {
    debug_assert_eq!(a.len(), b.len());
    let chunks = a.len() / UNROLL;
    for c in 0..chunks {
        let base = c * UNROLL;
        for i in 0..UNROLL {
            a[base + i] = f(a[base + i], b[base + i]);
        }
    }
    for i in chunks * UNROLL..a.len() {
        a[i] = f(a[i], b[i]);
    }
}

fn unary_elementwise<T: Scalar>(a: &[T], f: impl Fn(T) -> T) -> Vec<T> {
    let mut out = Vec::with_capacity(a.len());
    let chunks = a.len() / UNROLL;
    for c in 0..chunks {
        let base = c * UNROLL;
        for i in 0..UNROLL {
            out.push(f(a[base + i]));
        }
    }
    for i in chunks * UNROLL..a.len() {
        out.push(f(a[i]));
    }
    out
}

macro_rules! binary_op {
    ($name:ident, $in_place:ident, $context:expr, $op:expr) => {
        pub fn $name(a: &Array, b: &Array) -> GrowResult<Array> {
            a.require_same_shape(b, $context)?;
            a.require_same_dtype(b, $context)?;
            match (a.buffer(), b.buffer()) {
                (Buffer::F32(x), Buffer::F64(_)) | (Buffer::F64(_), Buffer::F32(x)) => {
                    let _ = x;
                    unreachable!("dtype checked above")
                }
                (Buffer::F32(x), Buffer::F32(y)) => {
                    Array::from_f32(binary_elementwise(x, y, $op), a.shape().to_vec())
                }
                (Buffer::F64(x), Buffer::F64(y)) => {
                    Array::from_f64(binary_elementwise(x, y, $op), a.shape().to_vec())
                }
            }
        }

        pub fn $in_place(a: &mut Array, b: &Array) -> GrowResult<()> {
            a.require_same_shape(b, $context)?;
            a.require_same_dtype(b, $context)?;
            match (a.buffer_mut(), b.buffer()) {
                (Buffer::F32(x), Buffer::F32(y)) => binary_elementwise_in_place(x, y, $op),
                (Buffer::F64(x), Buffer::F64(y)) => binary_elementwise_in_place(x, y, $op),
                _ => unreachable!("dtype checked above"),
            }
            Ok(())
        }
    };
}

binary_op!(add, add_in_place, "add", |p, q| p + q);
binary_op!(sub, sub_in_place, "sub", |p, q| p - q);
binary_op!(mul, mul_in_place, "mul", |p, q| p * q);
binary_op!(div, div_in_place, "div", |p, q| p / q);

/// Applies a user-supplied scalar function to every element of an
/// `f32` array. Errors if `a` is not `f32`.
pub fn apply_f32(a: &Array, f: impl Fn(f32) -> f32) -> GrowResult<Array> {
    match a.buffer() {
        Buffer::F32(x) => Array::from_f32(unary_elementwise(x, f), a.shape().to_vec()),
        Buffer::F64(_) => Err(GrowError::dtype("apply_f32", DType::F64, DType::F32)),
    }
}

/// Applies a user-supplied scalar function to every element of an
/// `f64` array. Errors if `a` is not `f64`.
pub fn apply_f64(a: &Array, f: impl Fn(f64) -> f64) -> GrowResult<Array> {
    match a.buffer() {
        Buffer::F64(x) => Array::from_f64(unary_elementwise(x, f), a.shape().to_vec()),
        Buffer::F32(_) => Err(GrowError::dtype("apply_f64", DType::F32, DType::F64)),
    }
}

/// Applies an `f64` scalar function to every element regardless of the
/// array's native dtype, narrowing back to `f32` where needed. Used by
/// autograd backward rules, which compute their scale factors in `f64`
/// and don't want to match on dtype at every call site.
pub fn apply_f64_or_f32(a: &Array, f: impl Fn(f64) -> f64) -> GrowResult<Array> {
    match a.buffer() {
        Buffer::F32(x) => {
            let out = unary_elementwise(x, |v| f(v as f64) as f32);
            Array::from_f32(out, a.shape().to_vec())
        }
        Buffer::F64(x) => {
            let out = unary_elementwise(x, |v| f(v));
            Array::from_f64(out, a.shape().to_vec())
        }
    }
}

fn reduce<T: Scalar>(data: &[T], init: T, f: impl Fn(T, T) -> T) -> T {
    data.iter().fold(init, |acc, &x| f(acc, x))
}

/// Sums every element into a fresh one-element array.
pub fn sum(a: &Array) -> GrowResult<Array> {
    match a.buffer() {
        Buffer::F32(x) => Array::from_f32(vec![reduce(x, 0.0f32, |p, q| p + q)], vec![1]),
        Buffer::F64(x) => Array::from_f64(vec![reduce(x, 0.0f64, |p, q| p + q)], vec![1]),
    }
}

/// The elementwise maximum, folded into a fresh one-element array.
/// `a` is guaranteed non-empty (all factory shapes have positive dims).
pub fn max(a: &Array) -> GrowResult<Array> {
    match a.buffer() {
        Buffer::F32(x) => {
            let m = x[1..].iter().fold(x[0], |acc, &v| acc.max(v));
            Array::from_f32(vec![m], vec![1])
        }
        Buffer::F64(x) => {
            let m = x[1..].iter().fold(x[0], |acc, &v| acc.max(v));
            Array::from_f64(vec![m], vec![1])
        }
    }
}

/// `e^x` elementwise.
pub fn exp(a: &Array) -> GrowResult<Array> {
    match a.buffer() {
        Buffer::F32(x) => Array::from_f32(unary_elementwise(x, |v| v.exp()), a.shape().to_vec()),
        Buffer::F64(x) => Array::from_f64(unary_elementwise(x, |v| v.exp()), a.shape().to_vec()),
    }
}

/// `ln(x)` elementwise, with no domain guard — callers that cannot
/// guarantee positive inputs should use [`log_checked`]. Only the
/// core's internal `softmax_ce` clamps with an epsilon; the bare
/// `log` kernel does not.
pub fn log(a: &Array) -> GrowResult<Array> {
    match a.buffer() {
        Buffer::F32(x) => Array::from_f32(unary_elementwise(x, |v| v.ln()), a.shape().to_vec()),
        Buffer::F64(x) => Array::from_f64(unary_elementwise(x, |v| v.ln()), a.shape().to_vec()),
    }
}

/// `ln(x)` elementwise, failing with [`GrowError::NumericDomain`] if any
/// element is non-positive rather than silently producing `NaN`/`-inf`.
pub fn log_checked(a: &Array) -> GrowResult<Array> {
    let all_positive = match a.buffer() {
        Buffer::F32(x) => x.iter().all(|&v| v > 0.0),
        Buffer::F64(x) => x.iter().all(|&v| v > 0.0),
    };
    if !all_positive {
        return Err(GrowError::numeric_domain(
            "log of a non-positive element",
        ));
    }
    log(a)
}

/// Transposes a 2-D array into a fresh buffer (not a view).
pub fn transpose(a: &Array) -> GrowResult<Array> {
    if a.shape().len() != 2 {
        return Err(GrowError::shape(
            "transpose requires a 2-D array",
            a.shape(),
            &[0, 0],
        ));
    }
    let (m, n) = (a.shape()[0], a.shape()[1]);
    match a.buffer() {
        Buffer::F32(x) => Array::from_f32(transpose_buf(x, m, n), vec![n, m]),
        Buffer::F64(x) => Array::from_f64(transpose_buf(x, m, n), vec![n, m]),
    }
}

fn transpose_buf<T: Scalar>(x: &[T], m: usize, n: usize) -> Vec<T> {
    let mut out = vec![T::zero(); m * n];
    for i in 0..m {
        for j in 0..n {
            out[j * m + i] = x[i * n + j];
        }
    }
    out
}
