//! Pooled workspace buffers for MatMul panel packing, and a general
//! by-size Array pool.
//!
//! A bump-allocator-with-overflow pattern: a pool hands out a buffer
//! from a fixed-capacity reserve and, once that reserve is exhausted,
//! falls back to a plain transient allocation rather than blocking or
//! erroring.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use crate::array::{Array, Buffer};
use crate::dtype::{DType, Scalar};
use crate::kernels::matmul::{KC, MC, NC};

/// A pool of same-capacity `Vec<T>` buffers. `acquire` hands back a
/// buffer of exactly `needed` zeroed elements, reusing a pooled
/// allocation when `needed <= capacity` and one is free; otherwise it
/// allocates transiently. `release` returns a buffer to the free list
/// only if its capacity matches the pool's canonical capacity, so a
/// transient (oversized) allocation is simply dropped.
pub struct PackedPool<T> {
    capacity: usize,
    free: Mutex<Vec<Vec<T>>>,
}

impl<T: Scalar> PackedPool<T> {
    pub const fn new(capacity: usize) -> Self {
        PackedPool {
            capacity,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self, needed: usize) -> Vec<T> {
        if needed <= self.capacity {
            let mut free = self.free.lock().expect("packed pool mutex poisoned");
            if let Some(mut buf) = free.pop() {
                buf.clear();
                buf.resize(needed, T::zero());
                return buf;
            }
        }
        vec![T::zero(); needed]
    }

    pub fn release(&self, buf: Vec<T>) {
        if buf.capacity() == self.capacity {
            let mut free = self.free.lock().expect("packed pool mutex poisoned");
            free.push(buf);
        }
        // else: transient allocation, drop it.
    }
}

pub static PACKED_A_F32: PackedPool<f32> = PackedPool::new(MC * KC);
pub static PACKED_B_F32: PackedPool<f32> = PackedPool::new(KC * NC);
pub static PACKED_A_F64: PackedPool<f64> = PackedPool::new(MC * KC);
pub static PACKED_B_F64: PackedPool<f64> = PackedPool::new(KC * NC);

/// A general-purpose pool keyed by `(dtype, element count)`, for
/// collaborators that want to reuse Array allocations (e.g. an
/// optimizer's scratch buffers) instead of going through the allocator
/// every step. `get` zeroes on acquisition; `put` returns ownership of
/// an Array's buffer to the pool, keyed by its current length.
pub struct TensorPool {
    bins: Mutex<HashMap<(DType, usize), Vec<Buffer>>>,
}

impl TensorPool {
    /// Not `const`: `HashMap::new()` seeds a `RandomState` at
    /// construction time, which isn't a `const fn`. [`TENSOR_POOL`]
    /// builds one lazily on first access instead.
    pub fn new() -> Self {
        TensorPool {
            bins: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, size: usize, dtype: DType) -> Array {
        let mut bins = self.bins.lock().expect("tensor pool mutex poisoned");
        if let Some(bucket) = bins.get_mut(&(dtype, size)) {
            if let Some(mut buffer) = bucket.pop() {
                zero_buffer(&mut buffer);
                return Array::from_buffer(buffer, vec![size]);
            }
        }
        let buffer = match dtype {
            DType::F32 => Buffer::F32(vec![0.0f32; size]),
            DType::F64 => Buffer::F64(vec![0.0f64; size]),
        };
        Array::from_buffer(buffer, vec![size])
    }

    pub fn put(&self, array: Array) {
        let size = array.len();
        let dtype = array.dtype();
        let buffer = array.into_buffer();
        let mut bins = self.bins.lock().expect("tensor pool mutex poisoned");
        bins.entry((dtype, size)).or_default().push(buffer);
    }
}

impl Default for TensorPool {
    fn default() -> Self {
        Self::new()
    }
}

fn zero_buffer(buffer: &mut Buffer) {
    match buffer {
        Buffer::F32(v) => v.iter_mut().for_each(|x| *x = 0.0),
        Buffer::F64(v) => v.iter_mut().for_each(|x| *x = 0.0),
    }
}

pub static TENSOR_POOL: LazyLock<TensorPool> = LazyLock::new(TensorPool::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_pool_reuses_canonical_capacity() {
        let pool: PackedPool<f32> = PackedPool::new(16);
        let buf = pool.acquire(16);
        assert_eq!(buf.len(), 16);
        pool.release(buf);
        let buf2 = pool.acquire(10);
        assert_eq!(buf2.len(), 10);
        assert!(buf2.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn packed_pool_falls_back_when_oversized() {
        let pool: PackedPool<f32> = PackedPool::new(4);
        let buf = pool.acquire(100);
        assert_eq!(buf.len(), 100);
        pool.release(buf);
        // the oversized buffer should not have been retained
        let buf2 = pool.acquire(4);
        assert_eq!(buf2.len(), 4);
    }

    #[test]
    fn tensor_pool_zeros_on_reuse() {
        let pool = TensorPool::new();
        let mut a = pool.get(8, DType::F64);
        for i in 0..8 {
            a.set_f64(i, (i + 1) as f64);
        }
        pool.put(a);
        let b = pool.get(8, DType::F64);
        assert_eq!(b.to_vec_f64(), vec![0.0; 8]);
    }
}
