//! The dense numeric container every kernel and autograd op reads and
//! writes: a flat element buffer, a shape, row-major strides, and a
//! dtype.

pub mod ops;

use std::sync::Arc;

use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::dtype::{default_dtype, DType, Scalar};
use crate::error::{GrowError, GrowResult};

/// The flat backing storage for an [`Array`]. Held behind an `Arc` so
/// `reshape` can hand back a new shape/stride view over the same buffer
/// without copying; in-place kernels clone-on-write via `Arc::make_mut`
/// only when the buffer is actually shared.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Buffer {
    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(v) => v.len(),
            Buffer::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            Buffer::F32(_) => DType::F32,
            Buffer::F64(_) => DType::F64,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Buffer::F32(v) => Some(v),
            Buffer::F64(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match self {
            Buffer::F64(v) => Some(v),
            Buffer::F32(_) => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            Buffer::F32(v) => Some(v),
            Buffer::F64(_) => None,
        }
    }

    pub fn as_f64_mut(&mut self) -> Option<&mut [f64]> {
        match self {
            Buffer::F64(v) => Some(v),
            Buffer::F32(_) => None,
        }
    }
}

/// Computes row-major strides for `shape`: `stride[k] = product(shape[k+1..])`,
/// `stride[last] = 1`. Rank-0 shapes yield an empty stride vector.
pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// `product(shape)`, the required buffer length for that shape.
pub fn data_len(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn validate_shape(shape: &[usize]) -> GrowResult<()> {
    if shape.iter().any(|&d| d == 0) {
        return Err(GrowError::dimension(format!(
            "non-positive dimension in shape {:?}",
            shape
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    data: Arc<Buffer>,
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: DType,
}

impl Array {
    pub(crate) fn from_buffer(buffer: Buffer, shape: Vec<usize>) -> Array {
        let strides = compute_strides(&shape);
        let dtype = buffer.dtype();
        Array {
            data: Arc::new(buffer),
            shape,
            strides,
            dtype,
        }
    }

    /// Builds an array directly from an owned `f32` buffer; used by
    /// kernels that already hold typed data.
    pub fn from_f32(values: Vec<f32>, shape: Vec<usize>) -> GrowResult<Array> {
        validate_shape(&shape)?;
        if values.len() != data_len(&shape) {
            return Err(GrowError::shape(
                "Array::from_f32: buffer length does not match shape",
                &[values.len()],
                &shape,
            ));
        }
        Ok(Array::from_buffer(Buffer::F32(values), shape))
    }

    pub fn from_f64(values: Vec<f64>, shape: Vec<usize>) -> GrowResult<Array> {
        validate_shape(&shape)?;
        if values.len() != data_len(&shape) {
            return Err(GrowError::shape(
                "Array::from_f64: buffer length does not match shape",
                &[values.len()],
                &shape,
            ));
        }
        Ok(Array::from_buffer(Buffer::F64(values), shape))
    }

    /// A fresh array of the current default dtype, every element zero.
    pub fn zeros(shape: &[usize]) -> GrowResult<Array> {
        validate_shape(shape)?;
        let n = data_len(shape);
        let buffer = match default_dtype() {
            DType::F32 => Buffer::F32(vec![0.0f32; n]),
            DType::F64 => Buffer::F64(vec![0.0f64; n]),
        };
        Ok(Array::from_buffer(buffer, shape.to_vec()))
    }

    /// A fresh array of the current default dtype, every element one.
    pub fn ones(shape: &[usize]) -> GrowResult<Array> {
        validate_shape(shape)?;
        let n = data_len(shape);
        let buffer = match default_dtype() {
            DType::F32 => Buffer::F32(vec![1.0f32; n]),
            DType::F64 => Buffer::F64(vec![1.0f64; n]),
        };
        Ok(Array::from_buffer(buffer, shape.to_vec()))
    }

    /// A fresh array of the current default dtype, filled with samples
    /// from a standard normal distribution seeded deterministically by
    /// `seed`.
    pub fn randn(shape: &[usize], seed: u64) -> GrowResult<Array> {
        validate_shape(shape)?;
        let n = data_len(shape);
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let buffer = match default_dtype() {
            DType::F32 => {
                let data: Vec<f32> = (0..n)
                    .map(|_| StandardNormal.sample(&mut rng))
                    .collect();
                Buffer::F32(data)
            }
            DType::F64 => {
                let data: Vec<f64> = (0..n)
                    .map(|_| StandardNormal.sample(&mut rng))
                    .collect();
                Buffer::F64(data)
            }
        };
        Ok(Array::from_buffer(buffer, shape.to_vec()))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn buffer(&self) -> &Buffer {
        &self.data
    }

    /// Unwraps this array into its backing buffer, cloning only if the
    /// buffer is still shared with another `Array` view. Used by
    /// [`crate::kernels::pool::TensorPool`] to reclaim the allocation.
    pub(crate) fn into_buffer(self) -> Buffer {
        Arc::try_unwrap(self.data).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Mutable access to the backing buffer. Clones the underlying
    /// storage only if it is currently shared with another `Array`
    /// (e.g. a `reshape` view) — copy-on-write.
    pub fn buffer_mut(&mut self) -> &mut Buffer {
        Arc::make_mut(&mut self.data)
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        self.data.as_f32()
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        self.data.as_f64()
    }

    /// A new Array, same shape and dtype as `self`, filled with zeros.
    /// Used to lazily allocate a Node's gradient buffer on first use.
    pub fn zero_grad_like(&self) -> Array {
        let n = self.len();
        let buffer = match self.dtype {
            DType::F32 => Buffer::F32(vec![0.0f32; n]),
            DType::F64 => Buffer::F64(vec![0.0f64; n]),
        };
        Array::from_buffer(buffer, self.shape.clone())
    }

    /// Returns a logical view over the same buffer with a new shape;
    /// fails if the element count would change. No data is copied.
    pub fn reshape(&self, new_shape: &[usize]) -> GrowResult<Array> {
        validate_shape(new_shape)?;
        let new_len = data_len(new_shape);
        if new_len != self.len() {
            return Err(GrowError::shape(
                "reshape cannot change element count",
                &self.shape,
                new_shape,
            ));
        }
        Ok(Array {
            data: Arc::clone(&self.data),
            strides: compute_strides(new_shape),
            shape: new_shape.to_vec(),
            dtype: self.dtype,
        })
    }

    /// Scalar extraction for a one-element array (used by `backward`'s
    /// root-must-be-scalar check and by loss reporting).
    pub fn as_scalar(&self) -> GrowResult<f64> {
        if self.len() != 1 {
            return Err(GrowError::shape(
                "as_scalar requires a one-element array",
                &self.shape,
                &[1],
            ));
        }
        Ok(match self.buffer() {
            Buffer::F32(v) => v[0] as f64,
            Buffer::F64(v) => v[0],
        })
    }

    /// Reads element `i` of the flat buffer as an `f64`, regardless of
    /// dtype. Used by the gradient checker, which perturbs and compares
    /// in `f64` irrespective of the array's native element type.
    pub fn get_f64(&self, i: usize) -> f64 {
        match self.buffer() {
            Buffer::F32(v) => v[i] as f64,
            Buffer::F64(v) => v[i],
        }
    }

    /// Writes element `i` of the flat buffer from an `f64`, regardless
    /// of dtype (narrowing for `f32`).
    pub fn set_f64(&mut self, i: usize, value: f64) {
        match self.buffer_mut() {
            Buffer::F32(v) => v[i] = value as f32,
            Buffer::F64(v) => v[i] = value,
        }
    }

    /// Builds an array from `f64` values, narrowing to `f32` first if
    /// `dtype` calls for it. Used by losses and the gradient checker,
    /// which compute in `f64` regardless of the operands' native dtype.
    pub fn from_f64_as(values: Vec<f64>, shape: Vec<usize>, dtype: DType) -> GrowResult<Array> {
        match dtype {
            DType::F32 => Array::from_f32(values.into_iter().map(|v| v as f32).collect(), shape),
            DType::F64 => Array::from_f64(values, shape),
        }
    }

    pub fn to_vec_f64(&self) -> Vec<f64> {
        match self.buffer() {
            Buffer::F32(v) => v.iter().map(|&x| x as f64).collect(),
            Buffer::F64(v) => v.clone(),
        }
    }

    pub fn require_same_shape(&self, other: &Array, context: &str) -> GrowResult<()> {
        if self.shape != other.shape {
            return Err(GrowError::shape(context, &other.shape, &self.shape));
        }
        Ok(())
    }

    pub fn require_same_dtype(&self, other: &Array, context: &str) -> GrowResult<()> {
        if self.dtype != other.dtype {
            return Err(GrowError::dtype(context, other.dtype, self.dtype));
        }
        Ok(())
    }
}

/// Blanket helper so generic kernels can build an [`Array`] from a typed
/// `Vec<T>` without matching on `T::DTYPE` at every call site.
pub(crate) trait IntoArray: Scalar {
    fn into_array(values: Vec<Self>, shape: Vec<usize>) -> GrowResult<Array>;
}

impl IntoArray for f32 {
    fn into_array(values: Vec<f32>, shape: Vec<usize>) -> GrowResult<Array> {
        Array::from_f32(values, shape)
    }
}

impl IntoArray for f64 {
    fn into_array(values: Vec<f64>, shape: Vec<usize>) -> GrowResult<Array> {
        Array::from_f64(values, shape)
    }
}
