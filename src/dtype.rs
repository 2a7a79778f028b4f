//! The process-wide default element type and the `Scalar` bound kernels
//! and autograd ops are generic over.
//!
//! The default dtype is process-wide and atomically settable. Reads
//! are always safe to race; writes should be rare and are the
//! caller's responsibility to serialize.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

const F32_TAG: u8 = 0;
const F64_TAG: u8 = 1;

static DEFAULT_DTYPE: AtomicU8 = AtomicU8::new(F64_TAG);

/// Returns the process-wide default dtype used by `zeros`/`ones`/`randn`.
pub fn default_dtype() -> DType {
    match DEFAULT_DTYPE.load(Ordering::Relaxed) {
        F32_TAG => DType::F32,
        _ => DType::F64,
    }
}

/// Sets the process-wide default dtype. Takes effect immediately for any
/// subsequent factory call on any thread.
pub fn set_default_dtype(dtype: DType) {
    let tag = match dtype {
        DType::F32 => F32_TAG,
        DType::F64 => F64_TAG,
    };
    DEFAULT_DTYPE.store(tag, Ordering::Relaxed);
}

/// The element types the core supports: IEEE-754 binary32 and binary64.
/// Complex and integer element types are not supported.
pub trait Scalar:
    num_traits::Float + Send + Sync + std::fmt::Debug + Default + 'static
{
    const DTYPE: DType;
}

impl Scalar for f32 {
    const DTYPE: DType = DType::F32;
}

impl Scalar for f64 {
    const DTYPE: DType = DType::F64;
}
