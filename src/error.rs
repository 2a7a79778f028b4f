//! Error taxonomy for the array/kernel/autograd core.
//!
//! Five kinds: shape, dtype, dimension, numeric-domain and
//! internal-precondition failures. None of them allocate on the failure
//! path beyond the error value itself, and none of them mutate their
//! inputs before returning.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GrowError {
    #[error("shape mismatch: {context} (got {got:?}, expected {expected:?})")]
    Shape {
        context: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("dtype mismatch: {context} (got {got:?}, expected {expected:?})")]
    Dtype {
        context: String,
        got: crate::dtype::DType,
        expected: crate::dtype::DType,
    },

    #[error("invalid dimension: {0}")]
    Dimension(String),

    #[error("numeric domain error: {0}")]
    NumericDomain(String),

    #[error("internal precondition violated: {0}")]
    Internal(String),
}

pub type GrowResult<T> = Result<T, GrowError>;

impl GrowError {
    pub fn shape(context: impl Into<String>, got: &[usize], expected: &[usize]) -> Self {
        GrowError::Shape {
            context: context.into(),
            got: got.to_vec(),
            expected: expected.to_vec(),
        }
    }

    pub fn dtype(
        context: impl Into<String>,
        got: crate::dtype::DType,
        expected: crate::dtype::DType,
    ) -> Self {
        GrowError::Dtype {
            context: context.into(),
            got,
            expected,
        }
    }

    pub fn dimension(msg: impl Into<String>) -> Self {
        GrowError::Dimension(msg.into())
    }

    pub fn numeric_domain(msg: impl Into<String>) -> Self {
        GrowError::NumericDomain(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        GrowError::Internal(msg.into())
    }
}
