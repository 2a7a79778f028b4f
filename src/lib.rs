//! `grownet_core`: a from-scratch dense-array, scheduler, kernel,
//! autograd and optimizer stack. See `array`, `scheduler`, `kernels`,
//! `autograd`, and `optim` for the component breakdown.

pub mod array;
pub mod autograd;
pub mod dtype;
pub mod error;
pub mod kernels;
pub mod optim;
pub mod scheduler;

pub use array::Array;
pub use autograd::{no_grad, Engine, Node, NodeId, Operation};
pub use dtype::{default_dtype, set_default_dtype, DType};
pub use error::{GrowError, GrowResult};
