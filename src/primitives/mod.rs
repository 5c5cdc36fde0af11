//! Tensor Primitives
//!
//! Core numeric operations the attention engine is built on: device
//! selection, parameter initialization, segmented matmul, grouped softmax,
//! and scatter aggregation.
//!
//! ## Submodules
//!
//! - [`activations`]: Activation functions (sigmoid, gelu, relu, softmax)
//! - [`tensor_ops`]: Device selection, initializers, segmented/grouped ops

mod activations;
mod tensor_ops;

// Re-export all primitives at module level
pub use activations::*;
pub use tensor_ops::*;
