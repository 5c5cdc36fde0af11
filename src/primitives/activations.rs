//! Activation Functions
//!
//! Standard neural network activation functions used by the attention layers.

use crate::{GraphAttentionError, Result};
use candle_core::Tensor;

/// Sigmoid activation: σ(x) = 1 / (1 + e^(-x))
///
/// Maps any real number to (0, 1). Used for:
/// - Skip-gate blending coefficients
/// - Soft thresholding
pub fn sigmoid(tensor: &Tensor) -> Result<Tensor> {
    let neg = tensor
        .neg()
        .map_err(|e| GraphAttentionError::Tensor(format!("sigmoid neg failed: {}", e)))?;
    let exp_neg = neg
        .exp()
        .map_err(|e| GraphAttentionError::Tensor(format!("sigmoid exp failed: {}", e)))?;
    let one_plus = (exp_neg + 1.0)
        .map_err(|e| GraphAttentionError::Tensor(format!("sigmoid add failed: {}", e)))?;
    one_plus
        .recip()
        .map_err(|e| GraphAttentionError::Tensor(format!("sigmoid recip failed: {}", e)))
}

/// Softmax activation along a dimension
///
/// Converts a vector of real numbers to a probability distribution. For
/// softmax grouped by an index array see
/// [`scatter_softmax`](super::scatter_softmax).
pub fn softmax(tensor: &Tensor, dim: usize) -> Result<Tensor> {
    candle_nn::ops::softmax(tensor, dim)
        .map_err(|e| GraphAttentionError::Tensor(format!("Softmax failed: {}", e)))
}

/// ReLU activation: max(0, x)
pub fn relu(tensor: &Tensor) -> Result<Tensor> {
    tensor
        .relu()
        .map_err(|e| GraphAttentionError::Tensor(format!("ReLU failed: {}", e)))
}

/// GELU activation: x * Φ(x) where Φ is the CDF of standard normal
///
/// Gaussian Error Linear Unit - used in transformers.
/// Approximation: x * σ(1.702 * x)
pub fn gelu(tensor: &Tensor) -> Result<Tensor> {
    // GELU approximation: x * sigmoid(1.702 * x)
    let scaled = (tensor * 1.702)
        .map_err(|e| GraphAttentionError::Tensor(format!("GELU scale failed: {}", e)))?;
    let sig = sigmoid(&scaled)?;
    tensor
        .mul(&sig)
        .map_err(|e| GraphAttentionError::Tensor(format!("GELU mul failed: {}", e)))
}
