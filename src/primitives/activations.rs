//! Activation Functions
//!
//! Activations shared by the scoring functions, the residual gate and the
//! reasoning layers.

use candle_core::Tensor;
use crate::{KgeError, Result};

/// Sigmoid activation: σ(x) = 1 / (1 + e^(-x))
///
/// Maps any real number to (0, 1). Used for:
/// - Converting atom logits to truth scores
/// - Rule gates and the embedding residual gate
pub fn sigmoid(tensor: &Tensor) -> Result<Tensor> {
    let neg = tensor.neg()
        .map_err(|e| KgeError::Tensor(format!("sigmoid neg failed: {}", e)))?;
    let exp_neg = neg.exp()
        .map_err(|e| KgeError::Tensor(format!("sigmoid exp failed: {}", e)))?;
    let one_plus = (exp_neg + 1.0)
        .map_err(|e| KgeError::Tensor(format!("sigmoid add failed: {}", e)))?;
    one_plus.recip()
        .map_err(|e| KgeError::Tensor(format!("sigmoid recip failed: {}", e)))
}

/// Inverse sigmoid: log(p / (1 - p)), with p clamped away from {0, 1}
pub fn logit(tensor: &Tensor) -> Result<Tensor> {
    let eps = 1e-6f32;
    let p = tensor.clamp(eps, 1.0 - eps)
        .map_err(|e| KgeError::Tensor(format!("logit clamp failed: {}", e)))?;
    let one_minus = p.affine(-1.0, 1.0)
        .map_err(|e| KgeError::Tensor(format!("logit 1-p failed: {}", e)))?;
    p.div(&one_minus)
        .and_then(|r| r.log())
        .map_err(|e| KgeError::Tensor(format!("logit log failed: {}", e)))
}

/// Softmax activation along a dimension
///
/// Converts a vector of real numbers to a probability distribution.
pub fn softmax(tensor: &Tensor, dim: usize) -> Result<Tensor> {
    candle_nn::ops::softmax(tensor, dim)
        .map_err(|e| KgeError::Tensor(format!("Softmax failed: {}", e)))
}

/// ReLU activation: max(0, x)
pub fn relu(tensor: &Tensor) -> Result<Tensor> {
    tensor.relu()
        .map_err(|e| KgeError::Tensor(format!("ReLU failed: {}", e)))
}
