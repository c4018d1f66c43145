//! Core Tensor Operations
//!
//! Device selection, gathering, penalties and losses used across the crate.
//!
//! ## Device selection
//!
//! Force CPU mode with:
//! ```bash
//! export AN_KGE_NO_GPU=1
//! ```

use crate::{KgeError, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{info, warn};

// ============================================================================
// Environment-controlled Device Selection
// ============================================================================

/// Check if GPU is disabled via environment variable.
///
/// Set `AN_KGE_NO_GPU=1` to force CPU-only mode.
pub fn gpu_disabled() -> bool {
    std::env::var("AN_KGE_NO_GPU")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Get the best available device for tensor operations
///
/// Priority:
/// 1. Check `AN_KGE_NO_GPU` env var (forces CPU if set)
/// 2. Metal (Apple Silicon)
/// 3. CUDA (NVIDIA GPUs)
/// 4. CPU (fallback)
pub fn best_device() -> Device {
    if gpu_disabled() {
        info!("💻 Using CPU device (AN_KGE_NO_GPU set)");
        return Device::Cpu;
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("🍎 Using Metal device (Apple Silicon)");
            return device;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            info!("🟢 Using CUDA device (NVIDIA GPU)");
            return device;
        }
    }

    info!("💻 Using CPU device");
    Device::Cpu
}

// ============================================================================
// Gradient control and gathering
// ============================================================================

/// Block gradient flow through `tensor`.
///
/// The returned tensor has the same values but is a leaf of the graph:
/// `backward()` never reaches the variables that produced `tensor` through it.
pub fn stop_gradient(tensor: &Tensor) -> Tensor {
    tensor.detach()
}

/// Gather rows of `table` by a 1D index tensor (`u32`/`i64`).
///
/// Zero indices yield a `[0, ...]` tensor with the table's trailing shape.
pub fn gather_rows(table: &Tensor, indices: &Tensor) -> Result<Tensor> {
    if indices.elem_count() == 0 {
        let mut shape = table.dims().to_vec();
        shape[0] = 0;
        return Tensor::zeros(shape, table.dtype(), table.device())
            .map_err(|e| KgeError::Tensor(format!("gather_rows empty failed: {}", e)));
    }
    table
        .index_select(indices, 0)
        .map_err(|e| KgeError::Tensor(format!("gather_rows failed: {}", e)))
}

/// Build a `u32` index tensor from host indices.
pub fn index_tensor(indices: &[u32], device: &Device) -> Result<Tensor> {
    Tensor::from_vec(indices.to_vec(), indices.len(), device)
        .map_err(|e| KgeError::Tensor(format!("index tensor failed: {}", e)))
}

/// Read a 1D or 2D index tensor back to the host as `u32`s (row-major).
pub fn host_indices(indices: &Tensor) -> Result<Vec<u32>> {
    indices
        .to_dtype(DType::U32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(|e| KgeError::Tensor(format!("host_indices failed: {}", e)))
}

// ============================================================================
// Dropout and penalties
// ============================================================================

/// Inverted dropout, applied only when `train` is set and `rate > 0`.
pub fn dropout(tensor: &Tensor, rate: f32, train: bool) -> Result<Tensor> {
    if !train || rate <= 0.0 || tensor.elem_count() == 0 {
        return Ok(tensor.clone());
    }
    if rate >= 1.0 {
        warn!(rate, "dropout rate >= 1 ignored");
        return Ok(tensor.clone());
    }
    candle_nn::ops::dropout(tensor, rate)
        .map_err(|e| KgeError::Tensor(format!("dropout failed: {}", e)))
}

/// L2 penalty: Σx² / 2, a scalar tensor
pub fn l2_loss(tensor: &Tensor) -> Result<Tensor> {
    tensor
        .sqr()
        .and_then(|t| t.sum_all())
        .and_then(|t| t.affine(0.5, 0.0))
        .map_err(|e| KgeError::Tensor(format!("l2_loss failed: {}", e)))
}

/// L1 penalty: Σ|x|, a scalar tensor
pub fn l1_loss(tensor: &Tensor) -> Result<Tensor> {
    tensor
        .abs()
        .and_then(|t| t.sum_all())
        .map_err(|e| KgeError::Tensor(format!("l1_loss failed: {}", e)))
}

/// Cubic N3 penalty: Σ|x|³, a scalar tensor
pub fn n3_loss(tensor: &Tensor) -> Result<Tensor> {
    tensor
        .abs()
        .and_then(|t| t.powf(3.0))
        .and_then(|t| t.sum_all())
        .map_err(|e| KgeError::Tensor(format!("n3_loss failed: {}", e)))
}

/// Binary cross-entropy loss
///
/// BCE = -[y * log(p) + (1-y) * log(1-p)]
pub fn binary_cross_entropy(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let eps = 1e-7f32;
    let pred_clamped = pred
        .clamp(eps, 1.0 - eps)
        .map_err(|e| KgeError::Tensor(format!("Clamp failed: {}", e)))?;
    let log_p = pred_clamped
        .log()
        .map_err(|e| KgeError::Tensor(format!("Log failed: {}", e)))?;
    let log_1_p = pred_clamped
        .affine(-1.0, 1.0)
        .and_then(|t| t.log())
        .map_err(|e| KgeError::Tensor(format!("Log 1-p failed: {}", e)))?;

    let term1 = target
        .mul(&log_p)
        .map_err(|e| KgeError::Tensor(format!("BCE term1 failed: {}", e)))?;
    let term2 = target
        .affine(-1.0, 1.0)
        .and_then(|t| t.mul(&log_1_p))
        .map_err(|e| KgeError::Tensor(format!("BCE term2 failed: {}", e)))?;

    (term1 + term2)
        .and_then(|t| t.neg())
        .and_then(|t| t.mean_all())
        .map_err(|e| KgeError::Tensor(format!("BCE mean failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    fn tensor(vals: &[f32]) -> Tensor {
        Tensor::from_vec(vals.to_vec(), vals.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_best_device() {
        let device = best_device();
        assert!(matches!(
            device,
            Device::Cpu | Device::Metal(_) | Device::Cuda(_)
        ));
    }

    #[test]
    fn test_stop_gradient_blocks_backward() {
        let v = Var::from_tensor(&tensor(&[1.0, 2.0])).unwrap();
        let w = Var::from_tensor(&tensor(&[3.0, 4.0])).unwrap();
        let blocked = stop_gradient(&v.as_tensor().sqr().unwrap());
        let loss = (blocked + w.as_tensor()).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(v.as_tensor()).is_none());
        assert!(grads.get(w.as_tensor()).is_some());
    }

    #[test]
    fn test_gather_rows() {
        let table = Tensor::new(&[[0f32, 0.0], [1.0, 1.0], [2.0, 2.0]], &Device::Cpu).unwrap();
        let idx = index_tensor(&[2, 0, 2], &Device::Cpu).unwrap();
        let rows = gather_rows(&table, &idx).unwrap();
        assert_eq!(rows.to_vec2::<f32>().unwrap(), vec![vec![2.0, 2.0], vec![0.0, 0.0], vec![2.0, 2.0]]);

        let empty = index_tensor(&[], &Device::Cpu).unwrap();
        assert_eq!(gather_rows(&table, &empty).unwrap().dims(), &[0, 2]);
    }

    #[test]
    fn test_penalties() {
        let t = tensor(&[1.0, -2.0]);
        assert!((l2_loss(&t).unwrap().to_scalar::<f32>().unwrap() - 2.5).abs() < 1e-5);
        assert!((l1_loss(&t).unwrap().to_scalar::<f32>().unwrap() - 3.0).abs() < 1e-5);
        assert!((n3_loss(&t).unwrap().to_scalar::<f32>().unwrap() - 9.0).abs() < 1e-4);
    }

    #[test]
    fn test_dropout_inactive_at_inference() {
        let t = tensor(&[1.0, 2.0, 3.0]);
        let out = dropout(&t, 0.5, false).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
        let out = dropout(&t, 0.0, true).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_binary_cross_entropy() {
        let pred = tensor(&[0.9, 0.1]);
        let target = tensor(&[1.0, 0.0]);
        let loss = binary_cross_entropy(&pred, &target).unwrap().to_scalar::<f32>().unwrap();
        // -ln(0.9)
        assert!((loss - 0.10536).abs() < 1e-3);
    }
}
