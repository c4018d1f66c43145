//! Learned dense projections
//!
//! Small fully connected layers used by the residual gate and the reasoning
//! layers. Weights are `Var`s so that the external optimizer can update them.

use candle_core::{DType, Device, Tensor, Var};
use crate::{KgeError, Result};

use super::activations::{relu, sigmoid};

/// Activation applied after a dense projection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    ReLU,
    Sigmoid,
}

/// Fully connected layer: `y = act(x W + b)`
#[derive(Debug)]
pub struct Dense {
    /// Weight matrix: [in_dim, out_dim]
    pub weight: Var,
    /// Bias: [out_dim]
    pub bias: Var,
    pub activation: Activation,
}

impl Dense {
    /// Create a dense layer with Xavier-scaled normal weights and zero bias.
    pub fn new(in_dim: usize, out_dim: usize, activation: Activation, device: &Device) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(KgeError::Config(format!(
                "Dense layer needs non-zero dims, got {}x{}",
                in_dim, out_dim
            )));
        }
        let scale = (2.0f32 / (in_dim + out_dim) as f32).sqrt();

        let weight = Var::from_tensor(
            &Tensor::randn(0.0f32, scale, (in_dim, out_dim), device)
                .map_err(|e| KgeError::Tensor(format!("Failed to create dense weight: {}", e)))?,
        ).map_err(|e| KgeError::Tensor(format!("Failed to create dense weight var: {}", e)))?;

        let bias = Var::zeros(out_dim, DType::F32, device)
            .map_err(|e| KgeError::Tensor(format!("Failed to create dense bias: {}", e)))?;

        Ok(Self { weight, bias, activation })
    }

    pub fn in_dim(&self) -> usize {
        self.weight.as_tensor().dims()[0]
    }

    pub fn out_dim(&self) -> usize {
        self.weight.as_tensor().dims()[1]
    }

    /// Project `[N, in_dim] → [N, out_dim]`. Zero rows pass through as `[0, out_dim]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let rows = x.dim(0)?;
        if rows == 0 {
            return Tensor::zeros((0, self.out_dim()), DType::F32, x.device())
                .map_err(|e| KgeError::Tensor(format!("dense empty output failed: {}", e)));
        }
        let projected = x
            .matmul(self.weight.as_tensor())
            .and_then(|y| y.broadcast_add(self.bias.as_tensor()))
            .map_err(|e| KgeError::Tensor(format!("dense forward failed: {}", e)))?;

        match self.activation {
            Activation::Linear => Ok(projected),
            Activation::ReLU => relu(&projected),
            Activation::Sigmoid => sigmoid(&projected),
        }
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

/// Two-layer perceptron: `Dense(ReLU) → Dense(out_activation)`
#[derive(Debug)]
pub struct Mlp {
    pub hidden: Dense,
    pub output: Dense,
}

impl Mlp {
    pub fn new(
        in_dim: usize,
        hidden_dim: usize,
        out_dim: usize,
        out_activation: Activation,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            hidden: Dense::new(in_dim, hidden_dim, Activation::ReLU, device)?,
            output: Dense::new(hidden_dim, out_dim, out_activation, device)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.output.forward(&self.hidden.forward(x)?)
    }

    /// Weight matrices only (biases are not weight-regularized)
    pub fn weights(&self) -> Vec<&Var> {
        vec![&self.hidden.weight, &self.output.weight]
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.hidden.trainable_vars();
        vars.extend(self.output.trainable_vars());
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_shapes() {
        let device = Device::Cpu;
        let layer = Dense::new(4, 3, Activation::Sigmoid, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (5, 4), &device).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dims(), &[5, 3]);
        for v in y.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((0.0..=1.0).contains(&v));
        }
        assert_eq!(layer.trainable_vars().len(), 2);
    }

    #[test]
    fn test_dense_empty_batch() {
        let device = Device::Cpu;
        let layer = Dense::new(4, 2, Activation::Linear, &device).unwrap();
        let x = Tensor::zeros((0, 4), DType::F32, &device).unwrap();
        assert_eq!(layer.forward(&x).unwrap().dims(), &[0, 2]);
    }

    #[test]
    fn test_dense_rejects_zero_dims() {
        assert!(matches!(
            Dense::new(0, 2, Activation::Linear, &Device::Cpu),
            Err(KgeError::Config(_))
        ));
    }

    #[test]
    fn test_mlp_gradient_flow() {
        let device = Device::Cpu;
        let mlp = Mlp::new(3, 8, 1, Activation::Sigmoid, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (4, 3), &device).unwrap();
        let loss = mlp.forward(&x).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(mlp.output.weight.as_tensor()).is_some());
        assert!(grads.get(mlp.hidden.weight.as_tensor()).is_some());
        assert_eq!(mlp.trainable_vars().len(), 4);
    }
}
