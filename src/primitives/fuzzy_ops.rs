//! Fuzzy Logic Operators as Tensor Operations
//!
//! Differentiable t-norms used to combine atom truth scores.
//!
//! ## T-norms and S-norms
//!
//! | T-norm      | AND(a,b)          | OR(a,b)          | NOT(a) |
//! |-------------|-------------------|------------------|--------|
//! | Product     | a × b             | a + b - ab       | 1 - a  |
//! | Gödel       | min(a,b)          | max(a,b)         | 1 - a  |
//! | Łukasiewicz | max(0, a + b - 1) | min(1, a + b)    | 1 - a  |
//!
//! Product is the default.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::{KgeError, Result};

/// Fuzzy logic semantics for conjunction and disjunction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TNorm {
    /// AND = ab, OR = a + b - ab
    #[default]
    Product,
    /// AND = min, OR = max
    Godel,
    /// AND = max(0, a + b - 1), OR = min(1, a + b)
    Lukasiewicz,
}

impl TNorm {
    /// Fuzzy AND of two tensors of equal shape
    pub fn conj(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let out = match self {
            TNorm::Product => a.mul(b),
            TNorm::Godel => a.minimum(b),
            TNorm::Lukasiewicz => (a + b).and_then(|s| s.affine(1.0, -1.0)).and_then(|s| s.relu()),
        };
        out.map_err(|e| KgeError::Tensor(format!("{} conj failed: {}", self, e)))
    }

    /// Fuzzy OR of two tensors of equal shape
    ///
    /// # Properties
    /// - OR(a, 0) = a
    /// - OR(a, 1) = 1
    /// - OR(a, b) = OR(b, a)
    pub fn disj(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let out = match self {
            TNorm::Product => (a + b).and_then(|s| s - a.mul(b)?),
            TNorm::Godel => a.maximum(b),
            TNorm::Lukasiewicz => (a + b).and_then(|s| s.clamp(0f32, 1f32)),
        };
        out.map_err(|e| KgeError::Tensor(format!("{} disj failed: {}", self, e)))
    }

    /// Fuzzy NOT: 1 - a (shared by all three semantics)
    pub fn neg(&self, a: &Tensor) -> Result<Tensor> {
        a.affine(-1.0, 1.0)
            .map_err(|e| KgeError::Tensor(format!("{} neg failed: {}", self, e)))
    }

    /// Multi-way AND over the given dimension of a single tensor.
    ///
    /// The reduced dimension is kept, e.g. `[G, B] → [G, 1]` for `dim = 1`.
    pub fn conj_many(&self, values: &Tensor, dim: usize) -> Result<Tensor> {
        let out = match self {
            TNorm::Product => product_keepdim(values, dim),
            TNorm::Godel => values.min_keepdim(dim),
            TNorm::Lukasiewicz => {
                // max(0, Σ a_i - (n - 1))
                let n = values.dim(dim)? as f64;
                values
                    .sum_keepdim(dim)
                    .and_then(|s| s.affine(1.0, -(n - 1.0)))
                    .and_then(|s| s.relu())
            }
        };
        out.map_err(|e| KgeError::Tensor(format!("{} conj_many failed: {}", self, e)))
    }

    /// Multi-way OR over the given dimension of a single tensor (dimension kept)
    pub fn disj_many(&self, values: &Tensor, dim: usize) -> Result<Tensor> {
        let out = match self {
            // 1 - ∏(1 - a_i)
            TNorm::Product => values
                .affine(-1.0, 1.0)
                .and_then(|c| product_keepdim(&c, dim))
                .and_then(|p| p.affine(-1.0, 1.0)),
            TNorm::Godel => values.max_keepdim(dim),
            TNorm::Lukasiewicz => values.sum_keepdim(dim).and_then(|s| s.clamp(0f32, 1f32)),
        };
        out.map_err(|e| KgeError::Tensor(format!("{} disj_many failed: {}", self, e)))
    }
}

/// Product along a dimension, computed as a chain of multiplications so that
/// zeros stay exact and gradients stay defined.
fn product_keepdim(values: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
    let n = values.dim(dim)?;
    if n == 0 {
        let mut shape = values.dims().to_vec();
        shape[dim] = 1;
        return Tensor::ones(shape, values.dtype(), values.device());
    }
    let mut acc = values.narrow(dim, 0, 1)?;
    for i in 1..n {
        acc = acc.mul(&values.narrow(dim, i, 1)?)?;
    }
    Ok(acc)
}

impl fmt::Display for TNorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TNorm::Product => write!(f, "product"),
            TNorm::Godel => write!(f, "godel"),
            TNorm::Lukasiewicz => write!(f, "lukasiewicz"),
        }
    }
}

impl FromStr for TNorm {
    type Err = KgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "product" | "prod" => Ok(TNorm::Product),
            "godel" | "gödel" | "minmax" => Ok(TNorm::Godel),
            "lukasiewicz" | "łukasiewicz" => Ok(TNorm::Lukasiewicz),
            other => Err(KgeError::Config(format!("Unknown t-norm '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn device() -> Device {
        Device::Cpu
    }

    fn tensor(vals: &[f32]) -> Tensor {
        Tensor::from_vec(vals.to_vec(), vals.len(), &device()).unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_product_disj() {
        let a = tensor(&[0.3]);
        let b = tensor(&[0.3]);
        let result = TNorm::Product.disj(&a, &b).unwrap();
        // 0.3 + 0.3 - 0.09 = 0.51
        assert!((scalar(&result) - 0.51).abs() < 0.001);
    }

    #[test]
    fn test_disj_identities() {
        let a = tensor(&[0.2, 0.7]);
        let zeros = tensor(&[0.0, 0.0]);
        let ones = tensor(&[1.0, 1.0]);

        for tnorm in [TNorm::Product, TNorm::Godel, TNorm::Lukasiewicz] {
            let with_zero = tnorm.disj(&a, &zeros).unwrap().to_vec1::<f32>().unwrap();
            assert!((with_zero[0] - 0.2).abs() < 0.001, "{} OR(a,0)", tnorm);
            assert!((with_zero[1] - 0.7).abs() < 0.001, "{} OR(a,0)", tnorm);

            let with_one = tnorm.disj(&a, &ones).unwrap().to_vec1::<f32>().unwrap();
            assert!((with_one[0] - 1.0).abs() < 0.001, "{} OR(a,1)", tnorm);
            assert!((with_one[1] - 1.0).abs() < 0.001, "{} OR(a,1)", tnorm);
        }
    }

    #[test]
    fn test_disj_commutative() {
        let a = tensor(&[0.25]);
        let b = tensor(&[0.6]);
        for tnorm in [TNorm::Product, TNorm::Godel, TNorm::Lukasiewicz] {
            let ab = scalar(&tnorm.disj(&a, &b).unwrap());
            let ba = scalar(&tnorm.disj(&b, &a).unwrap());
            assert!((ab - ba).abs() < 1e-6);
        }
    }

    #[test]
    fn test_conj_semantics() {
        let a = tensor(&[0.8]);
        let b = tensor(&[0.9]);
        assert!((scalar(&TNorm::Product.conj(&a, &b).unwrap()) - 0.72).abs() < 0.001);
        assert!((scalar(&TNorm::Godel.conj(&a, &b).unwrap()) - 0.8).abs() < 0.001);
        assert!((scalar(&TNorm::Lukasiewicz.conj(&a, &b).unwrap()) - 0.7).abs() < 0.001);

        let low = tensor(&[0.2]);
        assert!(scalar(&TNorm::Lukasiewicz.conj(&low, &low).unwrap()).abs() < 0.001);
    }

    #[test]
    fn test_conj_many_rows() {
        // Two groundings with three body literals each
        let values = Tensor::new(&[[0.8f32, 0.9, 0.7], [1.0, 0.5, 0.5]], &device()).unwrap();
        let result = TNorm::Product.conj_many(&values, 1).unwrap();
        assert_eq!(result.dims(), &[2, 1]);
        let vals = result.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((vals[0] - 0.504).abs() < 0.001);
        assert!((vals[1] - 0.25).abs() < 0.001);

        let godel = TNorm::Godel.conj_many(&values, 1).unwrap();
        let vals = godel.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((vals[0] - 0.7).abs() < 0.001);
    }

    #[test]
    fn test_disj_many_noisy_or() {
        let values = Tensor::new(&[[0.3f32, 0.4, 0.2]], &device()).unwrap();
        let result = TNorm::Product.disj_many(&values, 1).unwrap();
        // 1 - 0.7*0.6*0.8 = 0.664
        assert!((scalar(&result) - 0.664).abs() < 0.001);
    }

    #[test]
    fn test_neg() {
        let a = tensor(&[0.3]);
        assert!((scalar(&TNorm::Godel.neg(&a).unwrap()) - 0.7).abs() < 0.001);
    }

    #[test]
    fn test_dtype_preservation() {
        let a = tensor(&[0.3]);
        let b = tensor(&[0.4]);
        for tnorm in [TNorm::Product, TNorm::Godel, TNorm::Lukasiewicz] {
            assert_eq!(tnorm.disj(&a, &b).unwrap().dtype(), DType::F32);
            assert_eq!(tnorm.neg(&a).unwrap().dtype(), DType::F32);
        }
    }

    #[test]
    fn test_from_str() {
        assert_eq!("Product".parse::<TNorm>().unwrap(), TNorm::Product);
        assert_eq!("godel".parse::<TNorm>().unwrap(), TNorm::Godel);
        assert!(matches!("median".parse::<TNorm>(), Err(KgeError::Config(_))));

        let parsed: TNorm = serde_json::from_str("\"lukasiewicz\"").unwrap();
        assert_eq!(parsed, TNorm::Lukasiewicz);
    }
}
