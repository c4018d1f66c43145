//! KGE model configuration

use serde::{Deserialize, Serialize};

use super::scoring::ScoringKind;
use crate::{KgeError, Result};

/// Configuration of the embedding and scoring pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KgeConfig {
    /// Scoring function name, case-insensitive
    /// (distmult, transe, complex, rotate, mode, tucker)
    pub kge: String,
    /// Constant embedding width `E_c`
    pub constant_embedding_size: usize,
    /// Predicate embedding width `E_p` (Tucker's relation size `R`)
    pub predicate_embedding_size: usize,
    /// Atom embedding width `E`
    pub kge_atom_embedding_size: usize,
    /// L2 coefficient
    pub kge_regularization: f64,
    /// N3 coefficient
    #[serde(default)]
    pub kge_regularization_n3: f64,
    pub kge_dropout_rate: f32,
    /// Learned slots for out-of-vocabulary constants (0 disables them)
    #[serde(default)]
    pub num_adaptive_constants: usize,
    /// Adaptive slots attend over the known constants instead of being used directly
    #[serde(default)]
    pub dot_product: bool,
    /// One scorer (with its own parameters) per predicate instead of a shared one
    #[serde(default)]
    pub per_predicate_scorers: bool,
}

impl Default for KgeConfig {
    fn default() -> Self {
        Self {
            kge: "distmult".into(),
            constant_embedding_size: 16,
            predicate_embedding_size: 16,
            kge_atom_embedding_size: 16,
            kge_regularization: 0.0,
            kge_regularization_n3: 0.0,
            kge_dropout_rate: 0.0,
            num_adaptive_constants: 0,
            dot_product: false,
            per_predicate_scorers: false,
        }
    }
}

impl KgeConfig {
    /// Parse from JSON, then validate
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| KgeError::Serialization(format!("Invalid KGE config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn scoring_kind(&self) -> Result<ScoringKind> {
        self.kge.parse()
    }

    /// Check names, widths and rates against the chosen scoring function
    pub fn validate(&self) -> Result<()> {
        let kind = self.scoring_kind()?;
        let e = self.kge_atom_embedding_size;
        if e == 0 || self.constant_embedding_size == 0 || self.predicate_embedding_size == 0 {
            return Err(KgeError::Config(format!(
                "embedding sizes must be > 0 (constant={}, predicate={}, atom={})",
                self.constant_embedding_size, self.predicate_embedding_size, e
            )));
        }
        let expected_constant = kind.constant_width(e);
        if self.constant_embedding_size != expected_constant {
            return Err(KgeError::Config(format!(
                "{} with atom size {} needs constant embedding size {}, got {}",
                kind, e, expected_constant, self.constant_embedding_size
            )));
        }
        let expected_predicate = kind.predicate_width(e, self.predicate_embedding_size);
        if self.predicate_embedding_size != expected_predicate {
            return Err(KgeError::Config(format!(
                "{} with atom size {} needs predicate embedding size {}, got {}",
                kind, e, expected_predicate, self.predicate_embedding_size
            )));
        }
        if !(0.0..1.0).contains(&self.kge_dropout_rate) {
            return Err(KgeError::Config(format!(
                "kge_dropout_rate must be in [0, 1), got {}",
                self.kge_dropout_rate
            )));
        }
        if self.kge_regularization < 0.0 || self.kge_regularization_n3 < 0.0 {
            return Err(KgeError::Config("regularization coefficients must be >= 0".into()));
        }
        if self.dot_product && self.num_adaptive_constants == 0 {
            return Err(KgeError::Config(
                "dot_product requires num_adaptive_constants > 0".into(),
            ));
        }
        Ok(())
    }
}
