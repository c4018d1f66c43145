//! Reasoner configuration

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::grounding::Aggregation;
use crate::primitives::TNorm;
use crate::{KgeError, Result};

/// Reasoning layer variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonerKind {
    /// Deep concept reasoner
    Dcr,
    /// Clustered deep concept reasoner
    Cdcr,
    /// Relational reasoning network
    R2n,
    /// Semantic-based regularization
    Sbr,
    /// Gated semantic-based regularization
    Gsbr,
    /// Relational neural machine
    Rnm,
    /// Deep stochastic logic
    Dsl,
}

impl ReasonerKind {
    /// Variants whose steps can be explained
    pub fn is_explainable(self) -> bool {
        matches!(self, ReasonerKind::Dcr | ReasonerKind::Cdcr)
    }
}

impl FromStr for ReasonerKind {
    type Err = KgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dcr" => Ok(ReasonerKind::Dcr),
            "cdcr" => Ok(ReasonerKind::Cdcr),
            "r2n" => Ok(ReasonerKind::R2n),
            "sbr" => Ok(ReasonerKind::Sbr),
            "gsbr" => Ok(ReasonerKind::Gsbr),
            "rnm" => Ok(ReasonerKind::Rnm),
            "dsl" => Ok(ReasonerKind::Dsl),
            other => Err(KgeError::Config(format!(
                "Unknown reasoning model '{}', expected one of dcr, cdcr, r2n, sbr, gsbr, rnm, dsl",
                other
            ))),
        }
    }
}

impl fmt::Display for ReasonerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReasonerKind::Dcr => "dcr",
            ReasonerKind::Cdcr => "cdcr",
            ReasonerKind::R2n => "r2n",
            ReasonerKind::Sbr => "sbr",
            ReasonerKind::Gsbr => "gsbr",
            ReasonerKind::Rnm => "rnm",
            ReasonerKind::Dsl => "dsl",
        };
        write!(f, "{}", name)
    }
}

/// How R2N turns updated embeddings into scores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    /// Recompute every score from the updated embeddings
    Full,
    /// Disjoin the old score with the score of the aggregated message
    Residual,
}

impl FromStr for PredictionType {
    type Err = KgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "full" => Ok(PredictionType::Full),
            "residual" => Ok(PredictionType::Residual),
            other => Err(KgeError::Config(format!("Unknown r2n prediction type '{}'", other))),
        }
    }
}

/// Configuration of the reasoning stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonerConfig {
    /// Variant name (dcr, cdcr, r2n, sbr, gsbr, rnm, dsl)
    pub reasoner: String,
    /// Number of unrolled steps; 0 disables reasoning
    pub reasoner_depth: usize,
    /// One layer reused at every depth instead of one layer per depth
    pub reasoner_single_model: bool,
    /// sum, mean or max
    pub aggregation_type: String,
    /// Sign sharpness for dcr/cdcr
    pub temperature: f64,
    /// Learn literal polarity (dcr/cdcr)
    pub signed: bool,
    pub filter_num_heads: usize,
    pub filter_activity_regularization: f64,
    pub reasoner_regularization: f64,
    pub reasoner_dropout_rate: f32,
    pub reasoner_formula_hidden_embedding_size: usize,
    /// Width of the embeddings R2N reasons over
    pub reasoner_atom_embedding_size: usize,
    #[serde(default)]
    pub cdcr_use_positional_embeddings: bool,
    #[serde(default = "default_num_formulas")]
    pub cdcr_num_formulas: usize,
    #[serde(default = "default_prediction_type")]
    pub r2n_prediction_type: String,
    /// Fuzzy semantics (product, godel, lukasiewicz)
    #[serde(default = "default_tnorm")]
    pub tnorm: String,
}

fn default_num_formulas() -> usize {
    4
}

fn default_prediction_type() -> String {
    "full".into()
}

fn default_tnorm() -> String {
    TNorm::default().to_string()
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            reasoner: "dcr".into(),
            reasoner_depth: 1,
            reasoner_single_model: true,
            aggregation_type: "max".into(),
            temperature: 1.0,
            signed: true,
            filter_num_heads: 1,
            filter_activity_regularization: 0.0,
            reasoner_regularization: 0.0,
            reasoner_dropout_rate: 0.0,
            reasoner_formula_hidden_embedding_size: 16,
            reasoner_atom_embedding_size: 16,
            cdcr_use_positional_embeddings: false,
            cdcr_num_formulas: default_num_formulas(),
            r2n_prediction_type: default_prediction_type(),
            tnorm: default_tnorm(),
        }
    }
}

impl ReasonerConfig {
    pub fn kind(&self) -> Result<ReasonerKind> {
        self.reasoner.parse()
    }

    pub fn aggregation(&self) -> Result<Aggregation> {
        self.aggregation_type.parse()
    }

    pub fn prediction_type(&self) -> Result<PredictionType> {
        self.r2n_prediction_type.parse()
    }

    pub fn tnorm(&self) -> Result<TNorm> {
        self.tnorm.parse()
    }

    pub fn validate(&self) -> Result<()> {
        self.kind()?;
        self.aggregation()?;
        self.prediction_type()?;
        self.tnorm()?;
        if self.reasoner_depth == 0 {
            return Ok(());
        }
        if self.temperature <= 0.0 {
            return Err(KgeError::Config(format!("temperature must be > 0, got {}", self.temperature)));
        }
        if self.filter_num_heads == 0 || self.reasoner_formula_hidden_embedding_size == 0 {
            return Err(KgeError::Config(
                "filter_num_heads and reasoner_formula_hidden_embedding_size must be > 0".into(),
            ));
        }
        if self.reasoner_atom_embedding_size == 0 || self.cdcr_num_formulas == 0 {
            return Err(KgeError::Config(
                "reasoner_atom_embedding_size and cdcr_num_formulas must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.reasoner_dropout_rate) {
            return Err(KgeError::Config(format!(
                "reasoner_dropout_rate must be in [0, 1), got {}",
                self.reasoner_dropout_rate
            )));
        }
        if self.reasoner_regularization < 0.0 || self.filter_activity_regularization < 0.0 {
            return Err(KgeError::Config("reasoner regularization coefficients must be >= 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        for name in ["dcr", "CDCR", "r2n", "sbr", "gsbr", "rnm", "dsl"] {
            let kind: ReasonerKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name.to_lowercase());
        }
        assert!(matches!("mlp".parse::<ReasonerKind>(), Err(KgeError::Config(_))));
    }

    #[test]
    fn test_explainable_kinds() {
        assert!(ReasonerKind::Dcr.is_explainable());
        assert!(ReasonerKind::Cdcr.is_explainable());
        assert!(!ReasonerKind::R2n.is_explainable());
        assert!(!ReasonerKind::Sbr.is_explainable());
    }

    #[test]
    fn test_validate() {
        ReasonerConfig::default().validate().unwrap();

        let config = ReasonerConfig { aggregation_type: "median".into(), ..Default::default() };
        assert!(matches!(config.validate(), Err(KgeError::Config(_))));

        let config = ReasonerConfig { r2n_prediction_type: "partial".into(), ..Default::default() };
        assert!(matches!(config.validate(), Err(KgeError::Config(_))));

        let config = ReasonerConfig { temperature: 0.0, ..Default::default() };
        assert!(config.validate().is_err());

        // Widths are irrelevant without reasoning
        let config = ReasonerConfig { reasoner_depth: 0, temperature: 0.0, ..Default::default() };
        config.validate().unwrap();
    }

    #[test]
    fn test_serde_defaults() {
        let json = r#"{
            "reasoner": "r2n",
            "reasoner_depth": 2,
            "reasoner_single_model": false,
            "aggregation_type": "sum",
            "temperature": 1.0,
            "signed": true,
            "filter_num_heads": 2,
            "filter_activity_regularization": 0.0,
            "reasoner_regularization": 0.0,
            "reasoner_dropout_rate": 0.0,
            "reasoner_formula_hidden_embedding_size": 8,
            "reasoner_atom_embedding_size": 8
        }"#;
        let config: ReasonerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cdcr_num_formulas, 4);
        assert_eq!(config.prediction_type().unwrap(), PredictionType::Full);
        assert_eq!(config.tnorm().unwrap(), TNorm::Product);
    }
}
