//! Collective model configuration
//!
//! Flat on the wire: the KGE and reasoner sections are flattened into one
//! JSON object.

use serde::{Deserialize, Serialize};

use crate::kge::KgeConfig;
use crate::reasoning::ReasonerConfig;
use crate::{KgeError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectiveConfig {
    #[serde(flatten)]
    pub kge: KgeConfig,
    #[serde(flatten)]
    pub reasoner: ReasonerConfig,
    /// Disjoin the reasoned task scores with the concept scores
    pub resnet: bool,
    /// Gate between concept and reasoned atom embeddings, then rescore
    pub embedding_resnet: bool,
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            kge: KgeConfig::default(),
            reasoner: ReasonerConfig::default(),
            resnet: true,
            embedding_resnet: false,
        }
    }
}

impl CollectiveConfig {
    /// Parse from JSON, then validate
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| KgeError::Serialization(format!("Invalid collective config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| KgeError::Serialization(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.kge.validate()?;
        self.reasoner.validate()
    }
}
