//! Per-grounding explanations of a reasoning step

use serde::{Deserialize, Serialize};

use crate::{KgeError, Result};

/// One body literal as the layer saw it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiteralExplanation {
    pub predicate: String,
    /// Row in the atom batch
    pub atom: u32,
    /// Negated in the rule body
    pub negated: bool,
    /// Atom score before the step
    pub score: f32,
    /// Learned polarity in [0, 1] (1 = positive literal)
    pub sign: f32,
    /// Learned relevance in [0, 1] (0 = literal ignored)
    pub relevance: f32,
}

/// One grounding of one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingExplanation {
    /// Rows of the head atoms in the atom batch
    pub head_atoms: Vec<u32>,
    /// Truth of the filtered body conjunction
    pub activation: f32,
    pub literals: Vec<LiteralExplanation>,
    /// Dominant formula slot (clustered reasoner only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleExplanation {
    pub rule: String,
    pub groundings: Vec<GroundingExplanation>,
}

/// Explanation of the last executed reasoning step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub rules: Vec<RuleExplanation>,
}

impl Explanation {
    pub fn rule(&self, name: &str) -> Option<&RuleExplanation> {
        self.rules.iter().find(|r| r.rule == name)
    }

    /// Total number of explained groundings
    pub fn num_groundings(&self) -> usize {
        self.rules.iter().map(|r| r.groundings.len()).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| KgeError::Serialization(format!("Failed to serialize explanation: {}", e)))
    }
}
