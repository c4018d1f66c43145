//! Semantic-based regularization layers
//!
//! Rules act as fixed fuzzy implications: the body conjunction supports the
//! head through a disjunction. The gated variant learns how much to trust
//! each rule.

use candle_core::{DType, Device, Tensor, Var};

use super::grounding::{body_truth, check_groundings, Support};
use super::{LayerSettings, ReasonerKind, ReasoningLayer, RuleGroundings};
use crate::kge::RegularizationLosses;
use crate::primitives::{l2_loss, sigmoid};
use crate::{KgeError, Result};

#[derive(Debug)]
pub struct SbrLayer {
    settings: LayerSettings,
    /// Per-rule gate logits `[R]`, present for the gated variant
    gates: Option<Var>,
}

impl SbrLayer {
    pub fn new(settings: LayerSettings, gated: bool, device: &Device) -> Result<Self> {
        let gates = if gated && !settings.rules.is_empty() {
            Some(
                Var::zeros(settings.rules.len(), DType::F32, device)
                    .map_err(|e| KgeError::Tensor(format!("Failed to create rule gates: {}", e)))?,
            )
        } else {
            None
        };
        Ok(Self { settings, gates })
    }

    pub fn is_gated(&self) -> bool {
        self.gates.is_some()
    }
}

impl ReasoningLayer for SbrLayer {
    fn kind(&self) -> ReasonerKind {
        if self.is_gated() {
            ReasonerKind::Gsbr
        } else {
            ReasonerKind::Sbr
        }
    }

    fn step(
        &self,
        scores: &Tensor,
        embeddings: &Tensor,
        rule_groundings: &RuleGroundings,
        losses: &mut RegularizationLosses,
        _train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let rules = &self.settings.rules;
        let checked = check_groundings(rules, rule_groundings, scores.dim(0)?)?;
        let gates = self.gates.as_ref().map(|g| sigmoid(g.as_tensor())).transpose()?;

        let mut support = Support::default();
        for (r, (rule, grounding)) in rules.iter().zip(checked.iter()).enumerate() {
            let Some(grounding) = grounding else { continue };
            let mut activation = self
                .settings
                .tnorm
                .conj_many(&body_truth(scores, rule, grounding)?, 1)?;
            if let Some(gates) = &gates {
                activation = activation.broadcast_mul(&gates.narrow(0, r, 1)?)?;
            }
            support.route(&activation, rule, grounding);
        }

        if let Some(gates) = &self.gates {
            losses.add("gsbr.l2", self.settings.regularization, l2_loss(gates.as_tensor())?)?;
        }
        let scores = support.disjoin(scores, self.settings.aggregation, self.settings.tnorm)?;
        Ok((scores, embeddings.clone()))
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.gates.iter().cloned().collect()
    }
}
