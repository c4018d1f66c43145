//! Relational neural machine layer
//!
//! Rule activations shift head atoms in logit space, weighted by one learned
//! weight per rule: `s ← σ(logit(s) + Σ_r λ_r · agg_r)`. Negated heads are
//! shifted down.

use candle_core::{DType, Device, Tensor, Var};

use super::grounding::{body_truth, check_groundings, Support};
use super::{LayerSettings, ReasonerKind, ReasoningLayer, RuleGroundings};
use crate::kge::RegularizationLosses;
use crate::primitives::{l2_loss, logit, sigmoid};
use crate::{KgeError, Result};

#[derive(Debug)]
pub struct RnmLayer {
    settings: LayerSettings,
    /// Per-rule weights `[R]`, initialised to 1
    weights: Option<Var>,
}

impl RnmLayer {
    pub fn new(settings: LayerSettings, device: &Device) -> Result<Self> {
        let weights = if settings.rules.is_empty() {
            None
        } else {
            Some(
                Var::ones(settings.rules.len(), DType::F32, device)
                    .map_err(|e| KgeError::Tensor(format!("Failed to create rule weights: {}", e)))?,
            )
        };
        Ok(Self { settings, weights })
    }
}

impl ReasoningLayer for RnmLayer {
    fn kind(&self) -> ReasonerKind {
        ReasonerKind::Rnm
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
        let n = scores.dim(0)?;
        let checked = check_groundings(rules, rule_groundings, n)?;
        let Some(weights) = &self.weights else {
            return Ok((scores.clone(), embeddings.clone()));
        };

        let mut support = Support::default();
        for (r, (rule, grounding)) in rules.iter().zip(checked.iter()).enumerate() {
            let Some(grounding) = grounding else { continue };
            let activation = self
                .settings
                .tnorm
                .conj_many(&body_truth(scores, rule, grounding)?, 1)?
                .broadcast_mul(&weights.as_tensor().narrow(0, r, 1)?)?;
            support.route(&activation, rule, grounding);
        }
        losses.add("rnm.l2", self.settings.regularization, l2_loss(weights.as_tensor())?)?;

        let device = scores.device();
        let aggregation = self.settings.aggregation;
        let positive = support.positive.aggregate(aggregation, n, 1, device)?;
        let negative = support.negative.aggregate(aggregation, n, 1, device)?;
        let shifted = sigmoid(&((logit(scores)? + positive)? - negative)?)?;

        // Atoms that head no grounding keep their exact score
        let touched = support
            .positive
            .touched(n, device)?
            .maximum(&support.negative.touched(n, device)?)?;
        let untouched = touched.affine(-1.0, 1.0)?;
        let scores = ((shifted * &touched)? + (scores * untouched)?)?;
        Ok((scores, embeddings.clone()))
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.weights.iter().cloned().collect()
    }
}
