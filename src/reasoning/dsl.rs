//! Deep stochastic logic layer
//!
//! Each rule fires with a learned probability `σ(w_r)`; groundings that share
//! a head combine by noisy-or, `1 - Π(1 - a)`.

use candle_core::{DType, Device, Tensor, Var};

use super::grounding::{body_truth, check_groundings, Aggregation, HeadMessages, Support};
use super::{LayerSettings, ReasonerKind, ReasoningLayer, RuleGroundings};
use crate::kge::RegularizationLosses;
use crate::primitives::{l2_loss, sigmoid};
use crate::{KgeError, Result};

/// Keeps `log(1 - a)` finite when a grounding fires with certainty
const MIN_COMPLEMENT: f32 = 1e-7;

#[derive(Debug)]
pub struct DslLayer {
    settings: LayerSettings,
    /// Per-rule probability logits `[R]`
    weights: Option<Var>,
}

impl DslLayer {
    pub fn new(settings: LayerSettings, device: &Device) -> Result<Self> {
        let weights = if settings.rules.is_empty() {
            None
        } else {
            Some(
                Var::zeros(settings.rules.len(), DType::F32, device)
                    .map_err(|e| KgeError::Tensor(format!("Failed to create rule probabilities: {}", e)))?,
            )
        };
        Ok(Self { settings, weights })
    }

    /// `σ(w)`, one probability per rule
    pub fn rule_probabilities(&self) -> Result<Option<Tensor>> {
        self.weights.as_ref().map(|w| sigmoid(w.as_tensor())).transpose()
    }
}

/// `1 - exp(Σ log(1 - a))` per target atom; 0 where nothing fired
fn noisy_or(messages: &HeadMessages, n: usize, device: &Device) -> Result<Tensor> {
    let log_complement = messages.aggregate(Aggregation::Sum, n, 1, device)?;
    Ok(log_complement.exp()?.affine(-1.0, 1.0)?)
}

impl ReasoningLayer for DslLayer {
    fn kind(&self) -> ReasonerKind {
        ReasonerKind::Dsl
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
        let Some(probabilities) = self.rule_probabilities()? else {
            return Ok((scores.clone(), embeddings.clone()));
        };

        // Routed values are log(1 - a) so that a sum aggregates to the noisy-or
        let mut support = Support::default();
        for (r, (rule, grounding)) in rules.iter().zip(checked.iter()).enumerate() {
            let Some(grounding) = grounding else { continue };
            let activation = self
                .settings
                .tnorm
                .conj_many(&body_truth(scores, rule, grounding)?, 1)?
                .broadcast_mul(&probabilities.narrow(0, r, 1)?)?;
            let log_complement = activation.affine(-1.0, 1.0)?.clamp(MIN_COMPLEMENT, 1f32)?.log()?;
            support.route(&log_complement, rule, grounding);
        }
        if let Some(weights) = &self.weights {
            losses.add("dsl.l2", self.settings.regularization, l2_loss(weights.as_tensor())?)?;
        }

        let tnorm = self.settings.tnorm;
        let device = scores.device();
        let mut out = scores.clone();
        if !support.positive.is_empty() {
            out = tnorm.disj(&out, &noisy_or(&support.positive, n, device)?)?;
        }
        if !support.negative.is_empty() {
            out = tnorm.conj(&out, &tnorm.neg(&noisy_or(&support.negative, n, device)?)?)?;
        }
        Ok((out, embeddings.clone()))
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.weights.iter().cloned().collect()
    }
}
