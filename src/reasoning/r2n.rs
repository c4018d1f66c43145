//! Relational reasoning network layer
//!
//! Works on atom embeddings: for every grounding, a per-rule MLP reads the
//! body atoms (embedding and score) and emits one message per head literal.
//! Messages are aggregated into the head atoms' embeddings, from which the
//! scores are recomputed.

use candle_core::{Tensor, Var};

use super::config::PredictionType;
use super::grounding::{body_embeddings, check_groundings, HeadMessages};
use super::{LayerContext, LayerSettings, ReasonerConfig, ReasonerKind, ReasoningLayer, RuleGroundings};
use crate::kge::{OutputFn, RegularizationLosses, ScoringKind};
use crate::primitives::{dropout, index_tensor, l2_loss, Activation, Dense, Mlp};
use crate::Result;

#[derive(Debug)]
pub struct R2nLayer {
    settings: LayerSettings,
    prediction: PredictionType,
    output_fn: OutputFn,
    atom_embedding_size: usize,
    /// `E → E_r`, present when the reasoner width differs from the atom width
    projection: Option<Dense>,
    /// One message MLP per rule: `B·(E_r + 1) → H·E`
    messengers: Vec<Mlp>,
}

impl R2nLayer {
    pub fn new(settings: LayerSettings, config: &ReasonerConfig, ctx: &LayerContext<'_>) -> Result<Self> {
        let e = ctx.atom_embedding_size;
        let reasoner_width = config.reasoner_atom_embedding_size;
        let projection = if reasoner_width != e {
            Some(Dense::new(e, reasoner_width, Activation::Linear, ctx.device)?)
        } else {
            None
        };
        let messengers = settings
            .rules
            .iter()
            .map(|rule| {
                Mlp::new(
                    rule.body.len() * (reasoner_width + 1),
                    config.reasoner_formula_hidden_embedding_size,
                    rule.head.len() * e,
                    Activation::Linear,
                    ctx.device,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        // RotatE's margin output is tied to rotation distances, not to free messages
        let output_fn = match ctx.scoring {
            ScoringKind::RotatE => OutputFn::SumSigmoid,
            _ => ctx.output_fn,
        };

        Ok(Self {
            settings,
            prediction: config.prediction_type()?,
            output_fn,
            atom_embedding_size: e,
            projection,
            messengers,
        })
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction
    }
}

impl ReasoningLayer for R2nLayer {
    fn kind(&self) -> ReasonerKind {
        ReasonerKind::R2n
    }

    fn step(
        &self,
        scores: &Tensor,
        embeddings: &Tensor,
        rule_groundings: &RuleGroundings,
        losses: &mut RegularizationLosses,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let rules = &self.settings.rules;
        let n = scores.dim(0)?;
        let e = self.atom_embedding_size;
        let checked = check_groundings(rules, rule_groundings, n)?;

        let reasoner_embeddings = match &self.projection {
            Some(p) => p.forward(embeddings)?,
            None => embeddings.clone(),
        };
        let flat_scores = scores.flatten_all()?;

        let mut messages = HeadMessages::default();
        for ((rule, grounding), messenger) in rules.iter().zip(checked.iter()).zip(&self.messengers) {
            let Some(grounding) = grounding else { continue };
            let mut inputs = Vec::with_capacity(2 * rule.body.len());
            for j in 0..rule.body.len() {
                inputs.push(body_embeddings(&reasoner_embeddings, grounding, j)?);
                let ids = index_tensor(&grounding.body_column(j), scores.device())?;
                inputs.push(flat_scores.index_select(&ids, 0)?.unsqueeze(1)?);
            }
            let inputs = dropout(&Tensor::cat(&inputs, 1)?, self.settings.dropout_rate, train)?;
            let out = messenger.forward(&inputs)?;
            for h in 0..rule.head.len() {
                messages.push(out.narrow(1, h * e, e)?, grounding.head_column(h));
            }
        }

        for (i, messenger) in self.messengers.iter().enumerate() {
            for (k, w) in messenger.weights().into_iter().enumerate() {
                losses.add(format!("r2n.l2.{}.{}", i, k), self.settings.regularization, l2_loss(w.as_tensor())?)?;
            }
        }
        if let Some(p) = &self.projection {
            losses.add("r2n.l2.projection", self.settings.regularization, l2_loss(p.weight.as_tensor())?)?;
        }

        if messages.is_empty() {
            return Ok((scores.clone(), embeddings.clone()));
        }
        let device = scores.device();
        let aggregated = messages.aggregate(self.settings.aggregation, n, e, device)?;
        let updated = (embeddings + &aggregated)?;

        let scores = match self.prediction {
            PredictionType::Full => self.output_fn.apply(&updated)?.unsqueeze(1)?,
            PredictionType::Residual => {
                let touched = messages.touched(n, device)?;
                let message_scores = self
                    .output_fn
                    .apply(&aggregated)?
                    .unsqueeze(1)?
                    .clamp(0f32, 1f32)?
                    .broadcast_mul(&touched)?;
                self.settings.tnorm.disj(scores, &message_scores)?
            }
        };
        Ok((scores, updated))
    }

    fn trainable_vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = self.messengers.iter().flat_map(Mlp::trainable_vars).collect();
        if let Some(p) = &self.projection {
            vars.extend(p.trainable_vars());
        }
        vars
    }
}
