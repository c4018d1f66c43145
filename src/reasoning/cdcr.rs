//! Clustered deep concept reasoner
//!
//! Like DCR, but the sign and relevance networks are not owned by a rule:
//! `num_formulas` formula slots are shared across all rules and each grounding
//! softly picks a slot by attending over its body embeddings. Learned
//! positional embeddings can tell body positions apart.

use candle_core::{Device, Tensor, Var};

use super::dcr::{explain_evaluations, filtered_literals, relevance_activity, replace_heads, RuleEvaluation};
use super::grounding::{body_embeddings, body_truth, check_groundings};
use super::{
    Explanation, LayerContext, LayerSettings, ReasonerConfig, ReasonerKind, ReasoningLayer, RuleGroundings,
};
use crate::kge::RegularizationLosses;
use crate::primitives::{dropout, l2_loss, sigmoid, softmax, Activation, Dense};
use crate::{KgeError, Result};

#[derive(Debug)]
pub struct CdcrLayer {
    settings: LayerSettings,
    temperature: f64,
    signed: bool,
    filter_activity_regularization: f64,
    num_formulas: usize,
    filter_heads: usize,
    /// Shared literal encoder `E → hidden`
    encoder: Dense,
    /// `hidden → F` sign logits
    sign: Dense,
    /// `hidden → F·heads` relevance
    filter: Dense,
    /// `hidden → F` formula attention logits
    selector: Dense,
    /// `[B_max, E]`
    positions: Option<Var>,
}

impl CdcrLayer {
    pub fn new(settings: LayerSettings, config: &ReasonerConfig, ctx: &LayerContext<'_>) -> Result<Self> {
        let e = ctx.atom_embedding_size;
        let hidden = config.reasoner_formula_hidden_embedding_size;
        let formulas = config.cdcr_num_formulas;
        let heads = config.filter_num_heads;

        let max_body = settings.rules.iter().map(|r| r.body.len()).max().unwrap_or(0);
        let positions = if config.cdcr_use_positional_embeddings && max_body > 0 {
            Some(positional_table(max_body, e, ctx.device)?)
        } else {
            None
        };

        Ok(Self {
            temperature: config.temperature,
            signed: config.signed,
            filter_activity_regularization: config.filter_activity_regularization,
            num_formulas: formulas,
            filter_heads: heads,
            encoder: Dense::new(e, hidden, Activation::ReLU, ctx.device)?,
            sign: Dense::new(hidden, formulas, Activation::Linear, ctx.device)?,
            filter: Dense::new(hidden, formulas * heads, Activation::Sigmoid, ctx.device)?,
            selector: Dense::new(hidden, formulas, Activation::Linear, ctx.device)?,
            positions,
            settings,
        })
    }

    pub fn num_formulas(&self) -> usize {
        self.num_formulas
    }

    fn dense_layers(&self) -> [&Dense; 4] {
        [&self.encoder, &self.sign, &self.filter, &self.selector]
    }

    fn evaluate(
        &self,
        scores: &Tensor,
        embeddings: &Tensor,
        rule_groundings: &RuleGroundings,
        train: bool,
    ) -> Result<Vec<Option<RuleEvaluation>>> {
        let rules = &self.settings.rules;
        let checked = check_groundings(rules, rule_groundings, scores.dim(0)?)?;
        let embeddings = dropout(embeddings, self.settings.dropout_rate, train)?;
        let (f, heads) = (self.num_formulas, self.filter_heads);

        let mut evaluations = Vec::with_capacity(rules.len());
        for (rule, grounding) in rules.iter().zip(checked) {
            let Some(grounding) = grounding else {
                evaluations.push(None);
                continue;
            };
            let g = grounding.groundings;

            let mut encoded = Vec::with_capacity(rule.body.len());
            for j in 0..rule.body.len() {
                let mut x = body_embeddings(&embeddings, &grounding, j)?;
                if let Some(positions) = &self.positions {
                    x = x.broadcast_add(&positions.as_tensor().narrow(0, j, 1)?)?;
                }
                encoded.push(self.encoder.forward(&x)?);
            }

            // [G, B, F]
            let signs = Tensor::stack(
                &encoded
                    .iter()
                    .map(|h| sigmoid(&self.sign.forward(h)?.affine(1.0 / self.temperature, 0.0)?))
                    .collect::<Result<Vec<_>>>()?,
                1,
            )?;
            let relevance = Tensor::stack(
                &encoded
                    .iter()
                    .map(|h| Ok(self.filter.forward(h)?.reshape((g, f, heads))?.mean(2)?))
                    .collect::<Result<Vec<_>>>()?,
                1,
            )?;

            // Formula attention from the mean body encoding, [G, F]
            let key = Tensor::stack(&encoded, 0)?.mean(0)?;
            let weights = softmax(&self.selector.forward(&key)?, 1)?;

            let truth = body_truth(scores, rule, &grounding)?.unsqueeze(2)?.broadcast_as(signs.shape())?;
            let literals = filtered_literals(&truth.contiguous()?, &signs, &relevance, self.signed)?;
            // [G, 1, F] → [G, F] → [G, 1]
            let per_formula = self.settings.tnorm.conj_many(&literals, 1)?.squeeze(1)?;
            let activation = (per_formula * &weights)?.sum_keepdim(1)?;

            let mix = weights.unsqueeze(1)?;
            let formulas = argmax_rows(&weights)?;
            evaluations.push(Some(RuleEvaluation {
                grounding,
                signs: signs.broadcast_mul(&mix)?.sum(2)?,
                relevance: relevance.broadcast_mul(&mix)?.sum(2)?,
                activation,
                formulas: Some(formulas),
            }));
        }
        Ok(evaluations)
    }
}

fn positional_table(rows: usize, width: usize, device: &Device) -> Result<Var> {
    let init = Tensor::randn(0.0f32, 0.1, (rows, width), device)
        .map_err(|e| KgeError::Tensor(format!("Failed to create positional embeddings: {}", e)))?;
    Var::from_tensor(&init).map_err(|e| KgeError::Tensor(format!("Failed to create positional var: {}", e)))
}

/// Index of the largest entry of every row of a `[G, F]` tensor
fn argmax_rows(weights: &Tensor) -> Result<Vec<usize>> {
    Ok(weights
        .argmax(1)?
        .to_vec1::<u32>()?
        .into_iter()
        .map(|i| i as usize)
        .collect())
}

impl ReasoningLayer for CdcrLayer {
    fn kind(&self) -> ReasonerKind {
        ReasonerKind::Cdcr
    }

    fn step(
        &self,
        scores: &Tensor,
        embeddings: &Tensor,
        rule_groundings: &RuleGroundings,
        losses: &mut RegularizationLosses,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let evaluations = self.evaluate(scores, embeddings, rule_groundings, train)?;

        if let Some(activity) = relevance_activity(&evaluations)? {
            losses.add("cdcr.filter_activity", self.filter_activity_regularization, activity)?;
        }
        for (i, layer) in self.dense_layers().into_iter().enumerate() {
            losses.add(format!("cdcr.l2.{}", i), self.settings.regularization, l2_loss(layer.weight.as_tensor())?)?;
        }

        let scores = replace_heads(scores, &self.settings.rules, &evaluations, self.settings.aggregation)?;
        Ok((scores, embeddings.clone()))
    }

    fn explain(&self, scores: &Tensor, embeddings: &Tensor, rule_groundings: &RuleGroundings) -> Result<Explanation> {
        let evaluations = self.evaluate(scores, embeddings, rule_groundings, false)?;
        explain_evaluations(scores, &self.settings.rules, &evaluations)
    }

    fn is_explainable(&self) -> bool {
        true
    }

    fn trainable_vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = self.dense_layers().into_iter().flat_map(Dense::trainable_vars).collect();
        if let Some(p) = &self.positions {
            vars.push(p.clone());
        }
        vars
    }
}
