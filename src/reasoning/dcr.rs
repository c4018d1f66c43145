//! Deep concept reasoner
//!
//! For every body literal of every rule, two small networks read the atom
//! embedding: a sign network deciding whether the literal should appear
//! positive or negated, and a relevance (filter) network deciding whether it
//! should appear at all. The filtered conjunction becomes the head's score,
//! which makes every prediction explainable literal by literal.

use candle_core::{Tensor, Var};

use super::explanation::{Explanation, GroundingExplanation, LiteralExplanation, RuleExplanation};
use super::grounding::{body_embeddings, body_truth, check_groundings, Aggregation, CheckedGrounding, HeadMessages};
use super::{LayerContext, LayerSettings, ReasonerConfig, ReasonerKind, ReasoningLayer, RuleGroundings};
use crate::kge::RegularizationLosses;
use crate::logic::Rule;
use crate::primitives::{dropout, l2_loss, sigmoid, Activation, Mlp};
use crate::Result;

/// Literal-level view of one rule's groundings
#[derive(Debug)]
pub(crate) struct RuleEvaluation {
    pub grounding: CheckedGrounding,
    /// `[G, B]` in [0, 1]
    pub signs: Tensor,
    /// `[G, B]` in [0, 1]
    pub relevance: Tensor,
    /// `[G, 1]`
    pub activation: Tensor,
    /// Dominant formula slot per grounding
    pub formulas: Option<Vec<usize>>,
}

/// `sign·t + (1 - sign)·(1 - t)` when signed, then `1 - r·(1 - literal)`.
///
/// `truth`, `signs` and `relevance` share a shape.
pub(crate) fn filtered_literals(truth: &Tensor, signs: &Tensor, relevance: &Tensor, signed: bool) -> Result<Tensor> {
    let literal = if signed {
        let agree = (signs * truth)?;
        let disagree = (signs.affine(-1.0, 1.0)? * truth.affine(-1.0, 1.0)?)?;
        (agree + disagree)?
    } else {
        truth.clone()
    };
    Ok((relevance * literal.affine(-1.0, 1.0)?)?.affine(-1.0, 1.0)?)
}

/// Replace head scores with the aggregated activations; negated heads take `1 - a`.
pub(crate) fn replace_heads(
    scores: &Tensor,
    rules: &[Rule],
    evaluations: &[Option<RuleEvaluation>],
    aggregation: Aggregation,
) -> Result<Tensor> {
    let mut messages = HeadMessages::default();
    for (rule, evaluation) in rules.iter().zip(evaluations) {
        let Some(evaluation) = evaluation else { continue };
        let negated = evaluation.activation.affine(-1.0, 1.0)?;
        for (h, literal) in rule.head.iter().enumerate() {
            let value = if literal.negated { negated.clone() } else { evaluation.activation.clone() };
            messages.push(value, evaluation.grounding.head_column(h));
        }
    }
    if messages.is_empty() {
        return Ok(scores.clone());
    }
    let n = scores.dim(0)?;
    let device = scores.device();
    let aggregated = messages.aggregate(aggregation, n, 1, device)?.clamp(0f32, 1f32)?;
    let touched = messages.touched(n, device)?;
    let kept = (scores * touched.affine(-1.0, 1.0)?)?;
    Ok(((aggregated * touched)? + kept)?)
}

/// Activity penalty: mean relevance over all evaluated literals of all rules
pub(crate) fn relevance_activity(evaluations: &[Option<RuleEvaluation>]) -> Result<Option<Tensor>> {
    let means = evaluations
        .iter()
        .flatten()
        .map(|e| e.relevance.mean_all())
        .collect::<candle_core::Result<Vec<_>>>()?;
    if means.is_empty() {
        return Ok(None);
    }
    Ok(Some(Tensor::stack(&means, 0)?.sum_all()?))
}

/// Host-side explanation of evaluated rules
pub(crate) fn explain_evaluations(
    scores: &Tensor,
    rules: &[Rule],
    evaluations: &[Option<RuleEvaluation>],
) -> Result<Explanation> {
    let host_scores = scores.flatten_all()?.to_vec1::<f32>()?;
    let mut explanation = Explanation::default();
    for (rule, evaluation) in rules.iter().zip(evaluations) {
        let mut explained = RuleExplanation { rule: rule.name.clone(), groundings: Vec::new() };
        if let Some(evaluation) = evaluation {
            let grounding = &evaluation.grounding;
            let signs = evaluation.signs.to_vec2::<f32>()?;
            let relevance = evaluation.relevance.to_vec2::<f32>()?;
            let activation = evaluation.activation.flatten_all()?.to_vec1::<f32>()?;
            let (b, h) = (grounding.body_width(), grounding.head_width());
            for g in 0..grounding.groundings {
                let literals = rule
                    .body
                    .iter()
                    .enumerate()
                    .map(|(j, literal)| {
                        let atom = grounding.body[g * b + j];
                        LiteralExplanation {
                            predicate: literal.predicate.clone(),
                            atom,
                            negated: literal.negated,
                            score: host_scores[atom as usize],
                            sign: signs[g][j],
                            relevance: relevance[g][j],
                        }
                    })
                    .collect();
                explained.groundings.push(GroundingExplanation {
                    head_atoms: grounding.head[g * h..(g + 1) * h].to_vec(),
                    activation: activation[g],
                    literals,
                    formula: evaluation.formulas.as_ref().map(|f| f[g]),
                });
            }
        }
        explanation.rules.push(explained);
    }
    Ok(explanation)
}

/// Sign and relevance networks of one body position
#[derive(Debug)]
struct LiteralNetworks {
    sign: Mlp,
    filter: Mlp,
}

#[derive(Debug)]
pub struct DcrLayer {
    settings: LayerSettings,
    temperature: f64,
    signed: bool,
    filter_activity_regularization: f64,
    /// `networks[r][j]` reads body position `j` of rule `r`
    networks: Vec<Vec<LiteralNetworks>>,
}

impl DcrLayer {
    pub fn new(settings: LayerSettings, config: &ReasonerConfig, ctx: &LayerContext<'_>) -> Result<Self> {
        let e = ctx.atom_embedding_size;
        let hidden = config.reasoner_formula_hidden_embedding_size;
        let networks = settings
            .rules
            .iter()
            .map(|rule| {
                rule.body
                    .iter()
                    .map(|_| {
                        Ok(LiteralNetworks {
                            sign: Mlp::new(e, hidden, 1, Activation::Linear, ctx.device)?,
                            filter: Mlp::new(e, hidden, config.filter_num_heads, Activation::Sigmoid, ctx.device)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            settings,
            temperature: config.temperature,
            signed: config.signed,
            filter_activity_regularization: config.filter_activity_regularization,
            networks,
        })
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

        let mut evaluations = Vec::with_capacity(rules.len());
        for ((rule, grounding), networks) in rules.iter().zip(checked).zip(&self.networks) {
            let Some(grounding) = grounding else {
                evaluations.push(None);
                continue;
            };
            let mut signs = Vec::with_capacity(networks.len());
            let mut relevance = Vec::with_capacity(networks.len());
            for (j, net) in networks.iter().enumerate() {
                let x = body_embeddings(&embeddings, &grounding, j)?;
                signs.push(sigmoid(&net.sign.forward(&x)?.affine(1.0 / self.temperature, 0.0)?)?);
                relevance.push(net.filter.forward(&x)?.mean_keepdim(1)?);
            }
            let truth = body_truth(scores, rule, &grounding)?;
            let signs = Tensor::cat(&signs, 1)?;
            let relevance = Tensor::cat(&relevance, 1)?;
            let literals = filtered_literals(&truth, &signs, &relevance, self.signed)?;
            let activation = self.settings.tnorm.conj_many(&literals, 1)?;
            evaluations.push(Some(RuleEvaluation {
                grounding,
                signs,
                relevance,
                activation,
                formulas: None,
            }));
        }
        Ok(evaluations)
    }
}

impl ReasoningLayer for DcrLayer {
    fn kind(&self) -> ReasonerKind {
        ReasonerKind::Dcr
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
            losses.add("dcr.filter_activity", self.filter_activity_regularization, activity)?;
        }
        for (r, networks) in self.networks.iter().enumerate() {
            for (j, net) in networks.iter().enumerate() {
                for w in net.sign.weights().into_iter().chain(net.filter.weights()) {
                    losses.add(format!("dcr.l2.{}.{}", r, j), self.settings.regularization, l2_loss(w.as_tensor())?)?;
                }
            }
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
        self.networks
            .iter()
            .flatten()
            .flat_map(|net| {
                let mut vars = net.sign.trainable_vars();
                vars.extend(net.filter.trainable_vars());
                vars
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::test_support::*;
    use candle_core::Device;

    fn layer(config: &ReasonerConfig) -> DcrLayer {
        let rules = rules();
        DcrLayer::new(settings(Aggregation::Max), config, &context(&rules, &Device::Cpu)).unwrap()
    }

    #[test]
    fn test_filtered_literals() {
        let device = Device::Cpu;
        let truth = Tensor::new(&[[0.8f32, 0.8, 0.8]], &device).unwrap();
        let signs = Tensor::new(&[[1.0f32, 0.0, 1.0]], &device).unwrap();
        let relevance = Tensor::new(&[[1.0f32, 1.0, 0.0]], &device).unwrap();
        let out = filtered_literals(&truth, &signs, &relevance, true).unwrap();
        let out = out.to_vec2::<f32>().unwrap();
        assert!((out[0][0] - 0.8).abs() < 1e-6);
        assert!((out[0][1] - 0.2).abs() < 1e-6);
        // Irrelevant literals are true
        assert!((out[0][2] - 1.0).abs() < 1e-6);

        let unsigned = filtered_literals(&truth, &signs, &relevance, false).unwrap();
        assert!((unsigned.to_vec2::<f32>().unwrap()[0][1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_dcr_step() {
        let layer = layer(&ReasonerConfig { filter_activity_regularization: 0.1, ..config("dcr") });
        let mut losses = RegularizationLosses::new();
        let (s, e) = layer
            .step(&scores(), &embeddings(), &groundings(), &mut losses, true)
            .unwrap();
        assert_valid_step(&s, &e);
        assert!(losses.names().any(|n| n == "dcr.filter_activity"));
        // One body literal, sign + filter MLPs of 4 vars each
        assert_eq!(layer.trainable_vars().len(), 8);
    }

    #[test]
    fn test_dcr_explanation_per_grounding() {
        let layer = layer(&config("dcr"));
        let scores = scores();
        let explanation = layer.explain(&scores, &embeddings(), &groundings()).unwrap();
        assert_eq!(explanation.rules.len(), 1);
        assert_eq!(explanation.num_groundings(), 2);

        let first = &explanation.rules[0].groundings[0];
        assert_eq!(first.head_atoms, vec![2]);
        assert_eq!(first.literals.len(), 1);
        assert_eq!(first.literals[0].atom, 0);
        assert!((first.literals[0].score - 0.9).abs() < 1e-6);
        assert!((0.0..=1.0).contains(&first.literals[0].sign));
        assert!(first.formula.is_none());
    }

    #[test]
    fn test_explanation_matches_step() {
        let layer = layer(&config("dcr"));
        let (scores, embeddings) = (scores(), embeddings());
        let mut losses = RegularizationLosses::new();
        let (s, _) = layer.step(&scores, &embeddings, &groundings(), &mut losses, false).unwrap();
        let explanation = layer.explain(&scores, &embeddings, &groundings()).unwrap();
        let s = s.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for g in &explanation.rules[0].groundings {
            assert!((s[g.head_atoms[0] as usize] - g.activation).abs() < 1e-5);
        }
    }

    #[test]
    fn test_negated_head_takes_complement() {
        use crate::logic::Literal;
        let rules = vec![Rule::new("r", vec![Literal::new("p", ["X"])], vec![Literal::new("q", ["X"]).negate()])];
        let layer = DcrLayer::new(
            LayerSettings { rules: rules.clone(), ..settings(Aggregation::Max) },
            &config("dcr"),
            &context(&rules, &Device::Cpu),
        )
        .unwrap();
        let (scores, embeddings) = (scores(), embeddings());
        let mut losses = RegularizationLosses::new();
        let (s, _) = layer.step(&scores, &embeddings, &groundings(), &mut losses, false).unwrap();
        let explanation = layer.explain(&scores, &embeddings, &groundings()).unwrap();
        let s = s.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let g = &explanation.rules[0].groundings[0];
        assert!((s[2] - (1.0 - g.activation)).abs() < 1e-5);
    }
}
