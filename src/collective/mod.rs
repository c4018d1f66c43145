//! Collective model: KGE concept scores refined by unrolled reasoning
//!
//! ```text
//! inputs ──► KgeModel ──► concept scores/embeddings
//!                              │
//!                              ├──► reasoning step × enabled depth ──► (embedding residual gate)
//!                              │                                              │
//!                              └──────── gather queries ◄─────────────────────┘
//!                                              │
//!                                   task residual: disj(task, concept)
//! ```

mod config;

pub use config::CollectiveConfig;

use candle_core::{Device, Tensor, Var};
use tracing::{debug, info, Level};

use crate::embeddings::{DomainInputs, Groundings};
use crate::kge::{KgeModel, LossChannel, RegularizationLosses};
use crate::logic::{validate_rules_strict, Fol, Rule};
use crate::primitives::{
    gather_rows, host_indices, l1_loss, l2_loss, stop_gradient, Activation, Dense, TNorm,
};
use crate::reasoning::{Explanation, LayerContext, ReasoningStack, RuleGroundings};
use crate::{KgeError, Result};

/// Lower clip of the embedding residual gate
pub const GATE_MIN: f32 = 1e-9;
/// Upper clip of the embedding residual gate
pub const GATE_MAX: f32 = 1.0 - 1e-7;

const GATE_BIAS_L2: f64 = 1e-4;
const GATE_ACTIVITY_L1: f64 = 1e-5;
const GATE_ACTIVITY_L2: f64 = 1e-5;

/// Scores of the queried atoms
#[derive(Debug, Clone)]
pub struct CollectiveOutput {
    /// `[Q]` KGE scores
    pub concept_scores: Tensor,
    /// `[Q]` scores after reasoning and residuals
    pub task_scores: Tensor,
    /// Present in explain mode
    pub explanations: Option<Explanation>,
}

/// Clip raw gate values into `[GATE_MIN, GATE_MAX]`
pub fn clip_gate(raw: &Tensor) -> Result<Tensor> {
    raw.clamp(GATE_MIN, GATE_MAX)
        .map_err(|e| KgeError::Tensor(format!("gate clip failed: {}", e)))
}

/// Blend concept and reasoned atom embeddings with a learned per-atom gate.
///
/// `(1 - w)·pre + w·post` where `pre` is cut from the graph: only the
/// reasoned path and the gate itself receive gradient through the blend.
pub fn embedding_residual(
    gate: &Dense,
    pre: &Tensor,
    post: &Tensor,
    losses: &mut RegularizationLosses,
) -> Result<Tensor> {
    let raw = gate.forward(&Tensor::cat(&[pre, post], 1)?)?;
    losses.add("residual_gate.bias_l2", GATE_BIAS_L2, l2_loss(gate.bias.as_tensor())?)?;
    // Activity penalties are Σ|w| and Σw² averaged over the atom batch
    let atoms = raw.dim(0)?.max(1) as f64;
    let activity_l1 = l1_loss(&raw)?.affine(1.0 / atoms, 0.0)?;
    let activity_l2 = raw.sqr()?.sum_all()?.affine(1.0 / atoms, 0.0)?;
    losses.add("residual_gate.activity_l1", GATE_ACTIVITY_L1, activity_l1)?;
    losses.add("residual_gate.activity_l2", GATE_ACTIVITY_L2, activity_l2)?;

    let w = clip_gate(&raw)?;
    if tracing::enabled!(Level::DEBUG) && w.elem_count() > 0 {
        let mean_gate = w.mean_all()?.to_scalar::<f32>()?;
        debug!(mean_gate, "embedding residual gate");
    }

    let kept = w.affine(-1.0, 1.0)?.broadcast_mul(&stop_gradient(pre))?;
    Ok((kept + w.broadcast_mul(post)?)?)
}

/// `[N, 1]` scores → `[Q]` scores of the queried rows
fn gather_queries(scores: &Tensor, queries: &Tensor) -> Result<Tensor> {
    gather_rows(&scores.squeeze(1)?, queries)
}

/// KGE model, reasoning stack and residual connections
#[derive(Debug)]
pub struct CollectiveModel {
    kge: KgeModel,
    rules: Vec<Rule>,
    config: CollectiveConfig,
    tnorm: TNorm,
    reasoning: Option<ReasoningStack>,
    gate: Option<Dense>,
    enabled_reasoner_depth: usize,
    explain: bool,
    losses: LossChannel,
}

impl CollectiveModel {
    pub fn new(fol: Fol, rules: Vec<Rule>, config: CollectiveConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        validate_rules_strict(&fol, &rules)?;
        let tnorm = config.reasoner.tnorm()?;
        let kge = KgeModel::new(fol, config.kge.clone(), device)?;

        let depth = config.reasoner.reasoner_depth;
        let reasoning = if depth > 0 && !rules.is_empty() {
            let ctx = LayerContext {
                rules: &rules,
                atom_embedding_size: kge.atom_embedding_size(),
                scoring: kge.kind(),
                output_fn: kge.output_fn(),
                device,
            };
            Some(ReasoningStack::new(&config.reasoner, &ctx)?)
        } else {
            None
        };
        let gate = if reasoning.is_some() && config.embedding_resnet {
            Some(Dense::new(2 * kge.atom_embedding_size(), 1, Activation::Sigmoid, device)?)
        } else {
            None
        };

        info!(
            kge = %kge.kind(),
            reasoner = %config.reasoner.reasoner,
            depth,
            rules = rules.len(),
            resnet = config.resnet,
            embedding_resnet = config.embedding_resnet,
            tnorm = %tnorm,
            "🚀 Collective model ready"
        );

        Ok(Self {
            kge,
            rules,
            config,
            tnorm,
            reasoning,
            gate,
            enabled_reasoner_depth: depth,
            explain: false,
            losses: LossChannel::default(),
        })
    }

    pub fn kge(&self) -> &KgeModel {
        &self.kge
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn config(&self) -> &CollectiveConfig {
        &self.config
    }

    pub fn reasoning(&self) -> Option<&ReasoningStack> {
        self.reasoning.as_ref()
    }

    pub fn enabled_reasoner_depth(&self) -> usize {
        self.enabled_reasoner_depth
    }

    /// Run only the first `depth` reasoning steps (e.g. while pretraining the KGE)
    pub fn set_enabled_reasoner_depth(&mut self, depth: usize) -> Result<()> {
        let configured = self.config.reasoner.reasoner_depth;
        if depth > configured {
            return Err(KgeError::Config(format!(
                "enabled reasoner depth {} exceeds the configured depth {}",
                depth, configured
            )));
        }
        self.enabled_reasoner_depth = depth;
        Ok(())
    }

    /// Return explanations of the last reasoning step from every call
    pub fn explain_mode(&mut self, on: bool) {
        self.explain = on;
    }

    pub fn is_explain_mode(&self) -> bool {
        self.explain
    }

    fn check_explainable(&self) -> Result<()> {
        match &self.reasoning {
            None => Err(KgeError::Precondition(
                "explain mode requires a reasoning stack (reasoner_depth > 0 and at least one rule)".into(),
            )),
            Some(stack) if !stack.is_explainable() => Err(KgeError::Precondition(format!(
                "explain mode requires an explainable reasoner (dcr, cdcr), got '{}'",
                self.config.reasoner.reasoner
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Score the queried atoms.
    ///
    /// `query_indices` are rows of the atom batch assembled from `groundings`.
    /// Regularization losses of this call replace the committed ones only
    /// when the call succeeds.
    pub fn call(
        &self,
        domain_inputs: &DomainInputs,
        groundings: &Groundings,
        rule_groundings: &RuleGroundings,
        query_indices: &Tensor,
        train: bool,
    ) -> Result<CollectiveOutput> {
        if self.explain {
            self.check_explainable()?;
        }

        let mut losses = RegularizationLosses::new();
        let concept = self.kge.forward(domain_inputs, groundings, train, &mut losses)?;
        let num_atoms = concept.num_atoms();
        if let Some(&bad) = host_indices(query_indices)?.iter().find(|&&q| q as usize >= num_atoms) {
            return Err(KgeError::Shape(format!(
                "query index {} out of bounds for {} atoms",
                bad, num_atoms
            )));
        }

        let mut task_scores = concept.scores.clone();
        let mut explanations = None;
        if let Some(stack) = &self.reasoning {
            let mut embeddings = concept.embeddings.clone();
            for i in 0..self.enabled_reasoner_depth {
                let layer = stack
                    .layer(i)
                    .ok_or_else(|| KgeError::Config(format!("no reasoning layer at depth {}", i)))?;
                if self.explain && i + 1 == self.enabled_reasoner_depth {
                    explanations = Some(layer.explain(&task_scores, &embeddings, rule_groundings)?);
                }
                (task_scores, embeddings) = layer.step(&task_scores, &embeddings, rule_groundings, &mut losses, train)?;
            }
            if let Some(gate) = &self.gate {
                let blended = embedding_residual(gate, &concept.embeddings, &embeddings, &mut losses)?;
                task_scores = self.kge.output(&blended)?.unsqueeze(1)?;
            }
        }

        let concept_scores = gather_queries(&concept.scores, query_indices)?;
        let mut task_scores = gather_queries(&task_scores, query_indices)?;
        if self.config.resnet && self.reasoning.is_some() {
            task_scores = self.tnorm.disj(&task_scores, &concept_scores)?;
        }

        debug!(
            atoms = num_atoms,
            queries = concept_scores.elem_count(),
            depth = self.enabled_reasoner_depth,
            losses = losses.len(),
            "collective forward"
        );
        self.losses.commit(losses);
        Ok(CollectiveOutput { concept_scores, task_scores, explanations })
    }

    /// Drain the penalties committed by the last successful call
    pub fn take_regularization_losses(&self) -> RegularizationLosses {
        self.losses.take()
    }

    /// Sum of the committed penalties, without draining them
    pub fn regularization_loss(&self) -> Result<Option<Tensor>> {
        self.losses.total()
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.kge.trainable_vars();
        if let Some(stack) = &self.reasoning {
            vars.extend(stack.trainable_vars());
        }
        if let Some(gate) = &self.gate {
            vars.extend(gate.trainable_vars());
        }
        vars
    }
}
