//! Rule-driven reasoning layers
//!
//! A reasoning layer refines atom scores `[N, 1]` (and, for some variants,
//! atom embeddings `[N, E]`) from the groundings of first-order rules. The
//! collective model unrolls a [`ReasoningStack`] of such layers.
//!
//! | Variant | Reads embeddings | Learned parameters | Explainable |
//! |---------|------------------|--------------------|-------------|
//! | `sbr`   | no  | none                          | no  |
//! | `gsbr`  | no  | per-rule gates                | no  |
//! | `rnm`   | no  | per-rule weights              | no  |
//! | `dsl`   | no  | per-rule probabilities        | no  |
//! | `r2n`   | yes | per-rule message MLPs         | no  |
//! | `dcr`   | yes | per-literal sign/filter MLPs  | yes |
//! | `cdcr`  | yes | shared formula slots          | yes |

mod cdcr;
mod config;
mod dcr;
mod dsl;
mod explanation;
mod grounding;
mod r2n;
mod rnm;
mod sbr;

pub use cdcr::CdcrLayer;
pub use config::{PredictionType, ReasonerConfig, ReasonerKind};
pub use dcr::DcrLayer;
pub use dsl::DslLayer;
pub use explanation::{Explanation, GroundingExplanation, LiteralExplanation, RuleExplanation};
pub use grounding::{Aggregation, RuleGrounding, RuleGroundings};
pub use r2n::R2nLayer;
pub use rnm::RnmLayer;
pub use sbr::SbrLayer;

use candle_core::{Device, Tensor, Var};
use tracing::info;

use crate::kge::{OutputFn, RegularizationLosses, ScoringKind};
use crate::logic::Rule;
use crate::primitives::TNorm;
use crate::{KgeError, Result};

/// One reasoning step over the atom batch
pub trait ReasoningLayer: std::fmt::Debug {
    fn kind(&self) -> ReasonerKind;

    /// Refine `scores` `[N, 1]` and `embeddings` `[N, E]`, pushing penalties into `losses`.
    fn step(
        &self,
        scores: &Tensor,
        embeddings: &Tensor,
        rule_groundings: &RuleGroundings,
        losses: &mut RegularizationLosses,
        train: bool,
    ) -> Result<(Tensor, Tensor)>;

    /// Explain the step that `step` would take on the same inputs
    fn explain(
        &self,
        _scores: &Tensor,
        _embeddings: &Tensor,
        _rule_groundings: &RuleGroundings,
    ) -> Result<Explanation> {
        Err(KgeError::Precondition(format!(
            "reasoning layer '{}' cannot explain its predictions",
            self.kind()
        )))
    }

    fn is_explainable(&self) -> bool {
        false
    }

    fn trainable_vars(&self) -> Vec<Var>;
}

/// Settings every layer shares
#[derive(Debug, Clone)]
pub struct LayerSettings {
    pub rules: Vec<Rule>,
    pub tnorm: TNorm,
    pub aggregation: Aggregation,
    /// L2 coefficient on the layer's weights
    pub regularization: f64,
    pub dropout_rate: f32,
}

/// What a layer needs to know about the atom batch it will see
#[derive(Debug, Clone, Copy)]
pub struct LayerContext<'a> {
    pub rules: &'a [Rule],
    /// Width `E` of the atom embeddings
    pub atom_embedding_size: usize,
    pub scoring: ScoringKind,
    /// Maps atom embeddings to scores
    pub output_fn: OutputFn,
    pub device: &'a Device,
}

/// Build one layer of the configured variant
pub fn build_layer(config: &ReasonerConfig, ctx: &LayerContext<'_>) -> Result<Box<dyn ReasoningLayer>> {
    let settings = LayerSettings {
        rules: ctx.rules.to_vec(),
        tnorm: config.tnorm()?,
        aggregation: config.aggregation()?,
        regularization: config.reasoner_regularization,
        dropout_rate: config.reasoner_dropout_rate,
    };
    let layer: Box<dyn ReasoningLayer> = match config.kind()? {
        ReasonerKind::Sbr => Box::new(SbrLayer::new(settings, false, ctx.device)?),
        ReasonerKind::Gsbr => Box::new(SbrLayer::new(settings, true, ctx.device)?),
        ReasonerKind::Rnm => Box::new(RnmLayer::new(settings, ctx.device)?),
        ReasonerKind::Dsl => Box::new(DslLayer::new(settings, ctx.device)?),
        ReasonerKind::R2n => Box::new(R2nLayer::new(settings, config, ctx)?),
        ReasonerKind::Dcr => Box::new(DcrLayer::new(settings, config, ctx)?),
        ReasonerKind::Cdcr => Box::new(CdcrLayer::new(settings, config, ctx)?),
    };
    Ok(layer)
}

/// Layers unrolled by the collective model
#[derive(Debug)]
pub enum ReasoningStack {
    /// One layer reused at every depth
    Shared { layer: Box<dyn ReasoningLayer>, depth: usize },
    /// One layer per depth
    PerDepth(Vec<Box<dyn ReasoningLayer>>),
}

impl ReasoningStack {
    pub fn new(config: &ReasonerConfig, ctx: &LayerContext<'_>) -> Result<Self> {
        config.validate()?;
        let depth = config.reasoner_depth;
        if depth == 0 {
            return Err(KgeError::Config("a reasoning stack needs reasoner_depth > 0".into()));
        }
        let stack = if config.reasoner_single_model {
            ReasoningStack::Shared { layer: build_layer(config, ctx)?, depth }
        } else {
            ReasoningStack::PerDepth((0..depth).map(|_| build_layer(config, ctx)).collect::<Result<_>>()?)
        };
        info!(
            reasoner = %config.reasoner,
            depth,
            shared = config.reasoner_single_model,
            rules = ctx.rules.len(),
            "🧠 Reasoning stack built"
        );
        Ok(stack)
    }

    pub fn depth(&self) -> usize {
        match self {
            ReasoningStack::Shared { depth, .. } => *depth,
            ReasoningStack::PerDepth(layers) => layers.len(),
        }
    }

    /// Layer executed at step `i`
    pub fn layer(&self, i: usize) -> Option<&dyn ReasoningLayer> {
        match self {
            ReasoningStack::Shared { layer, depth } => (i < *depth).then_some(layer.as_ref()),
            ReasoningStack::PerDepth(layers) => layers.get(i).map(|l| l.as_ref()),
        }
    }

    pub fn is_explainable(&self) -> bool {
        self.layer(0).is_some_and(|l| l.is_explainable())
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        match self {
            ReasoningStack::Shared { layer, .. } => layer.trainable_vars(),
            ReasoningStack::PerDepth(layers) => layers.iter().flat_map(|l| l.trainable_vars()).collect(),
        }
    }
}
