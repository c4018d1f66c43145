//! # an-kge
//!
//! Differentiable knowledge-graph embeddings with collective neuro-symbolic
//! reasoning, built on candle tensors with full gradient flow.
//!
//! ## Overview
//!
//! Atoms are predicates applied to tuples of typed constants. This crate turns
//! sparse symbolic groundings (predicate → tuples of constant indices) into dense
//! atom embeddings and truth scores, then optionally refines those scores by
//! unrolling relational reasoning layers driven by first-order rules.
//!
//! Core capabilities:
//!
//! - **KGE scoring**: DistMult, TransE, ComplEx, RotatE, ModE and Tucker
//! - **Atom assembly**: row-aligned predicate/constant embeddings per grounding
//! - **Adaptive constants**: learned slots for out-of-vocabulary constants
//! - **Reasoning**: DCR, clustered DCR, R2N, SBR, gated SBR, RNM and DSL layers
//! - **Collective model**: depth unrolling, embedding residual gate, task residual
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use an_kge::prelude::*;
//!
//! let fol = Fol::new(
//!     vec![Domain::new("people", ["ann", "bob", "cid"])],
//!     vec![
//!         Predicate::new("friend", ["people", "people"]),
//!         Predicate::new("smokes", ["people", "people"]),
//!     ],
//! )?;
//! let rules = vec![Rule::new(
//!     "r0",
//!     vec![Literal::new("friend", ["X", "Y"]), Literal::new("smokes", ["X", "X"])],
//!     vec![Literal::new("smokes", ["Y", "Y"])],
//! )];
//!
//! let config = CollectiveConfig::default();
//! let model = CollectiveModel::new(fol, rules, config, &best_device())?;
//!
//! let out = model.call(&domain_inputs, &groundings, &rule_groundings, &queries, true)?;
//! let loss = binary_cross_entropy(&out.task_scores, &targets)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `metal`: Apple Metal GPU acceleration (M1/M2/M3/M4)
//! - `cuda`: NVIDIA CUDA GPU acceleration

pub mod primitives;
pub mod logic;
pub mod embeddings;
pub mod kge;
pub mod reasoning;
pub mod collective;
pub mod training;

// Re-export candle types for convenience
pub use candle_core::{Device, DType, Tensor, Var};

/// Error types for embedding and reasoning operations
#[derive(Debug, thiserror::Error)]
pub enum KgeError {
    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for embedding and reasoning operations
pub type Result<T> = std::result::Result<T, KgeError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{Device, DType, Tensor, Var};
    pub use crate::{KgeError, Result};

    // Primitives
    pub use crate::primitives::{
        best_device, gpu_disabled,
        TNorm,
        sigmoid, softmax, relu,
        binary_cross_entropy, stop_gradient,
    };

    // Signature
    pub use crate::logic::{Domain, Fol, Literal, Predicate, Rule};

    // Embeddings and scoring
    pub use crate::embeddings::{DomainInputs, Groundings};
    pub use crate::kge::{
        KgeConfig, KgeModel, KgeOutput, KgeScorer, ScoringKind,
        RegularizationLosses,
    };

    // Reasoning
    pub use crate::reasoning::{
        Aggregation, Explanation, ReasonerKind, ReasoningLayer, RuleGrounding,
        RuleGroundings,
    };

    // Collective model
    pub use crate::collective::{CollectiveConfig, CollectiveModel, CollectiveOutput};

    // Loss helpers
    pub use crate::training::{check_gradients_health, collective_loss, compute_grad_norm};
}
