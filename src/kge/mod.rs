//! Knowledge-graph embedding pipeline
//!
//! - [`scoring`]: the six scoring functions and their output functions
//! - [`assembly`]: row-aligned gathering of predicate/constant embeddings
//! - [`model`]: [`KgeModel`], lookup → assembly → scoring
//! - [`regularization`]: penalty side channel committed per successful call

pub mod assembly;
pub mod config;
pub mod model;
pub mod regularization;
pub mod scoring;

pub use assembly::{AtomAssembly, AtomSegment};
pub use config::KgeConfig;
pub use model::{KgeModel, KgeOutput};
pub use regularization::{LossChannel, RegularizationLosses};
pub use scoring::{KgeScorer, OutputFn, ScorerSettings, ScoringKind};
