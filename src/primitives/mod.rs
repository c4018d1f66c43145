//! Tensor Primitives
//!
//! Core tensor operations, activations, dense layers and differentiable
//! fuzzy logic operators.
//!
//! ## Submodules
//!
//! - [`fuzzy_ops`]: T-norm semantics (AND, OR, NOT) over truth-score tensors
//! - [`tensor_ops`]: Device selection, gathering, penalties, losses
//! - [`activations`]: Activation functions (sigmoid, logit, softmax, relu)
//! - [`layers`]: Dense projections and small MLPs

mod fuzzy_ops;
mod tensor_ops;
mod activations;
pub mod layers;

// Re-export all primitives at module level
pub use fuzzy_ops::*;
pub use tensor_ops::*;
pub use activations::*;
pub use layers::{Activation, Dense, Mlp};
