//! Loss and gradient helpers
//!
//! Loss assembly for the collective model and gradient diagnostics. The
//! optimizer and the loop belong to the caller.
//!
//! ## Example
//!
//! ```ignore
//! let out = model.call(&inputs, &groundings, &rule_groundings, &queries, true)?;
//! let loss = collective_loss(&model, &out, &targets, 0.5)?;
//! let grads = loss.backward()?;
//! if check_gradients_health(&grads, &vars) {
//!     optimizer.step(&grads)?;
//! }
//! ```

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::collective::{CollectiveModel, CollectiveOutput};
use crate::primitives::binary_cross_entropy;
use crate::{KgeError, Result};

// =============================================================================
// Loss
// =============================================================================

/// Task BCE + weighted concept BCE + the regularization penalties of the call.
///
/// Drains the model's committed penalties, so call it once per forward pass.
pub fn collective_loss(
    model: &CollectiveModel,
    output: &CollectiveOutput,
    targets: &Tensor,
    concept_weight: f64,
) -> Result<Tensor> {
    if concept_weight < 0.0 {
        return Err(KgeError::Config(format!("concept_weight must be >= 0, got {}", concept_weight)));
    }
    let mut loss = binary_cross_entropy(&output.task_scores, targets)?;
    if concept_weight > 0.0 {
        let concept = binary_cross_entropy(&output.concept_scores, targets)?;
        loss = (loss + concept.affine(concept_weight, 0.0)?)?;
    }
    if let Some(penalty) = model.take_regularization_losses().total()? {
        loss = (loss + penalty)?;
    }
    Ok(loss)
}

// =============================================================================
// Gradient diagnostics
// =============================================================================

/// Global L2 norm of the gradients of `vars`
pub fn compute_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f32> {
    let mut total_sq_norm = 0.0f32;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total_sq_norm += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    Ok(total_sq_norm.sqrt())
}

/// True when no gradient contains NaN or Inf
pub fn check_gradients_health(grads: &GradStore, vars: &[Var]) -> bool {
    vars.iter()
        .filter_map(|var| grads.get(var.as_tensor()))
        .all(|grad| {
            grad.flatten_all()
                .and_then(|t| t.to_vec1::<f32>())
                .map(|vals| vals.iter().all(|v| v.is_finite()))
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::CollectiveConfig;
    use crate::embeddings::{DomainInputs, Groundings};
    use crate::logic::{Domain, Fol, Literal, Predicate, Rule};
    use crate::primitives::index_tensor;
    use crate::reasoning::{RuleGrounding, RuleGroundings};
    use candle_core::Device;

    #[test]
    fn test_grad_norm_and_health() {
        let device = Device::Cpu;
        let v = Var::from_tensor(&Tensor::new(&[3.0f32, 4.0], &device).unwrap()).unwrap();
        // d/dv (v · v) / 2 = v, norm 5
        let loss = v.as_tensor().sqr().unwrap().sum_all().unwrap().affine(0.5, 0.0).unwrap();
        let grads = loss.backward().unwrap();
        let vars = vec![v];
        assert!(check_gradients_health(&grads, &vars));
        assert!((compute_grad_norm(&grads, &vars).unwrap() - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_unhealthy_gradients() {
        let device = Device::Cpu;
        let v = Var::from_tensor(&Tensor::new(&[0.0f32, 1.0], &device).unwrap()).unwrap();
        // d/dv sqrt(v) is infinite at 0
        let loss = v.as_tensor().sqrt().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(!check_gradients_health(&grads, &[v]));
    }

    #[test]
    fn test_collective_loss_drains_penalties() {
        let device = Device::Cpu;
        let fol = Fol::new(
            vec![Domain::new("people", ["ann", "bob"])],
            vec![Predicate::new("friend", ["people", "people"]), Predicate::new("smokes", ["people", "people"])],
        )
        .unwrap();
        let rules = vec![Rule::new(
            "r0",
            vec![Literal::new("friend", ["X", "Y"]), Literal::new("smokes", ["X", "X"])],
            vec![Literal::new("smokes", ["Y", "Y"])],
        )];
        let mut config = CollectiveConfig::default();
        config.kge.constant_embedding_size = 4;
        config.kge.predicate_embedding_size = 4;
        config.kge.kge_atom_embedding_size = 4;
        config.kge.kge_regularization = 0.1;
        config.reasoner.reasoner = "sbr".into();
        let model = CollectiveModel::new(fol, rules, config, &device).unwrap();

        let mut inputs = DomainInputs::new();
        inputs.insert("people".into(), index_tensor(&[0, 1], &device).unwrap());
        let mut groundings = Groundings::new();
        groundings.insert("friend".into(), Tensor::from_vec(vec![0u32, 1], (1, 2), &device).unwrap());
        groundings.insert("smokes".into(), Tensor::from_vec(vec![0u32, 0, 1, 1], (2, 2), &device).unwrap());
        let mut rule_groundings = RuleGroundings::new();
        rule_groundings.insert(
            "r0".into(),
            RuleGrounding::from_rows(&[vec![0, 1]], &[vec![2]], &device).unwrap(),
        );

        let queries = index_tensor(&[1, 2], &device).unwrap();
        let targets = Tensor::new(&[1.0f32, 0.0], &device).unwrap();
        let out = model.call(&inputs, &groundings, &rule_groundings, &queries, true).unwrap();
        assert!(model.regularization_loss().unwrap().is_some());

        let task_only = binary_cross_entropy(&out.task_scores, &targets).unwrap().to_scalar::<f32>().unwrap();
        let loss = collective_loss(&model, &out, &targets, 0.5).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss > task_only);
        assert!(model.regularization_loss().unwrap().is_none());

        assert!(matches!(
            collective_loss(&model, &out, &targets, -1.0),
            Err(KgeError::Config(_))
        ));
    }
}
