//! Collective training on a toy smokers graph
//!
//! Demonstrates: ground → KGE forward → reasoning → loss → backward → AdamW step,
//! then reads DCR explanations for the trained model.
//!
//! Run with:
//! ```bash
//! RUST_LOG=an_kge=debug cargo run --example collective_training
//! ```

use an_kge::prelude::*;
use an_kge::primitives::index_tensor;
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let device = best_device();

    // 1. Signature and rules
    let fol = Fol::new(
        vec![Domain::new("people", ["ann", "bob", "cid", "dan"])],
        vec![
            Predicate::new("friend", ["people", "people"]),
            Predicate::new("smokes", ["people", "people"]),
        ],
    )?;
    let rules = vec![Rule::new(
        "peer_pressure",
        vec![Literal::new("friend", ["X", "Y"]), Literal::new("smokes", ["X", "X"])],
        vec![Literal::new("smokes", ["Y", "Y"])],
    )];

    // 2. Groundings
    // atoms 0..3: friend(ann,bob) friend(bob,cid) friend(cid,dan)
    // atoms 3..7: smokes(ann) smokes(bob) smokes(cid) smokes(dan)
    let mut domain_inputs = DomainInputs::new();
    domain_inputs.insert("people".into(), index_tensor(&[0, 1, 2, 3], &device)?);

    let mut groundings = Groundings::new();
    groundings.insert(
        "friend".into(),
        Tensor::from_vec(vec![0u32, 1, 1, 2, 2, 3], (3, 2), &device)?,
    );
    groundings.insert(
        "smokes".into(),
        Tensor::from_vec(vec![0u32, 0, 1, 1, 2, 2, 3, 3], (4, 2), &device)?,
    );

    let mut rule_groundings = RuleGroundings::new();
    rule_groundings.insert(
        "peer_pressure".into(),
        RuleGrounding::from_rows(
            &[vec![0, 3], vec![1, 4], vec![2, 5]],
            &[vec![4], vec![5], vec![6]],
            &device,
        )?,
    );

    let queries = index_tensor(&[0, 1, 2, 3, 4, 5, 6], &device)?;
    // cid and dan are not friends, so dan does not pick up the habit
    let targets = Tensor::new(&[1.0f32, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0], &device)?;

    // 3. Model
    let mut config = CollectiveConfig::default();
    config.kge.kge = "complex".into();
    config.kge.constant_embedding_size = 16;
    config.kge.predicate_embedding_size = 16;
    config.kge.kge_atom_embedding_size = 8;
    config.reasoner.reasoner = "dcr".into();
    config.reasoner.reasoner_depth = 1;
    config.reasoner.reasoner_formula_hidden_embedding_size = 8;
    config.reasoner.reasoner_atom_embedding_size = 8;
    let mut model = CollectiveModel::new(fol, rules, config, &device)?;

    let vars = model.trainable_vars();
    println!("Training with {} vars", vars.len());

    // 4. Optimizer
    let params = ParamsAdamW {
        lr: 0.01,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(vars.clone(), params)
        .map_err(|e| KgeError::Tensor(format!("Optimizer init: {}", e)))?;

    // 5. Training loop
    println!("\n--- Training ---");
    let mut best = f32::INFINITY;
    for epoch in 0..100 {
        let out = model.call(&domain_inputs, &groundings, &rule_groundings, &queries, true)?;
        let loss = collective_loss(&model, &out, &targets, 0.5)?;

        let grads = loss.backward()
            .map_err(|e| KgeError::Tensor(format!("backward: {}", e)))?;
        if !check_gradients_health(&grads, &vars) {
            println!("  epoch {}: skipping (NaN gradients)", epoch);
            continue;
        }
        let grad_norm = compute_grad_norm(&grads, &vars)?;
        optimizer.step(&grads)?;

        let loss_val = loss.to_scalar::<f32>()?;
        best = best.min(loss_val);
        if epoch % 10 == 0 {
            println!("  epoch {:3}: loss={:.4}, grad_norm={:.4}", epoch, loss_val, grad_norm);
        }
    }
    println!("Best loss: {:.4}", best);

    // 6. Explanations
    model.explain_mode(true);
    let out = model.call(&domain_inputs, &groundings, &rule_groundings, &queries, false)?;
    println!("\nTask scores: {:?}", out.task_scores.to_vec1::<f32>()?);
    if let Some(explanation) = out.explanations {
        println!("Explanation:\n{}", explanation.to_json()?);
    }

    Ok(())
}
