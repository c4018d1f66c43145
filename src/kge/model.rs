//! KGE model: embedding lookup → atom assembly → scoring
//!
//! ```text
//! domain inputs ──► constant embeddings ─┐   (adaptive blend for OOV constants)
//!                                        ├──► AtomAssembly ──► scorer ──► [N, E_a]
//! predicate table ───────────────────────┘                         └──► output ──► [N, 1]
//! ```

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};
use tracing::{debug, info, trace};

use super::assembly::AtomAssembly;
use super::config::KgeConfig;
use super::regularization::{LossChannel, RegularizationLosses};
use super::scoring::{KgeScorer, OutputFn, ScorerSettings, ScoringKind};
use crate::embeddings::{
    AdaptiveConstantEmbeddings, ConstantEmbeddings, DomainInputs, Groundings, PredicateEmbeddings,
};
use crate::logic::Fol;
use crate::{KgeError, Result};

/// Scores and embeddings of every grounded atom, in assembly row order
#[derive(Debug, Clone)]
pub struct KgeOutput {
    /// `[N, 1]`
    pub scores: Tensor,
    /// `[N, E_a]`
    pub embeddings: Tensor,
}

impl KgeOutput {
    pub fn num_atoms(&self) -> usize {
        self.scores.dims()[0]
    }
}

#[derive(Debug)]
enum Scorers {
    Shared(KgeScorer),
    /// Indexed by global predicate index
    PerPredicate(Vec<KgeScorer>),
}

/// Embedding and scoring pipeline over a fixed signature
#[derive(Debug)]
pub struct KgeModel {
    fol: Fol,
    config: KgeConfig,
    kind: ScoringKind,
    constant_embedder: ConstantEmbeddings,
    predicate_embedder: PredicateEmbeddings,
    adaptive_embedder: Option<AdaptiveConstantEmbeddings>,
    scorers: Scorers,
    losses: LossChannel,
}

impl KgeModel {
    pub fn new(fol: Fol, config: KgeConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let kind = config.scoring_kind()?;

        let constant_embedder = ConstantEmbeddings::new(&fol, config.constant_embedding_size, device)?;
        let predicate_embedder = PredicateEmbeddings::new(&fol, config.predicate_embedding_size, device)?;
        let adaptive_embedder = if config.num_adaptive_constants > 0 {
            Some(AdaptiveConstantEmbeddings::new(
                &fol,
                config.constant_embedding_size,
                config.num_adaptive_constants,
                config.dot_product,
                device,
            )?)
        } else {
            None
        };

        let settings = ScorerSettings {
            atom_embedding_size: config.kge_atom_embedding_size,
            regularization: config.kge_regularization,
            regularization_n3: config.kge_regularization_n3,
            dropout_rate: config.kge_dropout_rate,
        };
        let relation_size = config.predicate_embedding_size;

        if let Some(required) = kind.required_arity() {
            if let Some(p) = fol.predicates().iter().find(|p| p.arity() != required) {
                return Err(KgeError::Config(format!(
                    "{} needs arity {} but predicate '{}' has arity {}",
                    kind,
                    required,
                    p.name,
                    p.arity()
                )));
            }
        }

        let scorers = if config.per_predicate_scorers {
            let per_predicate = fol
                .predicates()
                .iter()
                .map(|_| KgeScorer::new(kind, settings.clone(), relation_size, device))
                .collect::<Result<Vec<_>>>()?;
            Scorers::PerPredicate(per_predicate)
        } else {
            Scorers::Shared(KgeScorer::new(kind, settings, relation_size, device)?)
        };

        info!(
            kge = %kind,
            atom_size = config.kge_atom_embedding_size,
            predicates = fol.predicates().len(),
            adaptive = config.num_adaptive_constants,
            per_predicate = config.per_predicate_scorers,
            "built KGE model"
        );

        Ok(Self {
            fol,
            config,
            kind,
            constant_embedder,
            predicate_embedder,
            adaptive_embedder,
            scorers,
            losses: LossChannel::default(),
        })
    }

    pub fn fol(&self) -> &Fol {
        &self.fol
    }

    pub fn config(&self) -> &KgeConfig {
        &self.config
    }

    pub fn kind(&self) -> ScoringKind {
        self.kind
    }

    /// Width of the atom embeddings produced by `score`
    pub fn atom_embedding_size(&self) -> usize {
        self.kind.atom_width(self.config.kge_atom_embedding_size)
    }

    pub fn output_fn(&self) -> OutputFn {
        match &self.scorers {
            Scorers::Shared(s) => s.output_fn(),
            // every per-predicate scorer has the same kind
            Scorers::PerPredicate(v) => v
                .first()
                .map(KgeScorer::output_fn)
                .unwrap_or(OutputFn::SumSigmoid),
        }
    }

    /// Scores `[N]` from atom embeddings `[N, E_a]`
    pub fn output(&self, embeddings: &Tensor) -> Result<Tensor> {
        self.output_fn().apply(embeddings)
    }

    /// Score every grounded atom.
    ///
    /// Regularization losses of this call replace the committed ones only when
    /// the call succeeds (see [`KgeModel::take_regularization_losses`]).
    pub fn score(&self, inputs: &DomainInputs, groundings: &Groundings, train: bool) -> Result<KgeOutput> {
        let mut losses = RegularizationLosses::new();
        let out = self.forward(inputs, groundings, train, &mut losses)?;
        self.losses.commit(losses);
        Ok(out)
    }

    /// Score every grounded atom, pushing penalties into `losses`
    pub fn forward(
        &self,
        inputs: &DomainInputs,
        groundings: &Groundings,
        train: bool,
        losses: &mut RegularizationLosses,
    ) -> Result<KgeOutput> {
        let constant_embeddings = self.embed_constants(inputs)?;
        let atoms = AtomAssembly::build(
            &self.fol,
            &constant_embeddings,
            self.predicate_embedder.all(),
            groundings,
            self.config.constant_embedding_size,
        )?;

        let embeddings = match &self.scorers {
            // One pass so that parameter penalties are counted once per call
            Scorers::Shared(scorer) if atoms.has_uniform_arity() => {
                let (predicates, constants) = atoms.stacked()?;
                scorer.embed(&predicates, &constants, train, losses)?
            }
            _ => {
                let mut per_segment = Vec::with_capacity(atoms.segments().len());
                for segment in atoms.segments() {
                    let scorer = self.scorer_for(segment.predicate_index)?;
                    per_segment.push(scorer.embed(&segment.predicates, &segment.constants, train, losses)?);
                }
                if per_segment.is_empty() {
                    let device = self.predicate_embedder.all().device();
                    Tensor::zeros((0, self.atom_embedding_size()), DType::F32, device)?
                } else {
                    Tensor::cat(&per_segment, 0)?
                }
            }
        };
        let scores = self.output(&embeddings)?.unsqueeze(1)?;

        debug!(atoms = atoms.num_atoms(), kge = %self.kind, "scored atoms");
        Ok(KgeOutput { scores, embeddings })
    }

    fn scorer_for(&self, predicate_index: usize) -> Result<&KgeScorer> {
        match &self.scorers {
            Scorers::Shared(s) => Ok(s),
            Scorers::PerPredicate(v) => v.get(predicate_index).ok_or_else(|| {
                KgeError::Shape(format!("No scorer for predicate index {}", predicate_index))
            }),
        }
    }

    /// Constant embeddings per domain, blending in adaptive slots for indices
    /// at or above each domain's constant count.
    fn embed_constants(&self, inputs: &DomainInputs) -> Result<HashMap<String, Tensor>> {
        let Some(adaptive) = &self.adaptive_embedder else {
            return self.constant_embedder.embed(inputs);
        };

        let fixed = self.constant_embedder.embed_known(inputs)?;
        let adaptive_embeddings = adaptive.embed(inputs, &self.constant_embedder)?;

        let mut blended = HashMap::with_capacity(fixed.len());
        for (name, (fixed_rows, mask)) in fixed {
            if mask.iter().all(|&m| m == 1) {
                blended.insert(name, fixed_rows);
                continue;
            }
            trace!(domain = %name, oov = mask.iter().filter(|&&m| m == 0).count(), "blending adaptive constants");
            let adaptive_rows = adaptive_embeddings
                .get(&name)
                .ok_or_else(|| KgeError::Shape(format!("No adaptive rows for domain '{}'", name)))?;
            let len = mask.len();
            let mask = Tensor::from_vec(mask, len, fixed_rows.device())?
                .unsqueeze(1)?
                .broadcast_as(fixed_rows.shape())?
                .contiguous()?;
            let rows = mask
                .where_cond(&fixed_rows, adaptive_rows)
                .map_err(|e| KgeError::Tensor(format!("adaptive blend failed: {}", e)))?;
            blended.insert(name, rows);
        }
        Ok(blended)
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
        let mut vars = self.constant_embedder.trainable_vars();
        vars.extend(self.predicate_embedder.trainable_vars());
        if let Some(adaptive) = &self.adaptive_embedder {
            vars.extend(adaptive.trainable_vars());
        }
        match &self.scorers {
            Scorers::Shared(s) => vars.extend(s.trainable_vars()),
            Scorers::PerPredicate(v) => vars.extend(v.iter().flat_map(KgeScorer::trainable_vars)),
        }
        vars
    }

    #[cfg(test)]
    pub(crate) fn constant_embedder(&self) -> &ConstantEmbeddings {
        &self.constant_embedder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::{Domain, Predicate};
    use crate::primitives::index_tensor;

    fn device() -> Device {
        Device::Cpu
    }

    fn fol() -> Fol {
        Fol::new(
            vec![Domain::new("people", ["ann", "bob", "cid"])],
            vec![
                Predicate::new("friend", ["people", "people"]),
                Predicate::new("smokes", ["people", "people"]),
            ],
        )
        .unwrap()
    }

    fn inputs(ids: &[u32]) -> DomainInputs {
        let mut inputs = DomainInputs::new();
        inputs.insert("people".into(), index_tensor(ids, &device()).unwrap());
        inputs
    }

    fn tuples(rows: &[[u32; 2]]) -> Tensor {
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 2), &device()).unwrap()
    }

    fn config(kge: &str, e: usize) -> KgeConfig {
        let kind: ScoringKind = kge.parse().unwrap();
        KgeConfig {
            kge: kge.into(),
            kge_atom_embedding_size: e,
            constant_embedding_size: kind.constant_width(e),
            predicate_embedding_size: kind.predicate_width(e, e),
            ..Default::default()
        }
    }

    #[test]
    fn test_score_shapes_every_scorer() {
        for kge in ["distmult", "transe", "complex", "rotate", "mode", "tucker"] {
            let model = KgeModel::new(fol(), config(kge, 4), &device()).unwrap();
            let mut groundings = Groundings::new();
            groundings.insert("friend".into(), tuples(&[[0, 1], [1, 2]]));
            groundings.insert("smokes".into(), tuples(&[[2, 2]]));

            let out = model.score(&inputs(&[0, 1, 2]), &groundings, false).unwrap();
            assert_eq!(out.scores.dims(), &[3, 1], "{}", kge);
            assert_eq!(out.embeddings.dims(), &[3, model.atom_embedding_size()], "{}", kge);
        }
    }

    #[test]
    fn test_empty_batch() {
        let model = KgeModel::new(fol(), config("complex", 4), &device()).unwrap();
        let out = model.score(&inputs(&[]), &Groundings::new(), true).unwrap();
        assert_eq!(out.scores.dims(), &[0, 1]);
        assert_eq!(out.embeddings.dims(), &[0, 4]);
    }

    #[test]
    fn test_rows_follow_signature_order() {
        let model = KgeModel::new(fol(), config("distmult", 4), &device()).unwrap();
        let mut only_friend = Groundings::new();
        only_friend.insert("friend".into(), tuples(&[[0, 1]]));
        let mut only_smokes = Groundings::new();
        only_smokes.insert("smokes".into(), tuples(&[[2, 2]]));
        let mut both = only_friend.clone();
        both.insert("smokes".into(), tuples(&[[2, 2]]));

        let people = inputs(&[0, 1, 2]);
        let friend = model.score(&people, &only_friend, false).unwrap().scores.to_vec2::<f32>().unwrap();
        let smokes = model.score(&people, &only_smokes, false).unwrap().scores.to_vec2::<f32>().unwrap();
        let joint = model.score(&people, &both, false).unwrap().scores.to_vec2::<f32>().unwrap();
        assert_eq!(joint, vec![friend[0].clone(), smokes[0].clone()]);
    }

    #[test]
    fn test_oov_without_adaptive_is_shape_error() {
        let model = KgeModel::new(fol(), config("distmult", 4), &device()).unwrap();
        let mut groundings = Groundings::new();
        groundings.insert("friend".into(), tuples(&[[0, 1]]));
        let err = model.score(&inputs(&[0, 5]), &groundings, false);
        assert!(matches!(err, Err(KgeError::Shape(_))));
    }

    #[test]
    fn test_empty_domain_index_is_shape_error() {
        let haunted = Fol::new(
            vec![Domain::new("people", ["ann"]), Domain::new("ghosts", Vec::<&str>::new())],
            vec![Predicate::new("haunts", ["ghosts", "people"])],
        )
        .unwrap();
        let mut domain_inputs = inputs(&[0]);
        domain_inputs.insert("ghosts".into(), index_tensor(&[0], &device()).unwrap());
        let mut groundings = Groundings::new();
        groundings.insert("haunts".into(), tuples(&[[0, 0]]));

        let model = KgeModel::new(haunted.clone(), config("distmult", 4), &device()).unwrap();
        assert!(matches!(
            model.score(&domain_inputs, &groundings, false),
            Err(KgeError::Shape(_))
        ));

        // With adaptive slots the same index is an out-of-vocabulary ghost
        let mut cfg = config("distmult", 4);
        cfg.num_adaptive_constants = 1;
        let model = KgeModel::new(haunted, cfg, &device()).unwrap();
        let out = model.score(&domain_inputs, &groundings, false).unwrap();
        assert_eq!(out.num_atoms(), 1);
    }

    #[test]
    fn test_adaptive_blend_selects_by_threshold() {
        let mut cfg = config("distmult", 4);
        cfg.num_adaptive_constants = 2;
        let model = KgeModel::new(fol(), cfg, &device()).unwrap();
        let table_before = model.constant_embedder().table("people").unwrap().to_vec2::<f32>().unwrap();

        let blended = model.embed_constants(&inputs(&[1, 3, 4])).unwrap();
        let rows = blended["people"].to_vec2::<f32>().unwrap();
        let slots = model.adaptive_embedder.as_ref().unwrap().trainable_vars()[0]
            .as_tensor()
            .to_vec2::<f32>()
            .unwrap();

        assert_eq!(rows[0], table_before[1]);
        assert_eq!(rows[1], slots[0]);
        assert_eq!(rows[2], slots[1]);

        // Read-time select only
        let table_after = model.constant_embedder().table("people").unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(table_before, table_after);

        // Past the adaptive slots
        assert!(matches!(model.embed_constants(&inputs(&[5])), Err(KgeError::Shape(_))));
    }

    #[test]
    fn test_per_predicate_scorers() {
        let mut cfg = config("tucker", 3);
        cfg.per_predicate_scorers = true;
        let model = KgeModel::new(fol(), cfg, &device()).unwrap();
        // two tables + two Tucker cores
        assert_eq!(model.trainable_vars().len(), 4);

        let mut groundings = Groundings::new();
        groundings.insert("friend".into(), tuples(&[[0, 1]]));
        groundings.insert("smokes".into(), tuples(&[[0, 1]]));
        let out = model.score(&inputs(&[0, 1, 2]), &groundings, false).unwrap();
        let scores = out.scores.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(scores.len(), 2);
    }

    #[test]
    fn test_regularization_committed_on_success_only() {
        let mut cfg = config("distmult", 4);
        cfg.kge_regularization = 0.1;
        let model = KgeModel::new(fol(), cfg, &device()).unwrap();
        let mut groundings = Groundings::new();
        groundings.insert("friend".into(), tuples(&[[0, 1]]));

        model.score(&inputs(&[0, 1, 2]), &groundings, true).unwrap();
        assert!(model.regularization_loss().unwrap().is_some());

        // A failing call leaves the committed losses untouched
        assert!(model.score(&inputs(&[0, 9]), &groundings, true).is_err());
        assert_eq!(model.take_regularization_losses().len(), 1);
        assert!(model.take_regularization_losses().is_empty());
    }

    #[test]
    fn test_binary_scorer_rejects_other_arities() {
        let fol = Fol::new(
            vec![Domain::new("people", ["ann"])],
            vec![Predicate::new("smokes", ["people"])],
        )
        .unwrap();
        assert!(matches!(
            KgeModel::new(fol.clone(), config("transe", 4), &device()),
            Err(KgeError::Config(_))
        ));
        KgeModel::new(fol, config("distmult", 4), &device()).unwrap();
    }
}
