//! KGE scoring functions
//!
//! Each scorer maps a predicate embedding `p` and the stacked constant
//! embeddings of a tuple to an atom embedding, and has an output function that
//! maps atom embeddings to truth scores.
//!
//! | Scorer   | Atom embedding                              | Output               |
//! |----------|---------------------------------------------|----------------------|
//! | DistMult | `p ⊙ Π c_i`                                 | `σ(Σx)`              |
//! | TransE   | `p + h - t`                                 | `-mean(x²)`          |
//! | ModE     | `p ⊙ h - t`                                 | `exp(-‖x‖)`          |
//! | ComplEx  | `Re(⟨h, r, conj(t)⟩)` per coordinate        | `σ(Σx)`              |
//! | RotatE   | `‖r ∘ t - h‖` per complex coordinate        | `σ(γ - Σx)`          |
//! | Tucker   | `((h ×₁ W) ×₂ t) · p`                       | `σ(x)`               |
//!
//! All scorers accept an empty batch and return `[0, atom_width]`.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor, Var};

use super::regularization::RegularizationLosses;
use crate::primitives::{dropout, l2_loss, n3_loss, sigmoid};
use crate::{KgeError, Result};

/// RotatE margin (γ)
pub const ROTATE_MARGIN: f64 = 6.0;
/// RotatE slack used to size the phase range
pub const ROTATE_EPSILON: f64 = 0.5;
/// Floor under the squared modulus before the square root
const ROTATE_MIN_SQ_NORM: f64 = 1e-9;

// ============================================================================
// Scorer selection
// ============================================================================

/// Names of the available scoring functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoringKind {
    DistMult,
    TransE,
    ComplEx,
    RotatE,
    ModE,
    Tucker,
}

impl ScoringKind {
    pub fn all() -> &'static [ScoringKind] {
        &[
            ScoringKind::DistMult,
            ScoringKind::TransE,
            ScoringKind::ComplEx,
            ScoringKind::RotatE,
            ScoringKind::ModE,
            ScoringKind::Tucker,
        ]
    }

    /// Constant embedding width for atom width `e`
    pub fn constant_width(self, e: usize) -> usize {
        match self {
            ScoringKind::ComplEx | ScoringKind::RotatE => 2 * e,
            _ => e,
        }
    }

    /// Predicate embedding width for atom width `e` (Tucker uses `relation`)
    pub fn predicate_width(self, e: usize, relation: usize) -> usize {
        match self {
            ScoringKind::ComplEx => 2 * e,
            ScoringKind::Tucker => relation,
            _ => e,
        }
    }

    /// Atom embedding width for atom width `e`
    pub fn atom_width(self, e: usize) -> usize {
        match self {
            ScoringKind::Tucker => 1,
            _ => e,
        }
    }

    /// Required predicate arity, `None` when any arity works
    pub fn required_arity(self) -> Option<usize> {
        match self {
            ScoringKind::DistMult => None,
            _ => Some(2),
        }
    }
}

impl FromStr for ScoringKind {
    type Err = KgeError;

    /// Case-insensitive lookup
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "distmult" => Ok(ScoringKind::DistMult),
            "transe" => Ok(ScoringKind::TransE),
            "complex" => Ok(ScoringKind::ComplEx),
            "rotate" => Ok(ScoringKind::RotatE),
            "mode" => Ok(ScoringKind::ModE),
            "tucker" => Ok(ScoringKind::Tucker),
            other => Err(KgeError::Config(format!(
                "Unknown KGE scoring function '{}' (expected one of distmult, transe, complex, rotate, mode, tucker)",
                other
            ))),
        }
    }
}

impl fmt::Display for ScoringKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScoringKind::DistMult => "distmult",
            ScoringKind::TransE => "transe",
            ScoringKind::ComplEx => "complex",
            ScoringKind::RotatE => "rotate",
            ScoringKind::ModE => "mode",
            ScoringKind::Tucker => "tucker",
        };
        write!(f, "{}", name)
    }
}

/// Hyper-parameters shared by every scorer
#[derive(Debug, Clone, PartialEq)]
pub struct ScorerSettings {
    /// Atom embedding width `E`
    pub atom_embedding_size: usize,
    /// L2 coefficient (Σx²/2)
    pub regularization: f64,
    /// N3 coefficient (Σ|x|³)
    pub regularization_n3: f64,
    pub dropout_rate: f32,
}

// ============================================================================
// Output functions
// ============================================================================

/// Maps atom embeddings `[B, W]` to scores `[B]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFn {
    /// σ(Σx)
    SumSigmoid,
    /// -mean(x²), unbounded
    NegMeanSquare,
    /// exp(-‖x‖₂)
    ExpNegNorm,
    /// σ(margin - Σx)
    MarginSigmoid { margin: f64 },
}

impl OutputFn {
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let rows = x.dim(0)?;
        if rows == 0 {
            return Ok(Tensor::zeros(0, DType::F32, x.device())?);
        }
        let last = x.rank() - 1;
        match self {
            OutputFn::SumSigmoid => sigmoid(&x.sum(last)?),
            OutputFn::NegMeanSquare => x
                .sqr()
                .and_then(|s| s.mean(last))
                .and_then(|m| m.neg())
                .map_err(|e| KgeError::Tensor(format!("TransE output failed: {}", e))),
            OutputFn::ExpNegNorm => x
                .sqr()
                .and_then(|s| s.sum(last))
                .and_then(|s| s.affine(1.0, 1e-12))
                .and_then(|s| s.sqrt())
                .and_then(|n| n.neg())
                .and_then(|n| n.exp())
                .map_err(|e| KgeError::Tensor(format!("ModE output failed: {}", e))),
            OutputFn::MarginSigmoid { margin } => {
                let shifted = x
                    .sum(last)
                    .and_then(|s| s.affine(-1.0, *margin))
                    .map_err(|e| KgeError::Tensor(format!("RotatE output failed: {}", e)))?;
                sigmoid(&shifted)
            }
        }
    }
}

// ============================================================================
// Scorers
// ============================================================================

/// RotatE phase parameters derived from the atom width
#[derive(Debug, Clone)]
pub struct RotatEScorer {
    pub settings: ScorerSettings,
    /// `(γ + ε) / E`
    pub embedding_range: f64,
}

impl RotatEScorer {
    /// Scale taking predicate embeddings to phases: `π / embedding_range`
    pub fn norm_factor(&self) -> f64 {
        PI / self.embedding_range
    }
}

/// Tucker scorer with its core tensor `W: [E, E, R]`
#[derive(Debug)]
pub struct TuckerScorer {
    pub settings: ScorerSettings,
    pub core: Var,
}

/// A scoring function together with the parameters it owns
#[derive(Debug)]
pub enum KgeScorer {
    DistMult(ScorerSettings),
    TransE(ScorerSettings),
    ComplEx(ScorerSettings),
    RotatE(RotatEScorer),
    ModE(ScorerSettings),
    Tucker(TuckerScorer),
}

impl KgeScorer {
    /// Build a scorer. `relation_size` is Tucker's `R` (ignored elsewhere).
    pub fn new(
        kind: ScoringKind,
        settings: ScorerSettings,
        relation_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let e = settings.atom_embedding_size;
        if e == 0 {
            return Err(KgeError::Config("atom embedding size must be > 0".into()));
        }
        if !(0.0..1.0).contains(&settings.dropout_rate) {
            return Err(KgeError::Config(format!(
                "dropout rate must be in [0, 1), got {}",
                settings.dropout_rate
            )));
        }
        Ok(match kind {
            ScoringKind::DistMult => KgeScorer::DistMult(settings),
            ScoringKind::TransE => KgeScorer::TransE(settings),
            ScoringKind::ComplEx => KgeScorer::ComplEx(settings),
            ScoringKind::ModE => KgeScorer::ModE(settings),
            ScoringKind::RotatE => KgeScorer::RotatE(RotatEScorer {
                embedding_range: (ROTATE_MARGIN + ROTATE_EPSILON) / e as f64,
                settings,
            }),
            ScoringKind::Tucker => {
                if relation_size == 0 {
                    return Err(KgeError::Config("Tucker relation size must be > 0".into()));
                }
                // Glorot uniform over [E, E, R]: fan_in = E·E, fan_out = R·E
                let limit = (6.0 / (e * e + relation_size * e) as f64).sqrt() as f32;
                let core = Var::from_tensor(
                    &Tensor::rand(-limit, limit, (e, e, relation_size), device)
                        .map_err(|err| KgeError::Tensor(format!("Failed to create Tucker core: {}", err)))?,
                )
                .map_err(|err| KgeError::Tensor(format!("Failed to create Tucker var: {}", err)))?;
                KgeScorer::Tucker(TuckerScorer { settings, core })
            }
        })
    }

    pub fn kind(&self) -> ScoringKind {
        match self {
            KgeScorer::DistMult(_) => ScoringKind::DistMult,
            KgeScorer::TransE(_) => ScoringKind::TransE,
            KgeScorer::ComplEx(_) => ScoringKind::ComplEx,
            KgeScorer::RotatE(_) => ScoringKind::RotatE,
            KgeScorer::ModE(_) => ScoringKind::ModE,
            KgeScorer::Tucker(_) => ScoringKind::Tucker,
        }
    }

    pub fn settings(&self) -> &ScorerSettings {
        match self {
            KgeScorer::DistMult(s)
            | KgeScorer::TransE(s)
            | KgeScorer::ComplEx(s)
            | KgeScorer::ModE(s) => s,
            KgeScorer::RotatE(r) => &r.settings,
            KgeScorer::Tucker(t) => &t.settings,
        }
    }

    /// Expected constant embedding width
    pub fn input_size(&self) -> usize {
        self.kind().constant_width(self.settings().atom_embedding_size)
    }

    /// Expected predicate embedding width
    pub fn predicate_size(&self) -> usize {
        let relation = match self {
            KgeScorer::Tucker(t) => t.core.as_tensor().dims()[2],
            _ => 0,
        };
        self.kind().predicate_width(self.settings().atom_embedding_size, relation)
    }

    /// Width of the produced atom embeddings
    pub fn output_size(&self) -> usize {
        self.kind().atom_width(self.settings().atom_embedding_size)
    }

    pub fn required_arity(&self) -> Option<usize> {
        self.kind().required_arity()
    }

    pub fn output_fn(&self) -> OutputFn {
        match self {
            KgeScorer::DistMult(_) | KgeScorer::ComplEx(_) | KgeScorer::Tucker(_) => OutputFn::SumSigmoid,
            KgeScorer::TransE(_) => OutputFn::NegMeanSquare,
            KgeScorer::ModE(_) => OutputFn::ExpNegNorm,
            KgeScorer::RotatE(_) => OutputFn::MarginSigmoid { margin: ROTATE_MARGIN },
        }
    }

    /// Atom scores `[B]` from atom embeddings `[B, output_size]`
    pub fn output(&self, embeddings: &Tensor) -> Result<Tensor> {
        self.output_fn().apply(embeddings)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        match self {
            KgeScorer::Tucker(t) => vec![t.core.clone()],
            _ => Vec::new(),
        }
    }

    /// Atom embeddings `[B, output_size]` from predicate embeddings `[B, E_p]`
    /// and stacked constant embeddings `[B, K, E_c]`.
    ///
    /// Dropout is applied only when `train` is set. Penalties are pushed into
    /// `losses` when their coefficients are positive.
    pub fn embed(
        &self,
        predicates: &Tensor,
        constants: &Tensor,
        train: bool,
        losses: &mut RegularizationLosses,
    ) -> Result<Tensor> {
        self.check_inputs(predicates, constants)?;
        let rows = predicates.dim(0)?;
        if rows == 0 {
            return Ok(Tensor::zeros((0, self.output_size()), DType::F32, predicates.device())?);
        }

        let settings = self.settings();
        let p = dropout(predicates, settings.dropout_rate, train)?;
        let c = dropout(constants, settings.dropout_rate, train)?;

        match self {
            KgeScorer::DistMult(s) => {
                let arity = c.dim(1)?;
                let mut x = p;
                for i in 0..arity {
                    x = x.mul(&c.narrow(1, i, 1)?.squeeze(1)?)?;
                }
                add_embedding_penalties(&x, s, "distmult", losses)?;
                Ok(x)
            }
            KgeScorer::TransE(s) => {
                let (h, t) = head_tail(&c)?;
                let x = ((p + h)? - t)?;
                add_embedding_penalties(&x, s, "transe", losses)?;
                Ok(x)
            }
            KgeScorer::ModE(s) => {
                let (h, t) = head_tail(&c)?;
                let x = (p.mul(&h)? - t)?;
                add_embedding_penalties(&x, s, "mode", losses)?;
                Ok(x)
            }
            KgeScorer::ComplEx(s) => complex_embed(&p, &c, s, losses),
            KgeScorer::RotatE(r) => rotate_embed(&p, &c, r),
            KgeScorer::Tucker(t) => tucker_embed(&p, &c, t, train, losses),
        }
    }

    fn check_inputs(&self, predicates: &Tensor, constants: &Tensor) -> Result<()> {
        let (p_rows, p_width) = predicates.dims2().map_err(|_| {
            KgeError::Shape(format!(
                "{} expects predicate embeddings [B, E_p], got {:?}",
                self.kind(),
                predicates.dims()
            ))
        })?;
        let (c_rows, arity, c_width) = constants.dims3().map_err(|_| {
            KgeError::Shape(format!(
                "{} expects constant embeddings [B, K, E_c], got {:?}",
                self.kind(),
                constants.dims()
            ))
        })?;
        if p_rows != c_rows {
            return Err(KgeError::Shape(format!(
                "{}: {} predicate rows vs {} constant rows",
                self.kind(),
                p_rows,
                c_rows
            )));
        }
        if p_width != self.predicate_size() || c_width != self.input_size() {
            return Err(KgeError::Shape(format!(
                "{} expects widths (p={}, c={}), got (p={}, c={})",
                self.kind(),
                self.predicate_size(),
                self.input_size(),
                p_width,
                c_width
            )));
        }
        if let Some(required) = self.required_arity() {
            if arity != required {
                return Err(KgeError::Shape(format!(
                    "{} requires arity {}, got {}",
                    self.kind(),
                    required,
                    arity
                )));
            }
        }
        Ok(())
    }
}

/// Split `[B, 2, W]` into head and tail `[B, W]`
fn head_tail(c: &Tensor) -> Result<(Tensor, Tensor)> {
    let head = c.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
    let tail = c.narrow(1, 1, 1)?.squeeze(1)?.contiguous()?;
    Ok((head, tail))
}

/// Split the last dimension into real and imaginary halves
fn re_im(x: &Tensor) -> Result<(Tensor, Tensor)> {
    let halves = x.chunk(2, x.rank() - 1)?;
    Ok((halves[0].contiguous()?, halves[1].contiguous()?))
}

fn add_embedding_penalties(
    x: &Tensor,
    settings: &ScorerSettings,
    name: &str,
    losses: &mut RegularizationLosses,
) -> Result<()> {
    if settings.regularization > 0.0 {
        losses.add(format!("{}.l2", name), settings.regularization, l2_loss(x)?)?;
    }
    if settings.regularization_n3 > 0.0 {
        losses.add(format!("{}.n3", name), settings.regularization_n3, n3_loss(x)?)?;
    }
    Ok(())
}

fn complex_embed(
    p: &Tensor,
    c: &Tensor,
    settings: &ScorerSettings,
    losses: &mut RegularizationLosses,
) -> Result<Tensor> {
    let (h, t) = head_tail(c)?;
    let (rr, ri) = re_im(p)?;
    let (hr, hi) = re_im(&h)?;
    let (tr, ti) = re_im(&t)?;

    let e1 = rr.mul(&hr)?.mul(&tr)?;
    let e2 = rr.mul(&hi)?.mul(&ti)?;
    let e3 = ri.mul(&hr)?.mul(&ti)?;
    let e4 = ri.mul(&hi)?.mul(&tr)?;
    let x = (((e1 + e2)? + e3)? - e4)?;

    if settings.regularization > 0.0 {
        let penalty = (l2_loss(&rr)? + l2_loss(&ri)?)?;
        losses.add("complex.l2", settings.regularization, penalty)?;
    }
    if settings.regularization_n3 > 0.0 {
        let penalty = ((n3_loss(&h)? + n3_loss(&t)?)? + n3_loss(p)?)?;
        losses.add("complex.n3", settings.regularization_n3, penalty)?;
    }
    Ok(x)
}

fn rotate_embed(p: &Tensor, c: &Tensor, scorer: &RotatEScorer) -> Result<Tensor> {
    let (h, t) = head_tail(c)?;
    let (re_head, im_head) = re_im(&h)?;
    let (re_tail, im_tail) = re_im(&t)?;

    let phase = p.affine(scorer.norm_factor(), 0.0)?;
    let re_rel = phase.cos()?;
    let im_rel = phase.sin()?;

    let re_score = ((re_rel.mul(&re_tail)? + im_rel.mul(&im_tail)?)? - re_head)?;
    let im_score = ((re_rel.mul(&im_tail)? - im_rel.mul(&re_tail)?)? - im_head)?;

    (re_score.sqr()? + im_score.sqr()?)?
        .maximum(ROTATE_MIN_SQ_NORM)
        .and_then(|s| s.sqrt())
        .map_err(|e| KgeError::Tensor(format!("RotatE modulus failed: {}", e)))
}

fn tucker_embed(
    p: &Tensor,
    c: &Tensor,
    scorer: &TuckerScorer,
    train: bool,
    losses: &mut RegularizationLosses,
) -> Result<Tensor> {
    let (h, t) = head_tail(c)?;
    let (e, _, r) = scorer.core.as_tensor().dims3()?;
    let rows = h.dim(0)?;
    let w = dropout(scorer.core.as_tensor(), scorer.settings.dropout_rate, train)?;

    // [B, E] x [E, E·R] → [B, E, R]
    let w1 = h.matmul(&w.reshape((e, e * r))?)?.reshape((rows, e, r))?;
    // [B, 1, E] x [B, E, R] → [B, R]
    let w2 = t.unsqueeze(1)?.matmul(&w1)?.squeeze(1)?;
    let x = w2
        .mul(p)
        .and_then(|x| x.sum_keepdim(1))
        .map_err(|err| KgeError::Tensor(format!("Tucker contraction failed: {}", err)))?;

    if scorer.settings.regularization > 0.0 {
        losses.add("tucker.l2", scorer.settings.regularization, l2_loss(scorer.core.as_tensor())?)?;
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::Cpu
    }

    fn settings(e: usize) -> ScorerSettings {
        ScorerSettings {
            atom_embedding_size: e,
            regularization: 0.0,
            regularization_n3: 0.0,
            dropout_rate: 0.0,
        }
    }

    fn scorer(kind: ScoringKind, e: usize) -> KgeScorer {
        KgeScorer::new(kind, settings(e), e, &device()).unwrap()
    }

    fn randn(shape: &[usize]) -> Tensor {
        Tensor::randn(0.0f32, 1.0, shape, &device()).unwrap()
    }

    fn score(s: &KgeScorer, p: &Tensor, c: &Tensor) -> Vec<f32> {
        let mut losses = RegularizationLosses::new();
        let x = s.embed(p, c, false, &mut losses).unwrap();
        s.output(&x).unwrap().to_vec1::<f32>().unwrap()
    }

    /// Stack head and tail `[B, W]` into `[B, 2, W]`
    fn pair(h: &Tensor, t: &Tensor) -> Tensor {
        Tensor::stack(&[h, t], 1).unwrap()
    }

    #[test]
    fn test_factory_case_insensitive() {
        assert_eq!("DistMult".parse::<ScoringKind>().unwrap(), ScoringKind::DistMult);
        assert_eq!("ROTATE".parse::<ScoringKind>().unwrap(), ScoringKind::RotatE);
        assert_eq!("ComplEx".parse::<ScoringKind>().unwrap(), ScoringKind::ComplEx);
        assert!(matches!("hole".parse::<ScoringKind>(), Err(KgeError::Config(_))));
        for kind in ScoringKind::all() {
            assert_eq!(kind.to_string().parse::<ScoringKind>().unwrap(), *kind);
        }
    }

    #[test]
    fn test_widths() {
        let e = 4;
        let complex = scorer(ScoringKind::ComplEx, e);
        assert_eq!((complex.input_size(), complex.predicate_size(), complex.output_size()), (8, 8, 4));
        let rotate = scorer(ScoringKind::RotatE, e);
        assert_eq!((rotate.input_size(), rotate.predicate_size(), rotate.output_size()), (8, 4, 4));
        let tucker = scorer(ScoringKind::Tucker, e);
        assert_eq!((tucker.input_size(), tucker.predicate_size(), tucker.output_size()), (4, 4, 1));
        let transe = scorer(ScoringKind::TransE, e);
        assert_eq!((transe.input_size(), transe.predicate_size(), transe.output_size()), (4, 4, 4));
    }

    #[test]
    fn test_empty_batch_all_scorers() {
        let e = 4;
        for kind in ScoringKind::all() {
            let s = scorer(*kind, e);
            let p = Tensor::zeros((0, s.predicate_size()), DType::F32, &device()).unwrap();
            let c = Tensor::zeros((0, 2, s.input_size()), DType::F32, &device()).unwrap();
            let mut losses = RegularizationLosses::new();
            let x = s.embed(&p, &c, true, &mut losses).unwrap();
            assert_eq!(x.dims(), &[0, s.output_size()], "{}", kind);
            assert_eq!(s.output(&x).unwrap().dims(), &[0], "{}", kind);
        }
    }

    #[test]
    fn test_bounded_outputs() {
        let e = 8;
        let b = 16;
        for kind in [
            ScoringKind::DistMult,
            ScoringKind::ComplEx,
            ScoringKind::ModE,
            ScoringKind::RotatE,
            ScoringKind::Tucker,
        ] {
            let s = scorer(kind, e);
            let p = randn(&[b, s.predicate_size()]);
            let c = randn(&[b, 2, s.input_size()]);
            for v in score(&s, &p, &c) {
                assert!((0.0..=1.0).contains(&v), "{} produced {}", kind, v);
            }
        }
    }

    #[test]
    fn test_transe_monotone_in_distance() {
        let s = scorer(ScoringKind::TransE, 2);
        let p = Tensor::new(&[[0f32, 0.0], [0.0, 0.0]], &device()).unwrap();
        let h = Tensor::new(&[[1f32, 0.0], [3.0, 0.0]], &device()).unwrap();
        let t = Tensor::zeros((2, 2), DType::F32, &device()).unwrap();
        let scores = score(&s, &p, &pair(&h, &t));
        // mean(x²): 0.5 and 4.5
        assert!((scores[0] + 0.5).abs() < 1e-5);
        assert!((scores[1] + 4.5).abs() < 1e-5);
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn test_distmult_symmetric_transe_not() {
        let e = 6;
        let p = randn(&[3, e]);
        let h = randn(&[3, e]);
        let t = randn(&[3, e]);

        let distmult = scorer(ScoringKind::DistMult, e);
        let forward = score(&distmult, &p, &pair(&h, &t));
        let backward = score(&distmult, &p, &pair(&t, &h));
        for (a, b) in forward.iter().zip(backward.iter()) {
            assert!((a - b).abs() < 1e-5);
        }

        let p = Tensor::ones((1, 2), DType::F32, &device()).unwrap();
        let h = Tensor::new(&[[1f32, 2.0]], &device()).unwrap();
        let t = Tensor::new(&[[0f32, -1.0]], &device()).unwrap();
        let transe = scorer(ScoringKind::TransE, 2);
        let forward = score(&transe, &p, &pair(&h, &t));
        let backward = score(&transe, &p, &pair(&t, &h));
        assert!((forward[0] - backward[0]).abs() > 1e-3);
    }

    #[test]
    fn test_distmult_any_arity() {
        let s = scorer(ScoringKind::DistMult, 3);
        let p = Tensor::ones((1, 3), DType::F32, &device()).unwrap();
        let c = Tensor::new(&[[[1f32, 2.0, 3.0], [2.0, 2.0, 2.0], [1.0, 0.5, 0.0]]], &device()).unwrap();
        let mut losses = RegularizationLosses::new();
        let x = s.embed(&p, &c, false, &mut losses).unwrap();
        assert_eq!(x.to_vec2::<f32>().unwrap(), vec![vec![2.0, 2.0, 0.0]]);
    }

    #[test]
    fn test_arity_enforced_for_binary_scorers() {
        let s = scorer(ScoringKind::TransE, 3);
        let p = randn(&[2, 3]);
        let c = randn(&[2, 3, 3]);
        let mut losses = RegularizationLosses::new();
        assert!(matches!(s.embed(&p, &c, false, &mut losses), Err(KgeError::Shape(_))));
    }

    #[test]
    fn test_width_mismatch_is_shape_error() {
        let s = scorer(ScoringKind::ComplEx, 3);
        let p = randn(&[2, 3]);
        let c = randn(&[2, 2, 6]);
        let mut losses = RegularizationLosses::new();
        assert!(matches!(s.embed(&p, &c, false, &mut losses), Err(KgeError::Shape(_))));
    }

    #[test]
    fn test_rotate_range_and_perfect_match() {
        let e = 5;
        let s = scorer(ScoringKind::RotatE, e);
        if let KgeScorer::RotatE(r) = &s {
            assert!((r.embedding_range - 6.5 / e as f64).abs() < 1e-12);
        } else {
            panic!("expected RotatE");
        }

        // Zero phase, head == tail → modulus ≈ sqrt(1e-9) per coordinate
        let p = Tensor::zeros((1, e), DType::F32, &device()).unwrap();
        let h = randn(&[1, 2 * e]);
        let mut losses = RegularizationLosses::new();
        let x = s.embed(&p, &pair(&h, &h), false, &mut losses).unwrap();
        for v in x.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!(v < 1e-4);
        }
        let out = s.output(&x).unwrap().to_vec1::<f32>().unwrap()[0];
        let expected = 1.0 / (1.0 + (-6.0f32).exp());
        assert!((out - expected).abs() < 1e-3);
        assert!(losses.is_empty());
    }

    #[test]
    fn test_complex_matches_formula() {
        let s = scorer(ScoringKind::ComplEx, 1);
        // R = (1 + 2i), h = (3 + 4i), t = (5 + 6i)
        let p = Tensor::new(&[[1f32, 2.0]], &device()).unwrap();
        let h = Tensor::new(&[[3f32, 4.0]], &device()).unwrap();
        let t = Tensor::new(&[[5f32, 6.0]], &device()).unwrap();
        let mut losses = RegularizationLosses::new();
        let x = s.embed(&p, &pair(&h, &t), false, &mut losses).unwrap();
        // 1·3·5 + 1·4·6 + 2·3·6 - 2·4·5 = 15 + 24 + 36 - 40 = 35
        assert!((x.to_vec2::<f32>().unwrap()[0][0] - 35.0).abs() < 1e-4);
    }

    #[test]
    fn test_mode_perfect_match_scores_one() {
        let s = scorer(ScoringKind::ModE, 3);
        let p = Tensor::ones((1, 3), DType::F32, &device()).unwrap();
        let h = randn(&[1, 3]);
        let out = score(&s, &p, &pair(&h, &h));
        assert!((out[0] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_tucker_output_width() {
        let s = scorer(ScoringKind::Tucker, 4);
        let p = randn(&[3, 4]);
        let c = randn(&[3, 2, 4]);
        let mut losses = RegularizationLosses::new();
        let x = s.embed(&p, &c, false, &mut losses).unwrap();
        assert_eq!(x.dims(), &[3, 1]);
        assert_eq!(s.trainable_vars().len(), 1);
    }

    #[test]
    fn test_regularization_terms() {
        let mut cfg = settings(4);
        cfg.regularization = 0.1;
        cfg.regularization_n3 = 0.01;
        let p = randn(&[2, 4]);
        let c = randn(&[2, 2, 4]);

        let distmult = KgeScorer::new(ScoringKind::DistMult, cfg.clone(), 4, &device()).unwrap();
        let mut losses = RegularizationLosses::new();
        distmult.embed(&p, &c, false, &mut losses).unwrap();
        assert_eq!(losses.names().collect::<Vec<_>>(), vec!["distmult.l2", "distmult.n3"]);

        let tucker = KgeScorer::new(ScoringKind::Tucker, cfg.clone(), 4, &device()).unwrap();
        let mut losses = RegularizationLosses::new();
        tucker.embed(&p, &c, false, &mut losses).unwrap();
        assert_eq!(losses.names().collect::<Vec<_>>(), vec!["tucker.l2"]);

        let rotate = KgeScorer::new(ScoringKind::RotatE, cfg, 4, &device()).unwrap();
        let c = randn(&[2, 2, 8]);
        let mut losses = RegularizationLosses::new();
        rotate.embed(&p, &c, false, &mut losses).unwrap();
        assert!(losses.is_empty());
    }

    #[test]
    fn test_invalid_settings() {
        let mut cfg = settings(4);
        cfg.dropout_rate = 1.0;
        assert!(matches!(
            KgeScorer::new(ScoringKind::DistMult, cfg, 4, &device()),
            Err(KgeError::Config(_))
        ));
        assert!(KgeScorer::new(ScoringKind::DistMult, settings(0), 4, &device()).is_err());
    }
}
