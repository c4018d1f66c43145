//! Rule groundings and head aggregation
//!
//! A rule grounding batch indexes atoms of the flattened atom batch: for rule
//! `r` with `B` body and `H` head literals, `body` is `[G, B]` and `head` is
//! `[G, H]`, one row per grounding.

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Tensor};

use crate::logic::Rule;
use crate::primitives::{host_indices, index_tensor, TNorm};
use crate::{KgeError, Result};

/// Atom rows of every grounding of one rule
#[derive(Debug, Clone)]
pub struct RuleGrounding {
    /// `[G, B]` atom rows of the body literals
    pub body: Tensor,
    /// `[G, H]` atom rows of the head literals
    pub head: Tensor,
}

impl RuleGrounding {
    pub fn new(body: Tensor, head: Tensor) -> Self {
        Self { body, head }
    }

    /// Build from host rows (`[G][B]` and `[G][H]`)
    pub fn from_rows(body: &[Vec<u32>], head: &[Vec<u32>], device: &Device) -> Result<Self> {
        Ok(Self {
            body: rows_tensor(body, device)?,
            head: rows_tensor(head, device)?,
        })
    }

    pub fn len(&self) -> usize {
        self.body.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn rows_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|r| r.len() != width) {
        return Err(KgeError::Shape("ragged rule grounding rows".into()));
    }
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (rows.len(), width), device)
        .map_err(|e| KgeError::Tensor(format!("rule grounding tensor failed: {}", e)))
}

/// Rule name → groundings
pub type RuleGroundings = HashMap<String, RuleGrounding>;

/// Validated host copy of one rule's groundings
#[derive(Debug, Clone)]
pub(crate) struct CheckedGrounding {
    pub groundings: usize,
    /// Row-major `[G, B]`
    pub body: Vec<u32>,
    /// Row-major `[G, H]`
    pub head: Vec<u32>,
}

impl CheckedGrounding {
    pub fn body_width(&self) -> usize {
        self.body.len().checked_div(self.groundings).unwrap_or(0)
    }

    pub fn head_width(&self) -> usize {
        self.head.len().checked_div(self.groundings).unwrap_or(0)
    }

    /// Atom rows of body position `j` across groundings
    pub fn body_column(&self, j: usize) -> Vec<u32> {
        let b = self.body_width();
        self.body.iter().skip(j).step_by(b.max(1)).copied().collect()
    }

    /// Atom rows of head position `h` across groundings
    pub fn head_column(&self, h: usize) -> Vec<u32> {
        let w = self.head_width();
        self.head.iter().skip(h).step_by(w.max(1)).copied().collect()
    }
}

/// Check every rule grounding against its rule and the atom count.
///
/// Groundings for rules not in `rules` and indices `>= num_atoms` are shape
/// errors. Returns the non-empty groundings, aligned with `rules`.
pub(crate) fn check_groundings(
    rules: &[Rule],
    groundings: &RuleGroundings,
    num_atoms: usize,
) -> Result<Vec<Option<CheckedGrounding>>> {
    if let Some(unknown) = groundings.keys().find(|name| !rules.iter().any(|r| &r.name == *name)) {
        return Err(KgeError::Shape(format!("Groundings for unknown rule '{}'", unknown)));
    }

    let mut out = Vec::with_capacity(rules.len());
    for rule in rules {
        let Some(g) = groundings.get(&rule.name) else {
            out.push(None);
            continue;
        };
        if g.body.elem_count() == 0 {
            out.push(None);
            continue;
        }
        let (rows, body_width) = g.body.dims2().map_err(|_| {
            KgeError::Shape(format!("Body groundings of '{}' must be [G, B]", rule.name))
        })?;
        let (head_rows, head_width) = g.head.dims2().map_err(|_| {
            KgeError::Shape(format!("Head groundings of '{}' must be [G, H]", rule.name))
        })?;
        if body_width != rule.body.len() || head_width != rule.head.len() || head_rows != rows {
            return Err(KgeError::Shape(format!(
                "Groundings of '{}' are [{}, {}] / [{}, {}], rule has {} body and {} head literals",
                rule.name,
                rows,
                body_width,
                head_rows,
                head_width,
                rule.body.len(),
                rule.head.len()
            )));
        }
        let body = host_indices(&g.body)?;
        let head = host_indices(&g.head)?;
        if let Some(&bad) = body.iter().chain(head.iter()).find(|&&i| i as usize >= num_atoms) {
            return Err(KgeError::Shape(format!(
                "Rule '{}' references atom {} but the batch has {} atoms",
                rule.name, bad, num_atoms
            )));
        }
        out.push(Some(CheckedGrounding { groundings: rows, body, head }));
    }
    Ok(out)
}

/// Truth values of body literals, `[G, B]`, with negated literals as `1 - s`.
pub(crate) fn body_truth(scores: &Tensor, rule: &Rule, grounding: &CheckedGrounding) -> Result<Tensor> {
    let flat_scores = scores.flatten_all()?;
    let ids = index_tensor(&grounding.body, scores.device())?;
    let values = flat_scores
        .index_select(&ids, 0)?
        .reshape((grounding.groundings, grounding.body_width()))?;
    negate_columns(&values, rule.body.iter().map(|l| l.negated))
}

/// `v + m·(1 - 2v)` per column: flips the columns whose flag is set
pub(crate) fn negate_columns(values: &Tensor, flags: impl Iterator<Item = bool>) -> Result<Tensor> {
    let flags: Vec<f32> = flags.map(|n| if n { 1.0 } else { 0.0 }).collect();
    if flags.iter().all(|&f| f == 0.0) {
        return Ok(values.clone());
    }
    let width = flags.len();
    let mask = Tensor::from_vec(flags, (1, width), values.device())?;
    let flip = values.affine(-2.0, 1.0)?.broadcast_mul(&mask)?;
    Ok((values + flip)?)
}

/// Embeddings of the atoms at body position `j`, `[G, E]`
pub(crate) fn body_embeddings(embeddings: &Tensor, grounding: &CheckedGrounding, j: usize) -> Result<Tensor> {
    let ids = index_tensor(&grounding.body_column(j), embeddings.device())?;
    Ok(embeddings.index_select(&ids, 0)?)
}

/// How per-grounding values are combined into a head atom
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Aggregation {
    #[default]
    Max,
    Sum,
    Mean,
}

impl std::str::FromStr for Aggregation {
    type Err = KgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "max" => Ok(Aggregation::Max),
            "sum" => Ok(Aggregation::Sum),
            "mean" | "avg" => Ok(Aggregation::Mean),
            other => Err(KgeError::Config(format!("Unknown aggregation type '{}'", other))),
        }
    }
}

/// Values routed to target atoms, accumulated across rules
#[derive(Debug, Default)]
pub(crate) struct HeadMessages {
    values: Vec<Tensor>,
    targets: Vec<u32>,
}

impl HeadMessages {
    /// Route `values` (`[K, D]`) to atom rows `targets` (`K`)
    pub fn push(&mut self, values: Tensor, targets: Vec<u32>) {
        if !targets.is_empty() {
            self.values.push(values);
            self.targets.extend(targets);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// `[N, 1]` with 1 for atoms that received at least one value
    pub fn touched(&self, num_atoms: usize, device: &Device) -> Result<Tensor> {
        let mut mask = vec![0f32; num_atoms];
        for &t in &self.targets {
            mask[t as usize] = 1.0;
        }
        Ok(Tensor::from_vec(mask, (num_atoms, 1), device)?)
    }

    /// Aggregate into `[N, D]`; atoms without values get 0.
    pub fn aggregate(&self, aggregation: Aggregation, num_atoms: usize, width: usize, device: &Device) -> Result<Tensor> {
        let zeros = Tensor::zeros((num_atoms, width), DType::F32, device)?;
        if self.is_empty() {
            return Ok(zeros);
        }
        let values = Tensor::cat(&self.values, 0)?;
        let targets = index_tensor(&self.targets, device)?;

        match aggregation {
            Aggregation::Sum => Ok(zeros.index_add(&targets, &values, 0)?),
            Aggregation::Mean => {
                let mut counts = vec![0f32; num_atoms];
                for &t in &self.targets {
                    counts[t as usize] += 1.0;
                }
                let counts: Vec<f32> = counts.into_iter().map(|c| c.max(1.0)).collect();
                let counts = Tensor::from_vec(counts, (num_atoms, 1), device)?;
                Ok(zeros.index_add(&targets, &values, 0)?.broadcast_div(&counts)?)
            }
            Aggregation::Max => {
                let (atoms, maxima) = self.segment_max(&values, width, device)?;
                Ok(zeros.index_add(&index_tensor(&atoms, device)?, &maxima, 0)?)
            }
        }
    }

    /// Max over the values routed to each touched atom.
    ///
    /// Atoms are bucketed by in-degree rounded up to a power of two and each
    /// bucket is gathered into a padded `[atoms, degree, D]` block, so padding
    /// stays below the number of messages. Returns the touched atom ids and
    /// their `[T, D]` maxima in matching order.
    fn segment_max(&self, values: &Tensor, width: usize, device: &Device) -> Result<(Vec<u32>, Tensor)> {
        let mut by_atom: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for (k, &t) in self.targets.iter().enumerate() {
            by_atom.entry(t).or_default().push(k as u32);
        }
        let mut buckets: BTreeMap<usize, Vec<(u32, Vec<u32>)>> = BTreeMap::new();
        for (atom, members) in by_atom {
            buckets.entry(members.len().next_power_of_two()).or_default().push((atom, members));
        }

        let mut atoms = Vec::new();
        let mut maxima = Vec::with_capacity(buckets.len());
        for (degree, group) in buckets {
            let rows = group.len();
            let mut gather = Vec::with_capacity(rows * degree);
            let mut valid = Vec::with_capacity(rows * degree);
            for (atom, members) in group {
                atoms.push(atom);
                for slot in 0..degree {
                    // Padding points at a real row and is masked out below
                    gather.push(members.get(slot).copied().unwrap_or(members[0]));
                    valid.push(if slot < members.len() { 1f32 } else { 0f32 });
                }
            }
            let block = values
                .index_select(&index_tensor(&gather, device)?, 0)?
                .reshape((rows, degree, width))?;
            let valid = Tensor::from_vec(valid, (rows, degree, 1), device)?;
            let penalty = valid.affine(1e9, -1e9)?;
            maxima.push(block.broadcast_mul(&valid)?.broadcast_add(&penalty)?.max(1)?);
        }
        Ok((atoms, Tensor::cat(&maxima, 0)?))
    }
}

/// Per-grounding activations split by head literal polarity
#[derive(Debug, Default)]
pub(crate) struct Support {
    pub positive: HeadMessages,
    pub negative: HeadMessages,
}

impl Support {
    /// Route `activation` (`[G, D]`) to every head literal of `rule`
    pub fn route(&mut self, activation: &Tensor, rule: &Rule, grounding: &CheckedGrounding) {
        for (h, literal) in rule.head.iter().enumerate() {
            let targets = grounding.head_column(h);
            if literal.negated {
                self.negative.push(activation.clone(), targets);
            } else {
                self.positive.push(activation.clone(), targets);
            }
        }
    }

    /// `score ← disj(score, pos) ∧ ¬neg`, aggregates clipped to [0, 1]
    pub fn disjoin(&self, scores: &Tensor, aggregation: Aggregation, tnorm: TNorm) -> Result<Tensor> {
        let n = scores.dim(0)?;
        let device = scores.device();
        let mut out = scores.clone();
        if !self.positive.is_empty() {
            let agg = self.positive.aggregate(aggregation, n, 1, device)?.clamp(0f32, 1f32)?;
            out = tnorm.disj(&out, &agg)?;
        }
        if !self.negative.is_empty() {
            let agg = self.negative.aggregate(aggregation, n, 1, device)?.clamp(0f32, 1f32)?;
            out = tnorm.conj(&out, &tnorm.neg(&agg)?)?;
        }
        Ok(out)
    }
}
