//! Adaptive constant embeddings
//!
//! Constants with index `i >= known` (the domain's constant count) are not in
//! the signature. They map to learned slot `i - known`. With `dot_product`
//! the slot acts as a query over the domain's known constants and the result
//! is the attention-weighted mixture of their embeddings.

use std::collections::HashMap;

use candle_core::{Device, Tensor, Var};
use tracing::trace;

use super::{checked_indices, init_table, ConstantEmbeddings, DomainInputs};
use crate::logic::Fol;
use crate::primitives::{gather_rows, index_tensor, softmax};
use crate::{KgeError, Result};

#[derive(Debug)]
pub struct AdaptiveConstantEmbeddings {
    slots: HashMap<String, Var>,
    known: HashMap<String, usize>,
    num_adaptive: usize,
    dot_product: bool,
}

impl AdaptiveConstantEmbeddings {
    pub fn new(
        fol: &Fol,
        embedding_size: usize,
        num_adaptive: usize,
        dot_product: bool,
        device: &Device,
    ) -> Result<Self> {
        if num_adaptive == 0 {
            return Err(KgeError::Config("adaptive constants need at least one slot".into()));
        }
        let mut slots = HashMap::new();
        let mut known = HashMap::new();
        for domain in fol.domains() {
            slots.insert(
                domain.name.clone(),
                init_table(num_adaptive, embedding_size, device, "adaptive constant")?,
            );
            known.insert(domain.name.clone(), domain.len());
        }
        Ok(Self { slots, known, num_adaptive, dot_product })
    }

    pub fn num_adaptive(&self) -> usize {
        self.num_adaptive
    }

    /// Number of constants of `domain` served by the fixed table
    pub fn known(&self, domain: &str) -> Result<usize> {
        self.known
            .get(domain)
            .copied()
            .ok_or_else(|| KgeError::Shape(format!("Unknown domain '{}'", domain)))
    }

    /// Embed raw indices of every domain in `inputs`.
    ///
    /// Indices below the domain's constant count map to slot 0; the caller masks
    /// those rows out. Indices past `known + num_adaptive` are shape errors.
    pub fn embed(
        &self,
        inputs: &DomainInputs,
        constants: &ConstantEmbeddings,
    ) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::with_capacity(inputs.len());
        for (name, indices) in inputs {
            let known = self.known(name)?;
            let raw = checked_indices(
                indices,
                known + self.num_adaptive,
                &format!("adaptive constant ({})", name),
            )?;
            let slot_ids: Vec<u32> = raw
                .iter()
                .map(|&i| (i as usize).saturating_sub(known) as u32)
                .collect();
            trace!(domain = %name, adaptive = raw.iter().filter(|&&i| i as usize >= known).count(), "adaptive lookup");

            let slots = self
                .slots
                .get(name)
                .ok_or_else(|| KgeError::Shape(format!("Unknown domain '{}'", name)))?;
            let queries = gather_rows(slots.as_tensor(), &index_tensor(&slot_ids, indices.device())?)?;

            let embedded = if self.dot_product && known > 0 && !slot_ids.is_empty() {
                let table = constants.table(name)?.narrow(0, 0, known)?;
                let scale = 1.0 / (table.dim(1)? as f64).sqrt();
                let scores = queries
                    .matmul(&table.t()?)
                    .and_then(|s| s.affine(scale, 0.0))
                    .map_err(|e| KgeError::Tensor(format!("adaptive attention failed: {}", e)))?;
                softmax(&scores, 1)?
                    .matmul(&table)
                    .map_err(|e| KgeError::Tensor(format!("adaptive mixture failed: {}", e)))?
            } else {
                queries
            };
            out.insert(name.clone(), embedded);
        }
        Ok(out)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut names: Vec<&String> = self.slots.keys().collect();
        names.sort();
        names.into_iter().map(|n| self.slots[n].clone()).collect()
    }
}
