//! Constant and predicate embedding tables
//!
//! Learned lookup tables that map constant indices (per domain) and predicate
//! indices to dense vectors. Tables are `Var`s owned here and mutated only by
//! the external optimizer; a forward pass only reads them.
//!
//! - [`ConstantEmbeddings`]: one `[num_constants, E_c]` table per domain
//! - [`PredicateEmbeddings`]: one `[num_predicates, E_p]` table
//! - [`AdaptiveConstantEmbeddings`]: learned slots for constants that are not
//!   part of the signature (out-of-vocabulary indices)

mod adaptive;

use std::collections::HashMap;

use candle_core::{Device, Tensor, Var};

use crate::logic::Fol;
use crate::primitives::{gather_rows, host_indices, index_tensor};
use crate::{KgeError, Result};

pub use adaptive::AdaptiveConstantEmbeddings;

/// Domain name → `[n_d]` tensor of constant indices to embed
pub type DomainInputs = HashMap<String, Tensor>;

/// Predicate name → `[n, arity]` tensor of positions into the domain inputs
pub type Groundings = HashMap<String, Tensor>;

/// Normal init with std 1/√dim
fn init_table(rows: usize, dim: usize, device: &Device, what: &str) -> Result<Var> {
    let scale = 1.0f32 / (dim as f32).sqrt();
    Var::from_tensor(
        &Tensor::randn(0.0f32, scale, (rows, dim), device)
            .map_err(|e| KgeError::Tensor(format!("Failed to create {} table: {}", what, e)))?,
    )
    .map_err(|e| KgeError::Tensor(format!("Failed to create {} var: {}", what, e)))
}

/// Check that all indices are below `bound`, returning them on the host
pub(crate) fn checked_indices(indices: &Tensor, bound: usize, what: &str) -> Result<Vec<u32>> {
    let host = host_indices(indices)?;
    if let Some(&bad) = host.iter().find(|&&i| i as usize >= bound) {
        return Err(KgeError::Shape(format!(
            "{} index {} out of range (size {})",
            what, bad, bound
        )));
    }
    Ok(host)
}

/// Per-domain constant embedding tables
#[derive(Debug)]
pub struct ConstantEmbeddings {
    tables: HashMap<String, Var>,
    known: HashMap<String, usize>,
    embedding_size: usize,
}

impl ConstantEmbeddings {
    pub fn new(fol: &Fol, embedding_size: usize, device: &Device) -> Result<Self> {
        if embedding_size == 0 {
            return Err(KgeError::Config("constant embedding size must be > 0".into()));
        }
        let mut tables = HashMap::new();
        let mut known = HashMap::new();
        for domain in fol.domains() {
            // Empty domains still get one padding row for masked lookups
            let rows = domain.len().max(1);
            tables.insert(
                domain.name.clone(),
                init_table(rows, embedding_size, device, &domain.name)?,
            );
            known.insert(domain.name.clone(), domain.len());
        }
        Ok(Self { tables, known, embedding_size })
    }

    pub fn embedding_size(&self) -> usize {
        self.embedding_size
    }

    /// Full table of a domain, `[num_constants, E_c]`
    pub fn table(&self, domain: &str) -> Result<&Tensor> {
        self.tables
            .get(domain)
            .map(Var::as_tensor)
            .ok_or_else(|| KgeError::Shape(format!("Unknown domain '{}'", domain)))
    }

    /// Number of constants of `domain` in the signature
    pub fn known(&self, domain: &str) -> Result<usize> {
        self.known
            .get(domain)
            .copied()
            .ok_or_else(|| KgeError::Shape(format!("Unknown domain '{}'", domain)))
    }

    /// Embed the constants of every domain in `inputs`.
    ///
    /// Returns domain name → `[n_d, E_c]`. Unknown domains and indices past the
    /// domain's constant count are shape errors.
    pub fn embed(&self, inputs: &DomainInputs) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::with_capacity(inputs.len());
        for (name, indices) in inputs {
            let table = self.table(name)?;
            checked_indices(indices, self.known(name)?, &format!("constant ({})", name))?;
            out.insert(name.clone(), gather_rows(table, &indices.flatten_all()?)?);
        }
        Ok(out)
    }

    /// Embed known constants, pointing every index at or past the domain's
    /// constant count to row 0.
    ///
    /// Returns `[n_d, E_c]` with the per-row mask (1 = known constant). The
    /// caller must replace the masked rows.
    pub(crate) fn embed_known(&self, inputs: &DomainInputs) -> Result<HashMap<String, (Tensor, Vec<u8>)>> {
        let mut out = HashMap::with_capacity(inputs.len());
        for (name, indices) in inputs {
            let table = self.table(name)?;
            let known = self.known(name)?;
            let raw = host_indices(indices)?;
            let mask: Vec<u8> = raw.iter().map(|&i| ((i as usize) < known) as u8).collect();
            let fixed: Vec<u32> = raw
                .iter()
                .zip(&mask)
                .map(|(&i, &m)| if m == 1 { i } else { 0 })
                .collect();
            let rows = gather_rows(table, &index_tensor(&fixed, indices.device())?)?;
            out.insert(name.clone(), (rows, mask));
        }
        Ok(out)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();
        names.into_iter().map(|n| self.tables[n].clone()).collect()
    }
}

/// Predicate embedding table, rows in signature order
#[derive(Debug)]
pub struct PredicateEmbeddings {
    table: Var,
}

impl PredicateEmbeddings {
    pub fn new(fol: &Fol, embedding_size: usize, device: &Device) -> Result<Self> {
        if embedding_size == 0 {
            return Err(KgeError::Config("predicate embedding size must be > 0".into()));
        }
        let rows = fol.predicates().len().max(1);
        Ok(Self { table: init_table(rows, embedding_size, device, "predicate")? })
    }

    pub fn embedding_size(&self) -> usize {
        self.table.as_tensor().dims()[1]
    }

    /// The whole table, `[num_predicates, E_p]`
    pub fn all(&self) -> &Tensor {
        self.table.as_tensor()
    }

    /// Embed predicates by global index
    pub fn embed(&self, indices: &Tensor) -> Result<Tensor> {
        checked_indices(indices, self.table.as_tensor().dim(0)?, "predicate")?;
        gather_rows(self.table.as_tensor(), indices)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        vec![self.table.clone()]
    }
}
