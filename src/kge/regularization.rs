//! Regularization side channel
//!
//! Scorers, the residual gate and reasoning layers push scalar penalty tensors
//! into a per-call [`RegularizationLosses`]. The model commits them to a
//! [`LossChannel`] only after the whole call succeeded, replacing the previous
//! call's terms; the caller drains the channel once per step.

use candle_core::Tensor;
use parking_lot::Mutex;

use crate::{KgeError, Result};

/// Named penalty terms collected during one forward call
#[derive(Debug, Default)]
pub struct RegularizationLosses {
    terms: Vec<(String, Tensor)>,
}

impl RegularizationLosses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `coefficient * penalty` when the coefficient is positive.
    pub fn add(&mut self, name: impl Into<String>, coefficient: f64, penalty: Tensor) -> Result<()> {
        if coefficient <= 0.0 {
            return Ok(());
        }
        let scaled = penalty
            .affine(coefficient, 0.0)
            .map_err(|e| KgeError::Tensor(format!("scaling regularization failed: {}", e)))?;
        self.terms.push((name.into(), scaled));
        Ok(())
    }

    pub fn extend(&mut self, other: RegularizationLosses) {
        self.terms.extend(other.terms);
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(n, _)| n.as_str())
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.terms.iter().map(|(_, t)| t)
    }

    /// Sum of all terms as a scalar, or `None` when empty
    pub fn total(&self) -> Result<Option<Tensor>> {
        let mut acc: Option<Tensor> = None;
        for (_, t) in &self.terms {
            let t = t.sum_all()?;
            acc = Some(match acc {
                Some(a) => (a + t)?,
                None => t,
            });
        }
        Ok(acc)
    }
}

/// Committed losses of the last successful call
#[derive(Debug, Default)]
pub struct LossChannel {
    committed: Mutex<RegularizationLosses>,
}

impl LossChannel {
    /// Replace the committed terms with those of a successful call
    pub fn commit(&self, losses: RegularizationLosses) {
        *self.committed.lock() = losses;
    }

    /// Drain the committed terms, leaving the channel empty
    pub fn take(&self) -> RegularizationLosses {
        std::mem::take(&mut *self.committed.lock())
    }

    /// Sum of committed terms without draining them
    pub fn total(&self) -> Result<Option<Tensor>> {
        self.committed.lock().total()
    }

    pub fn len(&self) -> usize {
        self.committed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.lock().is_empty()
    }
}
