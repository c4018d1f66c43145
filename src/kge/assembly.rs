//! Atom assembly
//!
//! Turns a grounding batch (predicate → `[n, arity]` tuples of positions into
//! the domain inputs) into row-aligned predicate embeddings `[n, E_p]` and
//! stacked constant embeddings `[n, arity, E_c]`.
//!
//! Rows are ordered by signature predicate order, then by the order of the
//! tuples in the batch. Predicates missing from the batch, or present with
//! zero tuples, contribute no rows.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::embeddings::{checked_indices, Groundings};
use crate::logic::Fol;
use crate::primitives::{gather_rows, host_indices, index_tensor};
use crate::{KgeError, Result};

/// Atoms of one predicate inside the flattened batch
#[derive(Debug, Clone)]
pub struct AtomSegment {
    pub predicate: String,
    /// Global predicate index in the signature
    pub predicate_index: usize,
    /// First row of this segment in the flattened batch
    pub offset: usize,
    /// `[n, E_p]`, the predicate embedding repeated per tuple
    pub predicates: Tensor,
    /// `[n, arity, E_c]`
    pub constants: Tensor,
}

impl AtomSegment {
    pub fn rows(&self) -> usize {
        self.predicates.dims()[0]
    }

    pub fn arity(&self) -> usize {
        self.constants.dims()[1]
    }
}

/// Row-aligned inputs of all atoms in a batch, segmented per predicate
#[derive(Debug, Clone)]
pub struct AtomAssembly {
    segments: Vec<AtomSegment>,
    num_atoms: usize,
    predicate_width: usize,
    constant_width: usize,
    default_arity: usize,
    device: Device,
}

impl AtomAssembly {
    /// Gather and stack embeddings for every grounded atom.
    ///
    /// - `constant_embeddings`: domain name → `[n_d, E_c]` embedded domain inputs
    /// - `predicate_table`: `[num_predicates, E_p]`, rows in signature order
    /// - `groundings`: predicate name → `[n, arity]` positions into the domain inputs
    pub fn build(
        fol: &Fol,
        constant_embeddings: &HashMap<String, Tensor>,
        predicate_table: &Tensor,
        groundings: &Groundings,
        constant_width: usize,
    ) -> Result<Self> {
        if let Some(unknown) = groundings.keys().find(|name| fol.predicate(name).is_none()) {
            return Err(KgeError::Shape(format!(
                "Groundings reference unknown predicate '{}'",
                unknown
            )));
        }
        let predicate_width = predicate_table.dim(1)?;

        let mut segments = Vec::new();
        let mut offset = 0;
        for (predicate_index, predicate) in fol.predicates().iter().enumerate() {
            let Some(tuples) = groundings.get(&predicate.name) else {
                continue;
            };
            if tuples.elem_count() == 0 {
                continue;
            }
            let arity = predicate.arity();
            let (rows, width) = tuples.dims2().map_err(|_| {
                KgeError::Shape(format!(
                    "Groundings of '{}' must be [n, {}], got {:?}",
                    predicate.name,
                    arity,
                    tuples.dims()
                ))
            })?;
            if width != arity {
                return Err(KgeError::Shape(format!(
                    "Groundings of '{}' have {} columns, predicate arity is {}",
                    predicate.name, width, arity
                )));
            }

            let flat = host_indices(tuples)?;
            let mut per_position = Vec::with_capacity(arity);
            for (i, domain) in predicate.domains.iter().enumerate() {
                let table = constant_embeddings.get(domain).ok_or_else(|| {
                    KgeError::Shape(format!(
                        "No inputs for domain '{}' used by predicate '{}'",
                        domain, predicate.name
                    ))
                })?;
                let column: Vec<u32> = flat.iter().skip(i).step_by(arity).copied().collect();
                let column = index_tensor(&column, tuples.device())?;
                checked_indices(
                    &column,
                    table.dim(0)?,
                    &format!("'{}' position {} ({})", predicate.name, i, domain),
                )?;
                per_position.push(gather_rows(table, &column)?);
            }
            let constants = Tensor::stack(&per_position, 1)?;

            let predicates = predicate_table
                .narrow(0, predicate_index, 1)?
                .broadcast_as((rows, predicate_width))?
                .contiguous()?;

            if predicates.dim(0)? != constants.dim(0)? {
                return Err(KgeError::Shape(format!(
                    "'{}': {} predicate rows vs {} constant rows",
                    predicate.name,
                    predicates.dim(0)?,
                    constants.dim(0)?
                )));
            }

            segments.push(AtomSegment {
                predicate: predicate.name.clone(),
                predicate_index,
                offset,
                predicates,
                constants,
            });
            offset += rows;
        }

        debug!(atoms = offset, predicates = segments.len(), "assembled atoms");
        Ok(Self {
            segments,
            num_atoms: offset,
            predicate_width,
            constant_width,
            default_arity: fol.max_arity(),
            device: predicate_table.device().clone(),
        })
    }

    /// Total number of atoms `N`
    pub fn num_atoms(&self) -> usize {
        self.num_atoms
    }

    pub fn segments(&self) -> &[AtomSegment] {
        &self.segments
    }

    pub fn segment(&self, predicate: &str) -> Option<&AtomSegment> {
        self.segments.iter().find(|s| s.predicate == predicate)
    }

    /// True when every segment has the same arity (or there are none)
    pub fn has_uniform_arity(&self) -> bool {
        self.segments
            .first()
            .map(|first| self.segments.iter().all(|s| s.arity() == first.arity()))
            .unwrap_or(true)
    }

    /// The whole batch as `([N, E_p], [N, K, E_c])`.
    ///
    /// Fails with a shape error when predicates of different arities are mixed.
    pub fn stacked(&self) -> Result<(Tensor, Tensor)> {
        if self.segments.is_empty() {
            let p = Tensor::zeros((0, self.predicate_width), DType::F32, &self.device)?;
            let c = Tensor::zeros((0, self.default_arity, self.constant_width), DType::F32, &self.device)?;
            return Ok((p, c));
        }
        let arity = self.segments[0].arity();
        if let Some(other) = self.segments.iter().find(|s| s.arity() != arity) {
            return Err(KgeError::Shape(format!(
                "Cannot stack atoms of arity {} with '{}' of arity {}",
                arity,
                other.predicate,
                other.arity()
            )));
        }
        let predicates: Vec<&Tensor> = self.segments.iter().map(|s| &s.predicates).collect();
        let constants: Vec<&Tensor> = self.segments.iter().map(|s| &s.constants).collect();
        let p = Tensor::cat(&predicates, 0)?;
        let c = Tensor::cat(&constants, 0)?;
        if p.dim(0)? != c.dim(0)? {
            return Err(KgeError::Shape(format!(
                "{} predicate rows vs {} constant rows",
                p.dim(0)?,
                c.dim(0)?
            )));
        }
        Ok((p, c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::{Domain, Predicate};

    fn fol() -> Fol {
        Fol::new(
            vec![
                Domain::new("people", ["ann", "bob", "cid"]),
                Domain::new("cities", ["rome", "oslo"]),
            ],
            vec![
                Predicate::new("friend", ["people", "people"]),
                Predicate::new("lives", ["people", "cities"]),
                Predicate::new("between", ["cities", "cities", "cities"]),
            ],
        )
        .unwrap()
    }

    fn constants() -> HashMap<String, Tensor> {
        let device = Device::Cpu;
        let mut map = HashMap::new();
        // Row r of each domain is filled with r (people) or 10 + r (cities)
        map.insert(
            "people".to_string(),
            Tensor::new(&[[0f32, 0.0], [1.0, 1.0], [2.0, 2.0]], &device).unwrap(),
        );
        map.insert(
            "cities".to_string(),
            Tensor::new(&[[10f32, 10.0], [11.0, 11.0]], &device).unwrap(),
        );
        map
    }

    fn predicate_table() -> Tensor {
        Tensor::new(&[[0f32, 0.0, 0.0], [1.0, 1.0, 1.0], [2.0, 2.0, 2.0]], &Device::Cpu).unwrap()
    }

    fn tuples(rows: &[[u32; 2]]) -> Tensor {
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_signature_order_and_shapes() {
        let mut groundings = Groundings::new();
        // Inserted out of signature order on purpose
        groundings.insert("lives".into(), tuples(&[[2, 1]]));
        groundings.insert("friend".into(), tuples(&[[0, 1], [1, 2]]));

        let atoms = AtomAssembly::build(&fol(), &constants(), &predicate_table(), &groundings, 2).unwrap();
        assert_eq!(atoms.num_atoms(), 3);

        let (p, c) = atoms.stacked().unwrap();
        assert_eq!(p.dims(), &[3, 3]);
        assert_eq!(c.dims(), &[3, 2, 2]);

        let p = p.to_vec2::<f32>().unwrap();
        assert_eq!(p[0], vec![0.0; 3]);
        assert_eq!(p[1], vec![0.0; 3]);
        assert_eq!(p[2], vec![1.0; 3]);

        // lives(cid, oslo) is the last row
        let c = c.to_vec3::<f32>().unwrap();
        assert_eq!(c[2][0], vec![2.0, 2.0]);
        assert_eq!(c[2][1], vec![11.0, 11.0]);

        let lives = atoms.segment("lives").unwrap();
        assert_eq!((lives.offset, lives.rows()), (2, 1));
    }

    #[test]
    fn test_absent_and_empty_predicates_skipped() {
        let mut groundings = Groundings::new();
        groundings.insert(
            "friend".into(),
            Tensor::zeros((0, 2), DType::U32, &Device::Cpu).unwrap(),
        );
        groundings.insert("lives".into(), tuples(&[[0, 0]]));

        let atoms = AtomAssembly::build(&fol(), &constants(), &predicate_table(), &groundings, 2).unwrap();
        assert_eq!(atoms.num_atoms(), 1);
        assert_eq!(atoms.segments().len(), 1);
        assert_eq!(atoms.segments()[0].offset, 0);
    }

    #[test]
    fn test_empty_batch() {
        let atoms = AtomAssembly::build(&fol(), &constants(), &predicate_table(), &Groundings::new(), 2).unwrap();
        assert_eq!(atoms.num_atoms(), 0);
        let (p, c) = atoms.stacked().unwrap();
        assert_eq!(p.dims(), &[0, 3]);
        assert_eq!(c.dims(), &[0, 3, 2]);
    }

    #[test]
    fn test_out_of_bounds_position() {
        let mut groundings = Groundings::new();
        groundings.insert("lives".into(), tuples(&[[0, 2]]));
        let err = AtomAssembly::build(&fol(), &constants(), &predicate_table(), &groundings, 2);
        assert!(matches!(err, Err(KgeError::Shape(_))));
    }

    #[test]
    fn test_unknown_predicate_and_wrong_arity() {
        let mut groundings = Groundings::new();
        groundings.insert("enemy".into(), tuples(&[[0, 1]]));
        assert!(matches!(
            AtomAssembly::build(&fol(), &constants(), &predicate_table(), &groundings, 2),
            Err(KgeError::Shape(_))
        ));

        let mut groundings = Groundings::new();
        groundings.insert("between".into(), tuples(&[[0, 1]]));
        assert!(matches!(
            AtomAssembly::build(&fol(), &constants(), &predicate_table(), &groundings, 2),
            Err(KgeError::Shape(_))
        ));
    }

    #[test]
    fn test_mixed_arity_cannot_stack() {
        let mut groundings = Groundings::new();
        groundings.insert("friend".into(), tuples(&[[0, 1]]));
        groundings.insert(
            "between".into(),
            Tensor::from_vec(vec![0u32, 1, 0], (1, 3), &Device::Cpu).unwrap(),
        );
        let atoms = AtomAssembly::build(&fol(), &constants(), &predicate_table(), &groundings, 2).unwrap();
        assert_eq!(atoms.num_atoms(), 2);
        assert!(!atoms.has_uniform_arity());
        assert!(matches!(atoms.stacked(), Err(KgeError::Shape(_))));
    }
}
