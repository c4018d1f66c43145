//! First-order signature and rules
//!
//! Typed domains of constants, predicates over ordered domain tuples, and
//! rules made of body/head literals. Everything here is read-only metadata:
//! it is validated once when a model is built and never mutated afterwards.
//!
//! ## Example
//!
//! ```rust,ignore
//! let fol = Fol::new(
//!     vec![Domain::new("people", ["ann", "bob"])],
//!     vec![Predicate::new("friend", ["people", "people"])],
//! )?;
//! assert_eq!(fol.predicate_index("friend"), Some(0));
//! ```

pub mod validation;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{KgeError, Result};

pub use validation::{validate_rules, validate_rules_strict, ValidationError};

/// Named set of constants, identified by their position in `constants`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub constants: Vec<String>,
}

impl Domain {
    pub fn new<I, S>(name: impl Into<String>, constants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            constants: constants.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }
}

/// Relation over an ordered tuple of domains (referenced by name)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub name: String,
    pub domains: Vec<String>,
}

impl Predicate {
    pub fn new<I, S>(name: impl Into<String>, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            domains: domains.into_iter().map(Into::into).collect(),
        }
    }

    pub fn arity(&self) -> usize {
        self.domains.len()
    }
}

/// Predicate applied to variables, optionally negated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Literal {
    pub predicate: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub negated: bool,
}

impl Literal {
    pub fn new<I, S>(predicate: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            predicate: predicate.into(),
            args: args.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    /// The same literal under negation (`not p(X, Y)`)
    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }
}

/// Rule template: conjunction of `body` literals implies the `head` literals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub body: Vec<Literal>,
    pub head: Vec<Literal>,
}

impl Rule {
    pub fn new(name: impl Into<String>, body: Vec<Literal>, head: Vec<Literal>) -> Self {
        Self { name: name.into(), body, head }
    }
}

/// Closed first-order signature with name → index lookups
#[derive(Debug, Clone)]
pub struct Fol {
    domains: Vec<Domain>,
    predicates: Vec<Predicate>,
    name2domain_idx: HashMap<String, usize>,
    name2predicate_idx: HashMap<String, usize>,
}

impl Fol {
    /// Build a signature, failing on duplicate names, empty predicates or
    /// predicates over unknown domains.
    pub fn new(domains: Vec<Domain>, predicates: Vec<Predicate>) -> Result<Self> {
        let mut name2domain_idx = HashMap::new();
        for (i, d) in domains.iter().enumerate() {
            if name2domain_idx.insert(d.name.clone(), i).is_some() {
                return Err(KgeError::Config(format!("Duplicate domain '{}'", d.name)));
            }
        }

        let mut name2predicate_idx = HashMap::new();
        for (i, p) in predicates.iter().enumerate() {
            if p.domains.is_empty() {
                return Err(KgeError::Config(format!("Predicate '{}' has arity 0", p.name)));
            }
            if let Some(d) = p.domains.iter().find(|d| !name2domain_idx.contains_key(*d)) {
                return Err(KgeError::Config(format!(
                    "Predicate '{}' references unknown domain '{}'",
                    p.name, d
                )));
            }
            if name2predicate_idx.insert(p.name.clone(), i).is_some() {
                return Err(KgeError::Config(format!("Duplicate predicate '{}'", p.name)));
            }
        }

        Ok(Self { domains, predicates, name2domain_idx, name2predicate_idx })
    }

    /// Domains in declaration order
    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    /// Predicates in signature order (the global predicate index order)
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn domain(&self, name: &str) -> Option<&Domain> {
        self.name2domain_idx.get(name).map(|&i| &self.domains[i])
    }

    pub fn predicate(&self, name: &str) -> Option<&Predicate> {
        self.name2predicate_idx.get(name).map(|&i| &self.predicates[i])
    }

    pub fn predicate_index(&self, name: &str) -> Option<usize> {
        self.name2predicate_idx.get(name).copied()
    }

    /// Largest predicate arity in the signature
    pub fn max_arity(&self) -> usize {
        self.predicates.iter().map(Predicate::arity).max().unwrap_or(0)
    }
}
