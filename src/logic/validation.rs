//! Rule Validation
//!
//! Validates rule templates against a signature before any reasoning layer is
//! built from them.
//!
//! ## Checks Performed
//!
//! - **Structure**: rules need a non-empty body and head, unique names
//! - **Predicates**: literals reference known predicates with the right arity
//! - **Variable typing**: a variable is bound to a single domain across the rule
//! - **Reserved words**: predicate and rule names can't be reserved words

use std::collections::{HashMap, HashSet};

use super::{Fol, Literal, Rule};
use crate::{KgeError, Result};

/// Validation error with location information
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Error message
    pub message: String,
    /// Rule index where error occurred
    pub rule_index: Option<usize>,
    /// Predicate name involved
    pub predicate: Option<String>,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref pred) = self.predicate {
            write!(f, " (predicate: {})", pred)?;
        }
        if let Some(idx) = self.rule_index {
            write!(f, " [rule {}]", idx)?;
        }
        if let Some(ref sug) = self.suggestion {
            write!(f, "\n  = help: {}", sug)?;
        }
        Ok(())
    }
}

/// Reserved words that cannot be used as predicate or rule names
const RESERVED_WORDS: &[&str] = &["not", "and", "or", "true", "false", "forall", "exists"];

/// Validate rule templates against a signature
///
/// Returns a list of validation errors (empty if valid).
pub fn validate_rules(fol: &Fol, rules: &[Rule]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen_names = HashSet::new();

    for (rule_idx, rule) in rules.iter().enumerate() {
        if RESERVED_WORDS.contains(&rule.name.as_str()) {
            errors.push(ValidationError {
                message: format!("'{}' is a reserved word and cannot name a rule", rule.name),
                rule_index: Some(rule_idx),
                predicate: None,
                suggestion: Some(format!("Use a different name like '{}_rule'", rule.name)),
            });
        }
        if !seen_names.insert(rule.name.as_str()) {
            errors.push(ValidationError {
                message: format!("Duplicate rule name '{}'", rule.name),
                rule_index: Some(rule_idx),
                predicate: None,
                suggestion: Some("Rule groundings are keyed by rule name; names must be unique".into()),
            });
        }
        if rule.body.is_empty() || rule.head.is_empty() {
            errors.push(ValidationError {
                message: format!(
                    "Rule '{}' needs at least one body and one head literal",
                    rule.name
                ),
                rule_index: Some(rule_idx),
                predicate: None,
                suggestion: None,
            });
        }

        let mut var_domains: HashMap<&str, &str> = HashMap::new();
        for lit in rule.body.iter().chain(rule.head.iter()) {
            check_literal(fol, lit, rule_idx, &mut var_domains, &mut errors);
        }
    }

    errors
}

/// Validate and return Result
pub fn validate_rules_strict(fol: &Fol, rules: &[Rule]) -> Result<()> {
    let errors = validate_rules(fol, rules);
    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        Err(KgeError::Config(format!("Validation errors:\n{}", msg)))
    }
}

/// Check a literal's predicate, arity and variable typing
fn check_literal<'a>(
    fol: &'a Fol,
    lit: &'a Literal,
    rule_idx: usize,
    var_domains: &mut HashMap<&'a str, &'a str>,
    errors: &mut Vec<ValidationError>,
) {
    if RESERVED_WORDS.contains(&lit.predicate.as_str()) {
        errors.push(ValidationError {
            message: format!(
                "'{}' is a reserved word and cannot be used as a predicate name",
                lit.predicate
            ),
            rule_index: Some(rule_idx),
            predicate: Some(lit.predicate.clone()),
            suggestion: Some(format!("Use a different name like '{}_pred'", lit.predicate)),
        });
        return;
    }

    let Some(predicate) = fol.predicate(&lit.predicate) else {
        errors.push(ValidationError {
            message: format!("Unknown predicate '{}'", lit.predicate),
            rule_index: Some(rule_idx),
            predicate: Some(lit.predicate.clone()),
            suggestion: closest_predicate(fol, &lit.predicate)
                .map(|name| format!("Did you mean '{}'?", name)),
        });
        return;
    };

    if predicate.arity() != lit.args.len() {
        errors.push(ValidationError {
            message: format!(
                "Predicate '{}' used with wrong arity: expected {} arguments, found {}",
                lit.predicate,
                predicate.arity(),
                lit.args.len()
            ),
            rule_index: Some(rule_idx),
            predicate: Some(lit.predicate.clone()),
            suggestion: None,
        });
        return;
    }

    for (var, domain) in lit.args.iter().zip(predicate.domains.iter()) {
        match var_domains.get(var.as_str()) {
            Some(&bound) if bound != domain.as_str() => {
                errors.push(ValidationError {
                    message: format!(
                        "Variable '{}' is used both as '{}' and as '{}'",
                        var, bound, domain
                    ),
                    rule_index: Some(rule_idx),
                    predicate: Some(lit.predicate.clone()),
                    suggestion: Some(format!("Rename one occurrence of '{}'", var)),
                });
            }
            Some(_) => {}
            None => {
                var_domains.insert(var.as_str(), domain.as_str());
            }
        }
    }
}

/// Case-insensitive exact or prefix match, used for "did you mean" hints
fn closest_predicate<'a>(fol: &'a Fol, name: &str) -> Option<&'a str> {
    let lower = name.to_lowercase();
    fol.predicates()
        .iter()
        .map(|p| p.name.as_str())
        .find(|p| {
            let p = p.to_lowercase();
            p == lower || p.starts_with(&lower) || lower.starts_with(&p)
        })
}
