//! Procedure description classification.
//!
//! Order of evaluation: exact alias, then study types in priority order (the
//! first rule of the first matching type wins), then the modality's catch-all
//! label, then the unknown label. The weight always comes from the RVU table
//! for the resolved label.

use crate::procedure::{detect_modality, normalize_description};
use crate::rules::RuleSet;
use crate::types::Modality;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

/// How a label was reached
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum MatchSource {
    Alias,
    /// Indices into the study-type order and that type's rule list
    Rule { study_type: usize, rule: usize },
    ModalityFallback(Modality),
    Unknown,
}

impl fmt::Display for MatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchSource::Alias => write!(f, "alias"),
            MatchSource::Rule { study_type, rule } => {
                write!(f, "study type #{} rule #{}", study_type + 1, rule + 1)
            }
            MatchSource::ModalityFallback(modality) => write!(f, "{} fallback", modality),
            MatchSource::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub study_type: String,
    pub rvu: f64,
    pub matched_by: MatchSource,
}

/// Classify procedure text against a rule table
pub fn classify(raw_text: &str, rules: &RuleSet) -> Classification {
    let normalized = normalize_description(raw_text);

    if let Some(label) = rules.alias(&normalized) {
        return resolve(rules, label, MatchSource::Alias);
    }

    let modality = detect_modality(raw_text);
    for (type_index, study_type) in rules.study_types().iter().enumerate() {
        if study_type.modality.is_some() && study_type.modality != modality {
            continue;
        }
        if let Some(rule_index) = study_type.rules.iter().position(|rule| rule.matches(&normalized)) {
            return resolve(
                rules,
                &study_type.label,
                MatchSource::Rule {
                    study_type: type_index,
                    rule: rule_index,
                },
            );
        }
    }

    if let Some(modality) = modality {
        if let Some(label) = rules.fallback(modality) {
            return resolve(rules, label, MatchSource::ModalityFallback(modality));
        }
    }

    trace!("No classification for '{}'", normalized);
    unknown(rules)
}

fn resolve(rules: &RuleSet, label: &str, matched_by: MatchSource) -> Classification {
    match rules.rvu(label) {
        Some(rvu) => Classification {
            study_type: label.to_string(),
            rvu,
            matched_by,
        },
        None => {
            warn!("Label '{}' has no RVU entry, classifying as unknown", label);
            unknown(rules)
        }
    }
}

fn unknown(rules: &RuleSet) -> Classification {
    Classification {
        study_type: rules.unknown_label().to_string(),
        rvu: rules.rvu(rules.unknown_label()).unwrap_or(0.0),
        matched_by: MatchSource::Unknown,
    }
}

/// Classifier bound to the rule table of the current cycle.
///
/// The table is swapped only between cycles, never during one.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Arc<RuleSet>,
}

impl Classifier {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &Arc<RuleSet> {
        &self.rules
    }

    pub fn replace_rules(&mut self, rules: Arc<RuleSet>) {
        self.rules = rules;
    }

    pub fn classify(&self, raw_text: &str) -> Classification {
        classify(raw_text, &self.rules)
    }
}
