//! Study-type rule table and RVU weights.
//!
//! The table is loaded from TOML and validated once; a label without an RVU
//! weight is a configuration defect reported at load time. Overlay documents
//! extend a loaded table append-only: they may add labels, study types,
//! rules, aliases and fallbacks, but never change what already exists.

use crate::types::Modality;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Table shipped with the crate
pub const BUILTIN_RULES: &str = include_str!("../rules/default_rules.toml");

const DEFAULT_UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read rule file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid rule document: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("label '{label}' used as {used_as} has no RVU entry")]
    MissingRvu { label: String, used_as: &'static str },

    #[error("RVU for '{label}' must be a non-negative number, got {value}")]
    InvalidRvu { label: String, value: f64 },

    #[error("study type '{0}' is defined more than once")]
    DuplicateLabel(String),

    #[error("study type '{label}', rule {rule}: keywords must not be empty")]
    EmptyKeyword { label: String, rule: usize },

    #[error("study type '{label}', rule {rule}: needs at least one required or any_of keyword")]
    EmptyRule { label: String, rule: usize },

    #[error("unknown modality '{0}'")]
    UnknownModality(String),

    #[error("overlay conflicts with existing table: {0}")]
    Conflict(String),
}

#[derive(Debug, Deserialize)]
struct RuleDocument {
    #[serde(default)]
    unknown_label: Option<String>,
    #[serde(default)]
    rvu: BTreeMap<String, f64>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
    #[serde(default)]
    fallbacks: BTreeMap<String, String>,
    #[serde(default)]
    study_types: Vec<StudyTypeDocument>,
}

#[derive(Debug, Deserialize)]
struct StudyTypeDocument {
    label: String,
    #[serde(default)]
    modality: Option<String>,
    #[serde(default)]
    rules: Vec<RuleDocumentEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleDocumentEntry {
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    excluded: Vec<String>,
    #[serde(default)]
    any_of: Vec<String>,
}

/// Keyword rule, matched by substring containment over normalized text
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationRule {
    pub required: Vec<String>,
    pub excluded: Vec<String>,
    pub any_of: Vec<String>,
}

impl ClassificationRule {
    /// `text` must already be normalized (case-folded)
    pub fn matches(&self, text: &str) -> bool {
        self.required.iter().all(|k| text.contains(k.as_str()))
            && !self.excluded.iter().any(|k| text.contains(k.as_str()))
            && (self.any_of.is_empty() || self.any_of.iter().any(|k| text.contains(k.as_str())))
    }
}

/// A label with its ordered rules
#[derive(Debug, Clone, PartialEq)]
pub struct StudyType {
    pub label: String,
    /// When set, the rules only apply to text of this modality
    pub modality: Option<Modality>,
    pub rules: Vec<ClassificationRule>,
}

/// Validated rule table plus RVU weights. Immutable once built.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rvu: BTreeMap<String, f64>,
    aliases: HashMap<String, String>,
    /// Case-folded label -> label, the implicit aliases
    canonical: HashMap<String, String>,
    fallbacks: BTreeMap<Modality, String>,
    study_types: Vec<StudyType>,
    unknown_label: String,
}

fn fold(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn fold_keywords(keywords: Vec<String>, label: &str, rule: usize) -> Result<Vec<String>, RulesError> {
    keywords
        .into_iter()
        .map(|keyword| {
            let folded = fold(&keyword);
            if folded.is_empty() {
                Err(RulesError::EmptyKeyword {
                    label: label.to_string(),
                    rule,
                })
            } else {
                Ok(folded)
            }
        })
        .collect()
}

fn parse_modality(token: &str) -> Result<Modality, RulesError> {
    Modality::from_token(token).ok_or_else(|| RulesError::UnknownModality(token.to_string()))
}

impl RuleSet {
    fn empty() -> Self {
        Self {
            rvu: BTreeMap::new(),
            aliases: HashMap::new(),
            canonical: HashMap::new(),
            fallbacks: BTreeMap::new(),
            study_types: Vec::new(),
            unknown_label: DEFAULT_UNKNOWN_LABEL.to_string(),
        }
    }

    /// Parse and validate a rule document
    pub fn from_toml_str(source: &str) -> Result<Self, RulesError> {
        let document: RuleDocument = toml::from_str(source)?;
        let mut rules = Self::empty();
        if let Some(unknown) = document.unknown_label.clone() {
            rules.unknown_label = unknown;
        }
        rules.merge(document)?;
        rules.validate()?;
        Ok(rules)
    }

    /// The table compiled into the binary
    pub fn builtin() -> Result<Self, RulesError> {
        Self::from_toml_str(BUILTIN_RULES)
    }

    /// Load a rule document from disk
    pub fn load(path: &Path) -> Result<Self, RulesError> {
        let source = read_file(path)?;
        let rules = Self::from_toml_str(&source)?;
        info!(
            "Loaded {} study types from {}",
            rules.study_types.len(),
            path.display()
        );
        Ok(rules)
    }

    /// Base table (file or built-in) with overlays applied in order
    pub fn load_layered(base: Option<&Path>, overlays: &[PathBuf]) -> Result<Self, RulesError> {
        let mut rules = match base {
            Some(path) => Self::load(path)?,
            None => Self::builtin()?,
        };
        for overlay in overlays {
            rules = rules.with_overlay(&read_file(overlay)?)?;
            info!("Applied rule overlay {}", overlay.display());
        }
        Ok(rules)
    }

    /// A new table extended by an overlay document
    pub fn with_overlay(&self, source: &str) -> Result<Self, RulesError> {
        let document: RuleDocument = toml::from_str(source)?;
        if let Some(unknown) = &document.unknown_label {
            if *unknown != self.unknown_label {
                return Err(RulesError::Conflict(format!(
                    "unknown_label '{}' would replace '{}'",
                    unknown, self.unknown_label
                )));
            }
        }
        let mut rules = self.clone();
        rules.merge(document)?;
        rules.validate()?;
        Ok(rules)
    }

    fn merge(&mut self, document: RuleDocument) -> Result<(), RulesError> {
        for (label, value) in document.rvu {
            if !value.is_finite() || value < 0.0 {
                return Err(RulesError::InvalidRvu { label, value });
            }
            match self.rvu.get(&label) {
                Some(existing) if *existing != value => {
                    return Err(RulesError::Conflict(format!(
                        "RVU for '{}' would change from {} to {}",
                        label, existing, value
                    )));
                }
                Some(_) => {}
                None => {
                    self.canonical.insert(fold(&label), label.clone());
                    self.rvu.insert(label, value);
                }
            }
        }

        for (text, label) in document.aliases {
            let key = fold(&text);
            match self.aliases.get(&key) {
                Some(existing) if *existing != label => {
                    return Err(RulesError::Conflict(format!(
                        "alias '{}' would move from '{}' to '{}'",
                        key, existing, label
                    )));
                }
                _ => {
                    self.aliases.insert(key, label);
                }
            }
        }

        for (token, label) in document.fallbacks {
            let modality = parse_modality(&token)?;
            match self.fallbacks.get(&modality) {
                Some(existing) if *existing != label => {
                    return Err(RulesError::Conflict(format!(
                        "fallback for {} would move from '{}' to '{}'",
                        modality, existing, label
                    )));
                }
                _ => {
                    self.fallbacks.insert(modality, label);
                }
            }
        }

        let mut seen = HashSet::new();
        for entry in document.study_types {
            if !seen.insert(entry.label.clone()) {
                return Err(RulesError::DuplicateLabel(entry.label));
            }
            let modality = entry.modality.as_deref().map(parse_modality).transpose()?;

            let mut rules = Vec::with_capacity(entry.rules.len());
            for (index, rule) in entry.rules.into_iter().enumerate() {
                let rule = ClassificationRule {
                    required: fold_keywords(rule.required, &entry.label, index)?,
                    excluded: fold_keywords(rule.excluded, &entry.label, index)?,
                    any_of: fold_keywords(rule.any_of, &entry.label, index)?,
                };
                if rule.required.is_empty() && rule.any_of.is_empty() {
                    return Err(RulesError::EmptyRule {
                        label: entry.label,
                        rule: index,
                    });
                }
                rules.push(rule);
            }

            match self.study_types.iter_mut().find(|t| t.label == entry.label) {
                Some(existing) => {
                    if modality.is_some() && modality != existing.modality {
                        return Err(RulesError::Conflict(format!(
                            "study type '{}' would change modality",
                            entry.label
                        )));
                    }
                    debug!("Appending {} rules to '{}'", rules.len(), entry.label);
                    existing.rules.extend(rules);
                }
                None => self.study_types.push(StudyType {
                    label: entry.label,
                    modality,
                    rules,
                }),
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), RulesError> {
        let require = |label: &str, used_as: &'static str| {
            if self.rvu.contains_key(label) {
                Ok(())
            } else {
                Err(RulesError::MissingRvu {
                    label: label.to_string(),
                    used_as,
                })
            }
        };

        require(&self.unknown_label, "unknown label")?;
        for study_type in &self.study_types {
            require(&study_type.label, "study type")?;
        }
        for label in self.aliases.values() {
            require(label, "alias target")?;
        }
        for label in self.fallbacks.values() {
            require(label, "modality fallback")?;
        }
        Ok(())
    }

    /// Weight of a label
    pub fn rvu(&self, label: &str) -> Option<f64> {
        self.rvu.get(label).copied()
    }

    /// Label for already-normalized text, via an explicit or implicit alias
    pub fn alias(&self, normalized: &str) -> Option<&str> {
        self.aliases
            .get(normalized)
            .or_else(|| self.canonical.get(normalized))
            .map(String::as_str)
    }

    pub fn fallback(&self, modality: Modality) -> Option<&str> {
        self.fallbacks.get(&modality).map(String::as_str)
    }

    /// Study types in priority order
    pub fn study_types(&self) -> &[StudyType] {
        &self.study_types
    }

    pub fn unknown_label(&self) -> &str {
        &self.unknown_label
    }

    /// All labels with their weights, sorted by label
    pub fn weights(&self) -> impl Iterator<Item = (&str, f64)> {
        self.rvu.iter().map(|(label, value)| (label.as_str(), *value))
    }
}

fn read_file(path: &Path) -> Result<String, RulesError> {
    std::fs::read_to_string(path).map_err(|source| RulesError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SMALL: &str = r#"
        [rvu]
        "Unknown" = 0.0
        "CT Head" = 0.9
        "CT Other" = 1.0

        [aliases]
        "head ct" = "CT Head"

        [fallbacks]
        CT = "CT Other"

        [[study_types]]
        label = "CT Head"
        modality = "CT"
        [[study_types.rules]]
        any_of = ["Head", "BRAIN"]
    "#;

    #[test]
    fn test_builtin_table_loads() {
        let rules = RuleSet::builtin().unwrap();
        assert_eq!(rules.unknown_label(), "Unknown");
        assert_eq!(rules.rvu("Unknown"), Some(0.0));
        assert_eq!(rules.fallback(Modality::Ct), Some("CT Other"));
        let labels: Vec<&str> = rules.study_types().iter().map(|t| t.label.as_str()).collect();
        let cap = labels.iter().position(|l| *l == "CT CAP").unwrap();
        let pelvis = labels.iter().position(|l| *l == "CT MSK Pelvis").unwrap();
        assert!(cap < pelvis);
    }

    #[test]
    fn test_keywords_are_folded() {
        let rules = RuleSet::from_toml_str(SMALL).unwrap();
        assert_eq!(rules.study_types()[0].rules[0].any_of, vec!["head", "brain"]);
        assert_eq!(rules.study_types()[0].modality, Some(Modality::Ct));
    }

    #[test]
    fn test_implicit_and_explicit_aliases() {
        let rules = RuleSet::from_toml_str(SMALL).unwrap();
        assert_eq!(rules.alias("head ct"), Some("CT Head"));
        assert_eq!(rules.alias("ct head"), Some("CT Head"));
        assert_eq!(rules.alias("ct other"), Some("CT Other"));
        assert_eq!(rules.alias("head"), None);
    }

    #[test]
    fn test_rule_matching() {
        let rule = ClassificationRule {
            required: vec!["pelv".into()],
            excluded: vec!["abd".into(), "chest".into()],
            any_of: vec![],
        };
        assert!(rule.matches("ct pelvis"));
        assert!(!rule.matches("ct abdomen pelvis"));

        let rule = ClassificationRule {
            required: vec![],
            excluded: vec![],
            any_of: vec!["knee".into(), "hip".into()],
        };
        assert!(rule.matches("mri left hip"));
        assert!(!rule.matches("mri shoulder"));
    }

    #[test]
    fn test_missing_rvu_fails_fast() {
        let source = r#"
            [rvu]
            "Unknown" = 0.0
            [[study_types]]
            label = "CT Head"
            [[study_types.rules]]
            required = ["head"]
        "#;
        match RuleSet::from_toml_str(source) {
            Err(RulesError::MissingRvu { label, used_as }) => {
                assert_eq!(label, "CT Head");
                assert_eq!(used_as, "study type");
            }
            other => panic!("expected MissingRvu, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_unknown_and_fallback_rvu() {
        assert!(matches!(
            RuleSet::from_toml_str("[rvu]\n\"CT Other\" = 1.0\n"),
            Err(RulesError::MissingRvu { used_as: "unknown label", .. })
        ));
        assert!(matches!(
            RuleSet::from_toml_str("[rvu]\n\"Unknown\" = 0.0\n[fallbacks]\nCT = \"CT Other\"\n"),
            Err(RulesError::MissingRvu { used_as: "modality fallback", .. })
        ));
        assert!(matches!(
            RuleSet::from_toml_str("[rvu]\n\"Unknown\" = 0.0\n[aliases]\n\"x\" = \"Nope\"\n"),
            Err(RulesError::MissingRvu { used_as: "alias target", .. })
        ));
    }

    #[test]
    fn test_invalid_documents() {
        assert!(matches!(
            RuleSet::from_toml_str("[rvu]\n\"Unknown\" = -1.0\n"),
            Err(RulesError::InvalidRvu { .. })
        ));
        assert!(matches!(
            RuleSet::from_toml_str("[rvu]\n\"Unknown\" = 0.0\n[fallbacks]\nXYZ = \"Unknown\"\n"),
            Err(RulesError::UnknownModality(_))
        ));
        assert!(matches!(
            RuleSet::from_toml_str("not toml = ["),
            Err(RulesError::Parse(_))
        ));

        let duplicate = r#"
            [rvu]
            "Unknown" = 0.0
            "A" = 1.0
            [[study_types]]
            label = "A"
            [[study_types.rules]]
            required = ["a"]
            [[study_types]]
            label = "A"
            [[study_types.rules]]
            required = ["b"]
        "#;
        assert!(matches!(
            RuleSet::from_toml_str(duplicate),
            Err(RulesError::DuplicateLabel(label)) if label == "A"
        ));

        let empty_keyword = r#"
            [rvu]
            "Unknown" = 0.0
            "A" = 1.0
            [[study_types]]
            label = "A"
            [[study_types.rules]]
            required = ["a", "  "]
        "#;
        assert!(matches!(
            RuleSet::from_toml_str(empty_keyword),
            Err(RulesError::EmptyKeyword { rule: 0, .. })
        ));

        let empty_rule = r#"
            [rvu]
            "Unknown" = 0.0
            "A" = 1.0
            [[study_types]]
            label = "A"
            [[study_types.rules]]
            excluded = ["a"]
        "#;
        assert!(matches!(
            RuleSet::from_toml_str(empty_rule),
            Err(RulesError::EmptyRule { .. })
        ));
    }

    #[test]
    fn test_overlay_appends() {
        let base = RuleSet::from_toml_str(SMALL).unwrap();
        let overlay = r#"
            [rvu]
            "CT Head" = 0.9
            "CT Neck" = 1.3

            [[study_types]]
            label = "CT Head"
            [[study_types.rules]]
            required = ["skull"]

            [[study_types]]
            label = "CT Neck"
            modality = "CT"
            [[study_types.rules]]
            required = ["neck"]
        "#;
        let rules = base.with_overlay(overlay).unwrap();

        let labels: Vec<&str> = rules.study_types().iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["CT Head", "CT Neck"]);
        assert_eq!(rules.study_types()[0].rules.len(), 2);
        assert_eq!(rules.rvu("CT Neck"), Some(1.3));
        // Base table untouched
        assert_eq!(base.study_types().len(), 1);
    }

    #[test]
    fn test_overlay_conflicts() {
        let base = RuleSet::from_toml_str(SMALL).unwrap();
        assert!(matches!(
            base.with_overlay("[rvu]\n\"CT Head\" = 2.0\n"),
            Err(RulesError::Conflict(_))
        ));
        assert!(matches!(
            base.with_overlay("[aliases]\n\"head ct\" = \"CT Other\"\n"),
            Err(RulesError::Conflict(_))
        ));
        assert!(matches!(
            base.with_overlay("[fallbacks]\nCT = \"Unknown\"\n"),
            Err(RulesError::Conflict(_))
        ));
        assert!(matches!(
            base.with_overlay("unknown_label = \"Other\"\n"),
            Err(RulesError::Conflict(_))
        ));
    }

    #[test]
    fn test_load_layered_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("rules.toml");
        let overlay = dir.path().join("site.toml");
        std::fs::write(&base, SMALL).unwrap();
        std::fs::write(&overlay, "[rvu]\n\"CT Neck\" = 1.3\n[aliases]\n\"neck ct\" = \"CT Neck\"\n").unwrap();

        let rules = RuleSet::load_layered(Some(&base), &[overlay]).unwrap();
        assert_eq!(rules.alias("neck ct"), Some("CT Neck"));

        let missing = dir.path().join("missing.toml");
        assert!(matches!(RuleSet::load(&missing), Err(RulesError::Io { .. })));
    }
}
