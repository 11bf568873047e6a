//! Procedure text conventions of the reporting applications.
//!
//! Reporting applications expose study details as tab-delimited text: a
//! modality code, a date (three-letter month, four-digit year, sometimes a
//! time with timezone), the procedure description and a status token. This
//! module splits those fields, recognizes status tokens, detects modality and
//! produces the normalized description the classifier matches against.

use crate::types::{Modality, StatusFlag};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;

lazy_static! {
    // 12-Mar-2024, 12 MAR 2024, 12/Mar/2024, Mar 12, 2024, March 12 2024
    static ref DATE: Regex = Regex::new(
        r"(?i)\b(?:\d{1,2}[-/ ](?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?[-/ ,]+\d{4}|(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?[ -]\d{1,2},?[ -]\d{4})\b"
    ).unwrap();

    // 10:32, 10:32:05, 10:32 AM EST, 14:05 CST
    static ref TIME: Regex = Regex::new(
        r"(?i)\b\d{1,2}:\d{2}(?::\d{2})?(?:\s*[ap]\.?m\.?)?(?:\s*(?:utc|gmt|[ecmpah][sd]t)\b)?"
    ).unwrap();

    static ref STATUS: Regex = Regex::new(
        r"(?i)\b(?:signed|final(?:ized)?|in[ _]progress|dictating|no[ _]report|no[ _]images|draft|prelim(?:inary)?|addendum)\b"
    ).unwrap();

    static ref ACCESSION: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{3,31}$").unwrap();

    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Map one status token to its flag
fn flag_for_token(token: &str) -> Option<StatusFlag> {
    let token = token.to_ascii_lowercase().replace('_', " ");
    match token.as_str() {
        "signed" | "final" | "finalized" => Some(StatusFlag::Signed),
        "in progress" | "dictating" => Some(StatusFlag::InProgress),
        "no report" => Some(StatusFlag::NoReport),
        "no images" => Some(StatusFlag::NoImages),
        "draft" => Some(StatusFlag::Draft),
        "prelim" | "preliminary" => Some(StatusFlag::Preliminary),
        "addendum" => Some(StatusFlag::Addendum),
        _ => None,
    }
}

/// All status flags embedded in `text`
pub fn status_flags(text: &str) -> BTreeSet<StatusFlag> {
    STATUS
        .find_iter(text)
        .filter_map(|m| flag_for_token(m.as_str()))
        .collect()
}

/// Remove status tokens, dropping fields left empty
pub fn strip_status_tokens(text: &str) -> String {
    text.split('\t')
        .map(|field| collapse(&STATUS.replace_all(field, " ")))
        .filter(|field| !field.is_empty())
        .collect::<Vec<_>>()
        .join("\t")
}

fn collapse(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

/// Normalized description used for classification.
///
/// Case-folded, with date, time and status fragments removed, tabs turned
/// into spaces and whitespace collapsed.
pub fn normalize_description(text: &str) -> String {
    let lowered = text.to_lowercase();
    let without_dates = DATE.replace_all(&lowered, " ");
    let without_times = TIME.replace_all(&without_dates, " ");
    let without_status = STATUS.replace_all(&without_times, " ");
    collapse(&without_status)
}

/// Modality of a procedure text.
///
/// A field consisting solely of a modality code wins; otherwise the first
/// word that is a modality code.
pub fn detect_modality(text: &str) -> Option<Modality> {
    let from_field = text
        .split('\t')
        .find_map(|field| Modality::from_token(field.trim()));
    if from_field.is_some() {
        return from_field;
    }

    text.split(|c: char| c.is_whitespace() || matches!(c, ',' | '(' | ')' | ';'))
        .filter(|word| !word.is_empty())
        .find_map(Modality::from_token)
}

/// Whether `candidate` plausibly is an accession number
pub fn looks_like_accession(candidate: &str) -> bool {
    let candidate = candidate.trim();
    ACCESSION.is_match(candidate)
        && candidate.chars().any(|c| c.is_ascii_digit())
        && Modality::from_token(candidate).is_none()
        && !DATE.is_match(candidate)
        && !TIME.is_match(candidate)
        && !STATUS.is_match(candidate)
}

/// Fields recognized in one tab-delimited procedure line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcedureFields {
    pub accession: Option<String>,
    pub modality: Option<Modality>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub description: String,
    pub status_flags: BTreeSet<StatusFlag>,
    /// Original fields minus accession and status tokens
    kept: Vec<String>,
}

impl ProcedureFields {
    /// Procedure text for a snapshot: fields in original order, without
    /// the accession and without status tokens
    pub fn raw_text(&self) -> String {
        self.kept.join("\t")
    }
}

/// Split a tab-delimited line into its fields
pub fn parse_fields(raw: &str) -> ProcedureFields {
    let mut fields = ProcedureFields::default();
    let mut description = Vec::new();

    for field in raw.split('\t') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }

        fields.status_flags.extend(status_flags(field));
        let stripped = strip_status_tokens(field);
        if stripped.is_empty() {
            continue;
        }

        if fields.modality.is_none() {
            if let Some(modality) = Modality::from_token(&stripped) {
                fields.modality = Some(modality);
                fields.kept.push(stripped);
                continue;
            }
        }

        if let Some(date) = DATE.find(&stripped) {
            fields.date.get_or_insert_with(|| date.as_str().to_string());
            let rest = DATE.replace(&stripped, " ");
            if let Some(time) = TIME.find(&rest) {
                fields.time.get_or_insert_with(|| time.as_str().trim().to_string());
            }
            let rest = collapse(&TIME.replace_all(&rest, " "));
            fields.kept.push(stripped.clone());
            if !rest.is_empty() {
                description.push(rest);
            }
            continue;
        }

        if TIME.is_match(&stripped) && collapse(&TIME.replace_all(&stripped, " ")).is_empty() {
            fields.time.get_or_insert_with(|| stripped.clone());
            fields.kept.push(stripped);
            continue;
        }

        if fields.accession.is_none() && !stripped.contains(' ') && looks_like_accession(&stripped) {
            fields.accession = Some(stripped);
            continue;
        }

        description.push(stripped.clone());
        fields.kept.push(stripped);
    }

    if fields.modality.is_none() {
        fields.modality = detect_modality(&description.join(" "));
    }
    fields.description = description.join(" ");
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_status_flags() {
        let flags = status_flags("CT\tchest\tSIGNED");
        assert_eq!(flags.into_iter().collect::<Vec<_>>(), vec![StatusFlag::Signed]);

        let flags = status_flags("in progress / NO_IMAGES");
        assert!(flags.contains(&StatusFlag::InProgress));
        assert!(flags.contains(&StatusFlag::NoImages));

        assert!(status_flags("CT head without contrast").is_empty());
    }

    #[test]
    fn test_strip_status_tokens() {
        assert_eq!(strip_status_tokens("CT\tchest abdomen pelvis\tSIGNED"), "CT\tchest abdomen pelvis");
        assert_eq!(strip_status_tokens("MRI brain IN_PROGRESS"), "MRI brain");
    }

    #[test]
    fn test_normalize_description() {
        assert_eq!(
            normalize_description("CT\tChest Abdomen  Pelvis\tSIGNED"),
            "ct chest abdomen pelvis"
        );
        assert_eq!(
            normalize_description("XR\t12-Mar-2024 10:32 AM EST\tChest 2 Views\tIN PROGRESS"),
            "xr chest 2 views"
        );
        assert_eq!(normalize_description("  "), "");
    }

    #[test]
    fn test_detect_modality() {
        assert_eq!(detect_modality("CT\tpelvis\tSIGNED"), Some(Modality::Ct));
        assert_eq!(detect_modality("MRI BRAIN WO CONTRAST"), Some(Modality::Mri));
        assert_eq!(detect_modality("Chest (XR) 2 views"), Some(Modality::Xr));
        assert_eq!(detect_modality("PET/CT skull base to thigh"), Some(Modality::Pet));
        assert_eq!(detect_modality("chest abdomen pelvis"), None);
    }

    #[test]
    fn test_looks_like_accession() {
        assert!(looks_like_accession("ACC1234"));
        assert!(looks_like_accession("20240312-0042"));
        assert!(looks_like_accession("RAD.99812"));
        assert!(!looks_like_accession("ACC"));
        assert!(!looks_like_accession("CHEST"));
        assert!(!looks_like_accession("12-Mar-2024"));
        assert!(!looks_like_accession("10:32"));
        assert!(!looks_like_accession("CT"));
        assert!(!looks_like_accession("has space 123"));
    }

    #[test]
    fn test_parse_fields_worklist_row() {
        let fields = parse_fields("ACC1001\tCT\t12-Mar-2024 10:32 AM EST\tchest abdomen pelvis\tIN_PROGRESS");

        assert_eq!(fields.accession.as_deref(), Some("ACC1001"));
        assert_eq!(fields.modality, Some(Modality::Ct));
        assert_eq!(fields.date.as_deref(), Some("12-Mar-2024"));
        assert_eq!(fields.time.as_deref(), Some("10:32 AM EST"));
        assert_eq!(fields.description, "chest abdomen pelvis");
        assert!(fields.status_flags.contains(&StatusFlag::InProgress));
        assert_eq!(fields.raw_text(), "CT\t12-Mar-2024 10:32 AM EST\tchest abdomen pelvis");
    }

    #[test]
    fn test_parse_fields_without_accession() {
        let fields = parse_fields("CT\tchest abdomen pelvis\tSIGNED");
        assert_eq!(fields.accession, None);
        assert_eq!(fields.modality, Some(Modality::Ct));
        assert_eq!(fields.raw_text(), "CT\tchest abdomen pelvis");
        assert!(fields.status_flags.contains(&StatusFlag::Signed));
    }

    #[test]
    fn test_parse_fields_modality_in_description() {
        let fields = parse_fields("Mar 12, 2024\tMRI knee left");
        assert_eq!(fields.modality, Some(Modality::Mri));
        assert_eq!(fields.date.as_deref(), Some("Mar 12, 2024"));
        assert_eq!(fields.description, "MRI knee left");
    }

    proptest! {
        #[test]
        fn normalized_text_is_lowercase_and_trimmed(text in "[A-Za-z0-9 \t:-]{0,60}") {
            let normalized = normalize_description(&text);
            prop_assert_eq!(normalized.trim(), normalized.as_str());
            prop_assert!(!normalized.contains('\t'));
            prop_assert!(!normalized.contains("  "));
            prop_assert_eq!(normalized.to_lowercase(), normalized.clone());
        }

        #[test]
        fn accessions_have_digits_and_no_spaces(candidate in "\\PC{0,40}") {
            if looks_like_accession(&candidate) {
                let trimmed = candidate.trim();
                prop_assert!(trimmed.chars().any(|c| c.is_ascii_digit()));
                prop_assert!(!trimmed.contains(' '));
                prop_assert!(trimmed.len() >= 4 && trimmed.len() <= 32);
            }
        }
    }
}
