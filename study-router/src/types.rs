//! Core types used throughout the study router.
//!
//! This module defines the snapshot produced by every extraction cycle, the
//! integrations that produce it, and the modality and status vocabularies
//! shared by the extractors and the classifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub use shift_store::CompletedStudyRecord;

/// Reporting application a snapshot was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Integration {
    /// PowerScribe desktop reporting client
    PowerScribe,
    /// Mosaic web-based reporting
    Mosaic,
    /// Clario worklist
    Clario,
}

impl Integration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Integration::PowerScribe => "powerscribe",
            Integration::Mosaic => "mosaic",
            Integration::Clario => "clario",
        }
    }
}

impl fmt::Display for Integration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized report status token
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StatusFlag {
    Signed,
    InProgress,
    NoReport,
    NoImages,
    Draft,
    Preliminary,
    Addendum,
}

/// Imaging modality, used for catch-all classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Modality {
    #[serde(rename = "CT")]
    Ct,
    #[serde(rename = "MRI")]
    Mri,
    #[serde(rename = "XR")]
    Xr,
    #[serde(rename = "US")]
    Us,
    #[serde(rename = "NM")]
    Nm,
    #[serde(rename = "PET")]
    Pet,
    #[serde(rename = "MAMMO")]
    Mammo,
    #[serde(rename = "FLUORO")]
    Fluoro,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Ct => "CT",
            Modality::Mri => "MRI",
            Modality::Xr => "XR",
            Modality::Us => "US",
            Modality::Nm => "NM",
            Modality::Pet => "PET",
            Modality::Mammo => "MAMMO",
            Modality::Fluoro => "FLUORO",
        }
    }

    /// Map a single case-insensitive token (e.g. "CTA", "MR", "CR") to a modality
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.trim().trim_matches(|c: char| c == ':' || c == ',');
        match token.to_ascii_uppercase().as_str() {
            "CT" | "CTA" | "CTV" => Some(Modality::Ct),
            "MR" | "MRI" | "MRA" | "MRV" => Some(Modality::Mri),
            "XR" | "CR" | "DX" | "XRAY" | "X-RAY" => Some(Modality::Xr),
            "US" | "USG" | "ULTRASOUND" | "SONO" => Some(Modality::Us),
            "NM" | "NUC" => Some(Modality::Nm),
            "PET" | "PT" | "PET/CT" | "PETCT" => Some(Modality::Pet),
            "MG" | "MAMMO" | "MAMMOGRAM" | "MAMMOGRAPHY" => Some(Modality::Mammo),
            "RF" | "FL" | "FLUORO" | "FLUOROSCOPY" => Some(Modality::Fluoro),
            _ => None,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized read of a reporting application's current study.
///
/// Produced fresh every poll cycle and never mutated afterwards. A snapshot
/// with an empty accession means no study was observed; a timed-out sub-read
/// leaves its field as an empty string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub accession: String,
    /// Procedure text with status tokens stripped
    pub raw_text: String,
    pub status_flags: BTreeSet<StatusFlag>,
    pub captured_at: DateTime<Utc>,
    pub source: Integration,
}

impl Snapshot {
    /// Snapshot for "no active study observed"
    pub fn empty(source: Integration, captured_at: DateTime<Utc>) -> Self {
        Self {
            accession: String::new(),
            raw_text: String::new(),
            status_flags: BTreeSet::new(),
            captured_at,
            source,
        }
    }

    /// Whether this snapshot observed a study at all
    pub fn is_empty(&self) -> bool {
        self.accession.is_empty()
    }

    pub fn has_flag(&self, flag: StatusFlag) -> bool {
        self.status_flags.contains(&flag)
    }
}
