//! Record types handed to the shift store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One finished, classified study. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStudyRecord {
    pub accession: String,
    /// Label from the rule table (always has an RVU entry)
    pub study_type: String,
    pub rvu: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl CompletedStudyRecord {
    /// Time between first sighting and completion
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at.signed_duration_since(self.started_at)
    }
}

/// Identifier of a shift row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShiftId(pub i64);

impl fmt::Display for ShiftId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shift#{}", self.0)
    }
}

/// Result of adding a record to a shift
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Record stored
    Inserted,
    /// Accession already recorded in this shift; nothing written
    Duplicate,
}

/// Per-study-type totals within a shift
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyTypeTotal {
    pub study_type: String,
    pub count: usize,
    pub rvu: f64,
}

/// Aggregate view of one shift
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftSummary {
    pub shift_id: ShiftId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub study_count: usize,
    pub total_rvu: f64,
    /// Sorted by RVU contribution, largest first
    pub by_type: Vec<StudyTypeTotal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_duration() {
        let record = CompletedStudyRecord {
            accession: "ACC1".to_string(),
            study_type: "CT Head".to_string(),
            rvu: 0.85,
            started_at: Utc.with_ymd_and_hms(2024, 3, 12, 10, 0, 0).unwrap(),
            completed_at: Utc.with_ymd_and_hms(2024, 3, 12, 10, 4, 30).unwrap(),
        };
        assert_eq!(record.duration().num_seconds(), 270);
    }

    #[test]
    fn test_shift_id_display() {
        assert_eq!(ShiftId(7).to_string(), "shift#7");
    }
}
