//! Shift Store Library
//!
//! Persistence sink for completed studies. Records are grouped into shifts
//! and stored in SQLite; the router only sees the [`RecordSink`] trait.

pub mod record;
pub mod storage;

pub use record::{AddOutcome, CompletedStudyRecord, ShiftId, ShiftSummary, StudyTypeTotal};
pub use storage::{RecordSink, ShiftStore, StoreError};
