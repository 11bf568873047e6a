//! Study Router - RVU tracking for radiology reporting workstations
//!
//! This crate watches the reporting applications a radiologist dictates in,
//! works out which study is being read, decides when a study has been
//! genuinely read rather than glanced at, and classifies completed studies
//! into RVU-weighted study types:
//!
//! - **PowerScribe**: desktop client with fixed accession/procedure labels
//! - **Mosaic**: web-based report pages with caption/value text
//! - **Clario**: worklist grid with tab-delimited rows
//!
//! # Architecture
//!
//! A single worker thread polls the enabled integrations at an adaptive
//! interval. Every read of a foreign UI tree is bounded by a deadline, so a
//! hung application never stalls the cycle. Snapshots feed a study tracker,
//! completed studies are classified against a layered rule table and handed
//! to a [`shift_store::RecordSink`].

pub mod bounded;
pub mod classifier;
pub mod config;
pub mod extractors;
pub mod locator;
pub mod platform;
pub mod poller;
pub mod procedure;
pub mod router;
pub mod rules;
pub mod tracker;
pub mod types;

// Re-export commonly used types
pub use bounded::{Bounded, BoundedReader, BoundedRunner, ReadOutcome};
pub use classifier::{classify, Classification, Classifier, MatchSource};
pub use config::{Config, ConfigError};
pub use extractors::{build_extractors, StudyExtractor};
pub use platform::{Desktop, DesktopError, NullDesktop, Property, ScriptedDesktop};
pub use poller::{AdaptivePoller, PollIntervals, PollSpeed};
pub use router::{spawn_worker, RouterStatus, StudyRouter, WorkerCommand, WorkerHandle};
pub use rules::{RuleSet, RulesError};
pub use tracker::{Activity, FinishedStudy, StudyState, StudyTracker, TrackedStudy, TrackerSettings};
pub use types::{CompletedStudyRecord, Integration, Modality, Snapshot, StatusFlag};
