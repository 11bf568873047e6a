//! Extractors for the supported reporting applications.
//!
//! This module provides one extractor per integration:
//! - PowerScribe: fixed labels in a desktop client
//! - Mosaic: caption/value text pairs in a web-based report window
//! - Clario: tab-delimited rows of a worklist grid
//!
//! Each extractor owns its element locator, so cached handles live exactly
//! as long as the extractor and are only touched by the worker thread.

pub mod clario;
pub mod mosaic;
pub mod powerscribe;

pub use clario::ClarioExtractor;
pub use mosaic::MosaicExtractor;
pub use powerscribe::PowerScribeExtractor;

use crate::bounded::BoundedReader;
use crate::config::{Config, ConfigError};
use crate::locator::ElementLocator;
use crate::platform::Desktop;
use crate::procedure::looks_like_accession;
use crate::types::{Integration, Snapshot, StatusFlag};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, VecDeque};

/// Trait for study extractors
pub trait StudyExtractor: Send {
    fn integration(&self) -> Integration;

    /// Read the application's current study. Never fails: an application
    /// that is missing, hung or mid-redraw yields an empty or partial snapshot.
    fn capture(&mut self, now: DateTime<Utc>) -> Snapshot;

    /// Drop cached element handles
    fn invalidate(&mut self);
}

/// One study the application currently shows
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Candidate {
    pub accession: String,
    pub raw_text: String,
    pub status_flags: BTreeSet<StatusFlag>,
    /// Has dictation focus right now
    pub focused: bool,
}

impl Candidate {
    pub fn into_snapshot(self, source: Integration, captured_at: DateTime<Utc>) -> Snapshot {
        Snapshot {
            accession: self.accession,
            raw_text: self.raw_text,
            status_flags: self.status_flags,
            captured_at,
            source,
        }
    }
}

const FOCUS_HISTORY_LEN: usize = 32;

/// Accessions that recently had dictation focus, most recent last
#[derive(Debug, Default)]
pub struct FocusHistory {
    recent: VecDeque<String>,
}

impl FocusHistory {
    pub fn record(&mut self, accession: &str) {
        self.recent.retain(|a| a != accession);
        self.recent.push_back(accession.to_string());
        while self.recent.len() > FOCUS_HISTORY_LEN {
            self.recent.pop_front();
        }
    }

    /// Higher is more recent; `None` if never focused
    pub fn recency(&self, accession: &str) -> Option<usize> {
        self.recent.iter().position(|a| a == accession)
    }
}

/// Pick the single most plausible candidate.
///
/// Implausible accessions are dropped first. Among the rest: the one with
/// focus now, else the one focused most recently, else one in progress, else
/// the first in document order.
pub fn select_candidate(candidates: Vec<Candidate>, history: &mut FocusHistory) -> Option<Candidate> {
    let mut plausible: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| looks_like_accession(&c.accession))
        .collect();

    if let Some(index) = plausible.iter().position(|c| c.focused) {
        history.record(&plausible[index].accession);
        return Some(plausible.swap_remove(index));
    }

    let recent = plausible
        .iter()
        .enumerate()
        .filter_map(|(index, c)| history.recency(&c.accession).map(|rank| (rank, index)))
        .max()
        .map(|(_, index)| index);
    if let Some(index) = recent {
        return Some(plausible.swap_remove(index));
    }

    if let Some(index) = plausible.iter().position(|c| c.status_flags.contains(&StatusFlag::InProgress)) {
        return Some(plausible.swap_remove(index));
    }

    plausible.into_iter().next()
}

/// Build the enabled extractors in configured order.
///
/// Each extractor reads with its own in-flight budget, so threads left
/// behind by one hung application never block reads of the others.
pub fn build_extractors<D: Desktop>(
    config: &Config,
    reader: &BoundedReader<D>,
) -> Result<Vec<Box<dyn StudyExtractor>>, ConfigError> {
    let limits = config.reader.limits();
    let mut extractors: Vec<Box<dyn StudyExtractor>> = Vec::new();

    for integration in config.integrations.enabled() {
        let locator = ElementLocator::new(reader.with_own_budget(), config.title_pattern(integration)?, limits);
        let extractor: Box<dyn StudyExtractor> = match integration {
            Integration::PowerScribe => Box::new(PowerScribeExtractor::new(
                locator,
                &config.integrations.powerscribe,
            )),
            Integration::Mosaic => Box::new(MosaicExtractor::new(locator, &config.integrations.mosaic)),
            Integration::Clario => Box::new(ClarioExtractor::new(locator, &config.integrations.clario)),
        };
        extractors.push(extractor);
    }
    Ok(extractors)
}
