//! PowerScribe desktop client.
//!
//! The client shows the open report's accession, procedure and status in
//! labels with fixed automation ids. Linked studies dictated into one report
//! appear as several comma-separated accessions in the accession label.

use super::{select_candidate, Candidate, FocusHistory, StudyExtractor};
use crate::config::PowerScribeConfig;
use crate::locator::{ElementLocator, ElementQuery};
use crate::platform::{Desktop, Property};
use crate::procedure::{status_flags, strip_status_tokens};
use crate::types::{Integration, Snapshot};
use chrono::{DateTime, Utc};
use tracing::trace;

pub struct PowerScribeExtractor<D: Desktop> {
    locator: ElementLocator<D>,
    accession: ElementQuery,
    procedure: ElementQuery,
    status: ElementQuery,
    history: FocusHistory,
}

impl<D: Desktop> PowerScribeExtractor<D> {
    pub fn new(locator: ElementLocator<D>, config: &PowerScribeConfig) -> Self {
        Self {
            locator,
            accession: ElementQuery::AutomationId(config.accession_id.clone()),
            procedure: ElementQuery::AutomationId(config.procedure_id.clone()),
            status: ElementQuery::AutomationId(config.status_id.clone()),
            history: FocusHistory::default(),
        }
    }
}

fn split_accessions(text: &str) -> Vec<String> {
    text.split([',', ';'])
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

impl<D: Desktop> StudyExtractor for PowerScribeExtractor<D> {
    fn integration(&self) -> Integration {
        Integration::PowerScribe
    }

    fn capture(&mut self, now: DateTime<Utc>) -> Snapshot {
        if self.locator.window().is_none() {
            return Snapshot::empty(Integration::PowerScribe, now);
        }

        let accessions = self.locator.read(&self.accession, Property::Name);
        if accessions.trim().is_empty() {
            trace!("PowerScribe shows no accession");
            return Snapshot::empty(Integration::PowerScribe, now);
        }
        let procedure = self.locator.read(&self.procedure, Property::Name);
        let status = self.locator.read(&self.status, Property::Name);

        let mut flags = status_flags(&status);
        flags.extend(status_flags(&procedure));
        let raw_text = strip_status_tokens(&procedure);

        let candidates = split_accessions(&accessions)
            .into_iter()
            .map(|accession| Candidate {
                accession,
                raw_text: raw_text.clone(),
                status_flags: flags.clone(),
                focused: false,
            })
            .collect();

        match select_candidate(candidates, &mut self.history) {
            Some(candidate) => candidate.into_snapshot(Integration::PowerScribe, now),
            None => Snapshot::empty(Integration::PowerScribe, now),
        }
    }

    fn invalidate(&mut self) {
        self.locator.invalidate();
    }
}
