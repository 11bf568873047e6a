//! Clario worklist.
//!
//! Studies are rows of the worklist grid; each row's text is tab-delimited
//! (accession, modality, date, description, status). The row being dictated
//! holds focus, or held it most recently.

use super::{select_candidate, Candidate, FocusHistory, StudyExtractor};
use crate::config::ClarioConfig;
use crate::locator::{ElementLocator, ElementQuery};
use crate::platform::Desktop;
use crate::procedure::parse_fields;
use crate::types::{Integration, Snapshot};
use chrono::{DateTime, Utc};
use tracing::trace;

pub struct ClarioExtractor<D: Desktop> {
    locator: ElementLocator<D>,
    worklist: ElementQuery,
    history: FocusHistory,
}

impl<D: Desktop> ClarioExtractor<D> {
    pub fn new(locator: ElementLocator<D>, config: &ClarioConfig) -> Self {
        Self {
            locator,
            worklist: ElementQuery::AutomationId(config.worklist_id.clone()),
            history: FocusHistory::default(),
        }
    }
}

fn candidate_from_row(text: &str, focused: bool) -> Candidate {
    let fields = parse_fields(text);
    Candidate {
        raw_text: fields.raw_text(),
        accession: fields.accession.unwrap_or_default(),
        status_flags: fields.status_flags,
        focused,
    }
}

impl<D: Desktop> StudyExtractor for ClarioExtractor<D> {
    fn integration(&self) -> Integration {
        Integration::Clario
    }

    fn capture(&mut self, now: DateTime<Utc>) -> Snapshot {
        if self.locator.window().is_none() {
            return Snapshot::empty(Integration::Clario, now);
        }
        let Some(rows) = self.locator.list_rows(&self.worklist) else {
            return Snapshot::empty(Integration::Clario, now);
        };
        trace!("Clario worklist has {} rows", rows.len());

        let candidates = rows
            .iter()
            .map(|row| candidate_from_row(&row.text, row.focused))
            .collect();
        match select_candidate(candidates, &mut self.history) {
            Some(candidate) => candidate.into_snapshot(Integration::Clario, now),
            None => Snapshot::empty(Integration::Clario, now),
        }
    }

    fn invalidate(&mut self) {
        self.locator.invalidate();
    }
}
