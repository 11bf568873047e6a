//! Mosaic web-based reporting.
//!
//! The report page renders each study as caption/value text pairs
//! ("Accession" then "ACC123", "Procedure" then "CT HEAD"), or with caption
//! and value in one node ("Accession: ACC123"). Several studies can be on the
//! page at once, so every accession caption starts a new candidate.

use super::{select_candidate, Candidate, FocusHistory, StudyExtractor};
use crate::config::MosaicConfig;
use crate::locator::{ElementLocator, TextNode};
use crate::platform::Desktop;
use crate::procedure::{status_flags, strip_status_tokens};
use crate::types::{Integration, Snapshot};
use chrono::{DateTime, Utc};

pub struct MosaicExtractor<D: Desktop> {
    locator: ElementLocator<D>,
    accession_labels: Vec<String>,
    procedure_labels: Vec<String>,
    history: FocusHistory,
}

#[derive(Debug, PartialEq)]
enum Caption {
    /// Caption alone; the value is the next text node
    Bare,
    /// Caption and value in one node
    Inline(String),
}

fn caption(text: &str, labels: &[String]) -> Option<Caption> {
    let text = text.trim();
    for label in labels {
        let Some(prefix) = text.get(..label.len()) else {
            continue;
        };
        if !prefix.eq_ignore_ascii_case(label) {
            continue;
        }
        let rest = text[label.len()..].trim_start();
        if rest.is_empty() || rest == ":" {
            return Some(Caption::Bare);
        }
        if let Some(value) = rest.strip_prefix(':') {
            return Some(Caption::Inline(value.trim().to_string()));
        }
    }
    None
}

enum Expecting {
    Nothing,
    Accession,
    Procedure,
}

/// Group text nodes into candidates in document order
fn candidates_from_nodes<E>(nodes: &[TextNode<E>], accession_labels: &[String], procedure_labels: &[String]) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut procedure = String::new();
    let mut expecting = Expecting::Nothing;

    fn flush(candidates: &mut [Candidate], procedure: &mut String) {
        if let Some(current) = candidates.last_mut() {
            current.status_flags.extend(status_flags(procedure));
            current.raw_text = strip_status_tokens(procedure);
        }
        procedure.clear();
    }

    for node in nodes {
        let text = node.text.trim();

        match expecting {
            Expecting::Accession => {
                if let Some(current) = candidates.last_mut() {
                    current.accession = text.to_string();
                    current.focused |= node.focused;
                }
                expecting = Expecting::Nothing;
                continue;
            }
            Expecting::Procedure => {
                procedure = text.to_string();
                if let Some(current) = candidates.last_mut() {
                    current.focused |= node.focused;
                }
                expecting = Expecting::Nothing;
                continue;
            }
            Expecting::Nothing => {}
        }

        if let Some(found) = caption(text, accession_labels) {
            flush(&mut candidates, &mut procedure);
            let mut next = Candidate {
                focused: node.focused,
                ..Candidate::default()
            };
            match found {
                Caption::Bare => expecting = Expecting::Accession,
                Caption::Inline(value) => next.accession = value,
            }
            candidates.push(next);
        } else if let Some(found) = caption(text, procedure_labels) {
            match found {
                Caption::Bare => expecting = Expecting::Procedure,
                Caption::Inline(value) => procedure = value,
            }
        } else if let Some(current) = candidates.last_mut() {
            // Stray status badges belong to the study above them
            current.status_flags.extend(status_flags(text));
            current.focused |= node.focused;
        }
    }
    flush(&mut candidates, &mut procedure);
    candidates
}

impl<D: Desktop> MosaicExtractor<D> {
    pub fn new(locator: ElementLocator<D>, config: &MosaicConfig) -> Self {
        Self {
            locator,
            accession_labels: config.accession_labels.clone(),
            procedure_labels: config.procedure_labels.clone(),
            history: FocusHistory::default(),
        }
    }
}

impl<D: Desktop> StudyExtractor for MosaicExtractor<D> {
    fn integration(&self) -> Integration {
        Integration::Mosaic
    }

    fn capture(&mut self, now: DateTime<Utc>) -> Snapshot {
        if self.locator.window().is_none() {
            return Snapshot::empty(Integration::Mosaic, now);
        }
        let Some(nodes) = self.locator.walk_text() else {
            return Snapshot::empty(Integration::Mosaic, now);
        };

        let candidates = candidates_from_nodes(&nodes, &self.accession_labels, &self.procedure_labels);
        match select_candidate(candidates, &mut self.history) {
            Some(candidate) => candidate.into_snapshot(Integration::Mosaic, now),
            None => Snapshot::empty(Integration::Mosaic, now),
        }
    }

    fn invalidate(&mut self) {
        self.locator.invalidate();
    }
}
