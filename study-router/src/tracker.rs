//! Per-accession study lifecycle.
//!
//! A study is `Pending` from its first sighting until it has been seen for
//! the minimum dwell time, then `Active`. When a different accession (or no
//! accession) is observed the tracked study finishes: `Completed` if it had
//! become active, `Abandoned` otherwise. Snapshots must be fed in capture
//! order; all time comes from `Snapshot::captured_at`.

use crate::types::{Integration, Snapshot, StatusFlag};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyState {
    Pending,
    Active,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedStudy {
    pub accession: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_raw_text: String,
    pub state: StudyState,
    pub source: Integration,
    pub status_flags: BTreeSet<StatusFlag>,
}

impl TrackedStudy {
    fn new(snapshot: &Snapshot) -> Self {
        Self {
            accession: snapshot.accession.clone(),
            first_seen_at: snapshot.captured_at,
            last_seen_at: snapshot.captured_at,
            last_raw_text: snapshot.raw_text.clone(),
            state: StudyState::Pending,
            source: snapshot.source,
            status_flags: snapshot.status_flags.clone(),
        }
    }

    /// Time between first and last sighting
    pub fn dwell(&self) -> Duration {
        self.last_seen_at - self.first_seen_at
    }
}

/// A tracked study that left the tracker
#[derive(Debug, Clone, PartialEq)]
pub enum FinishedStudy {
    /// Reached `Active`; a record is owed for it
    Completed {
        study: TrackedStudy,
        completed_at: DateTime<Utc>,
    },
    /// Superseded while still `Pending`
    Abandoned(TrackedStudy),
}

/// What one snapshot did to the tracker
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// The tracked accession changed (new study, or tracking ended)
    pub changed: bool,
    pub finished: Option<FinishedStudy>,
}

/// Tracker state as the poller sees it
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activity {
    /// The last observation changed the tracked accession
    Changed,
    Untracked,
    Tracked {
        state: StudyState,
        unchanged_for: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerSettings {
    pub min_dwell: Duration,
    /// A gap larger than this while `Pending` restarts the dwell clock
    pub max_gap: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            min_dwell: Duration::seconds(10),
            max_gap: Duration::seconds(30),
        }
    }
}

pub struct StudyTracker {
    settings: TrackerSettings,
    current: Option<TrackedStudy>,
    last_change_at: Option<DateTime<Utc>>,
    changed_last: bool,
}

impl StudyTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            current: None,
            last_change_at: None,
            changed_last: false,
        }
    }

    pub fn current(&self) -> Option<&TrackedStudy> {
        self.current.as_ref()
    }

    /// Feed the next snapshot
    pub fn observe(&mut self, snapshot: &Snapshot) -> Observation {
        let at = snapshot.captured_at;

        if snapshot.is_empty() {
            let finished = self.current.take().map(|study| Self::finish(study, at));
            return self.record_change(finished.is_some(), at, finished);
        }

        if let Some(study) = self.current.as_mut().filter(|s| s.accession == snapshot.accession) {
            if study.state == StudyState::Pending && at - study.last_seen_at > self.settings.max_gap {
                debug!("Study {} reappeared after a gap, restarting dwell", study.accession);
                study.first_seen_at = at;
            }
            study.last_seen_at = at;
            // A partial read keeps the last good text
            if !snapshot.raw_text.is_empty() {
                study.last_raw_text = snapshot.raw_text.clone();
            }
            study.status_flags.extend(snapshot.status_flags.iter().copied());
            Self::promote(study, self.settings.min_dwell);
            return self.record_change(false, at, None);
        }

        let finished = self.current.take().map(|study| Self::finish(study, at));
        let mut study = TrackedStudy::new(snapshot);
        debug!("Tracking {} from {}", study.accession, study.source);
        Self::promote(&mut study, self.settings.min_dwell);
        self.current = Some(study);
        self.record_change(true, at, finished)
    }

    /// End tracking at shutdown.
    ///
    /// An active study is completed when `complete_active` is set; anything
    /// else is abandoned.
    pub fn finish_all(&mut self, at: DateTime<Utc>, complete_active: bool) -> Option<FinishedStudy> {
        let study = self.current.take()?;
        self.last_change_at = Some(at);
        if complete_active {
            Some(Self::finish(study, at))
        } else {
            Some(Self::abandon(study))
        }
    }

    /// Activity as of `now`, for interval selection
    pub fn activity(&self, now: DateTime<Utc>) -> Activity {
        if self.changed_last {
            return Activity::Changed;
        }
        match &self.current {
            None => Activity::Untracked,
            Some(study) => Activity::Tracked {
                state: study.state,
                unchanged_for: self
                    .last_change_at
                    .map(|changed| now - changed)
                    .unwrap_or_else(Duration::zero),
            },
        }
    }

    fn record_change(&mut self, changed: bool, at: DateTime<Utc>, finished: Option<FinishedStudy>) -> Observation {
        if changed {
            self.last_change_at = Some(at);
        }
        self.changed_last = changed;
        Observation { changed, finished }
    }

    fn promote(study: &mut TrackedStudy, min_dwell: Duration) {
        if study.state == StudyState::Pending && study.dwell() >= min_dwell {
            study.state = StudyState::Active;
            info!("Study {} active after {}s", study.accession, study.dwell().num_seconds());
        }
    }

    fn finish(study: TrackedStudy, at: DateTime<Utc>) -> FinishedStudy {
        match study.state {
            StudyState::Active => {
                let mut study = study;
                study.state = StudyState::Completed;
                info!("Study {} completed after {}s", study.accession, study.dwell().num_seconds());
                FinishedStudy::Completed {
                    study,
                    completed_at: at,
                }
            }
            _ => Self::abandon(study),
        }
    }

    fn abandon(mut study: TrackedStudy) -> FinishedStudy {
        debug!("Study {} abandoned after {}s", study.accession, study.dwell().num_seconds());
        study.state = StudyState::Abandoned;
        FinishedStudy::Abandoned(study)
    }
}

impl Default for StudyTracker {
    fn default() -> Self {
        Self::new(TrackerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn seen(accession: &str, seconds: i64) -> Snapshot {
        Snapshot {
            accession: accession.to_string(),
            raw_text: format!("CT\tstudy {}", accession),
            status_flags: BTreeSet::new(),
            captured_at: at(seconds),
            source: Integration::PowerScribe,
        }
    }

    fn nothing(seconds: i64) -> Snapshot {
        Snapshot::empty(Integration::PowerScribe, at(seconds))
    }

    fn completed(observations: &[Observation]) -> Vec<&TrackedStudy> {
        observations
            .iter()
            .filter_map(|o| match &o.finished {
                Some(FinishedStudy::Completed { study, .. }) => Some(study),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_sustained_study_completes_on_empty_snapshot() {
        let mut tracker = StudyTracker::default();
        let observations: Vec<_> = [seen("ACC1", 0), seen("ACC1", 6), seen("ACC1", 12), nothing(13)]
            .iter()
            .map(|s| tracker.observe(s))
            .collect();

        let done = completed(&observations);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].accession, "ACC1");
        assert_eq!(done[0].first_seen_at, at(0));
        assert_eq!(done[0].state, StudyState::Completed);
        assert!(observations[..3].iter().all(|o| o.finished.is_none()));
        match &observations[3].finished {
            Some(FinishedStudy::Completed { completed_at, .. }) => assert_eq!(*completed_at, at(13)),
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(tracker.current().is_none());
    }

    #[test]
    fn test_brief_study_is_abandoned() {
        let mut tracker = StudyTracker::default();
        tracker.observe(&seen("ACC1", 0));
        let observation = tracker.observe(&seen("ACC2", 1));

        assert!(observation.changed);
        assert!(matches!(
            observation.finished,
            Some(FinishedStudy::Abandoned(ref study)) if study.accession == "ACC1"
        ));
        assert_eq!(tracker.current().map(|s| s.accession.as_str()), Some("ACC2"));
        assert_eq!(tracker.current().map(|s| s.state), Some(StudyState::Pending));
    }

    #[test]
    fn test_empty_snapshot_does_not_start_tracking() {
        let mut tracker = StudyTracker::default();
        let observation = tracker.observe(&nothing(0));
        assert_eq!(observation, Observation { changed: false, finished: None });
        assert_eq!(tracker.activity(at(0)), Activity::Untracked);
    }

    #[test]
    fn test_completion_is_emitted_once() {
        let mut tracker = StudyTracker::default();
        let mut observations = Vec::new();
        for second in 0..=15 {
            observations.push(tracker.observe(&seen("ACC1", second)));
        }
        for second in 16..20 {
            observations.push(tracker.observe(&nothing(second)));
        }
        observations.push(tracker.observe(&seen("ACC2", 21)));
        assert_eq!(completed(&observations).len(), 1);
    }

    #[test]
    fn test_gap_restarts_dwell() {
        let mut tracker = StudyTracker::default();
        tracker.observe(&seen("ACC1", 0));
        // Worker stalled; the next sighting comes long after the last
        tracker.observe(&seen("ACC1", 40));
        tracker.observe(&seen("ACC1", 45));
        assert_eq!(tracker.current().map(|s| s.state), Some(StudyState::Pending));

        tracker.observe(&seen("ACC1", 50));
        assert_eq!(tracker.current().map(|s| s.state), Some(StudyState::Active));
        assert_eq!(tracker.current().map(|s| s.first_seen_at), Some(at(40)));
    }

    #[test]
    fn test_partial_read_keeps_text() {
        let mut tracker = StudyTracker::default();
        tracker.observe(&seen("ACC1", 0));
        let mut partial = seen("ACC1", 1);
        partial.raw_text.clear();
        partial.status_flags.insert(StatusFlag::InProgress);
        tracker.observe(&partial);

        let study = tracker.current().unwrap();
        assert_eq!(study.last_raw_text, "CT\tstudy ACC1");
        assert!(study.status_flags.contains(&StatusFlag::InProgress));
    }

    #[test]
    fn test_finish_all() {
        let mut tracker = StudyTracker::default();
        tracker.observe(&seen("ACC1", 0));
        tracker.observe(&seen("ACC1", 11));
        assert!(matches!(
            tracker.finish_all(at(12), true),
            Some(FinishedStudy::Completed { .. })
        ));
        assert!(tracker.finish_all(at(13), true).is_none());

        tracker.observe(&seen("ACC2", 20));
        tracker.observe(&seen("ACC2", 35));
        assert!(matches!(
            tracker.finish_all(at(36), false),
            Some(FinishedStudy::Abandoned(_))
        ));

        tracker.observe(&seen("ACC3", 40));
        assert!(matches!(
            tracker.finish_all(at(41), true),
            Some(FinishedStudy::Abandoned(_))
        ));
    }

    #[test]
    fn test_activity() {
        let mut tracker = StudyTracker::default();
        tracker.observe(&seen("ACC1", 0));
        assert_eq!(tracker.activity(at(0)), Activity::Changed);

        tracker.observe(&seen("ACC1", 2));
        assert_eq!(
            tracker.activity(at(2)),
            Activity::Tracked {
                state: StudyState::Pending,
                unchanged_for: Duration::seconds(2),
            }
        );

        tracker.observe(&nothing(3));
        assert_eq!(tracker.activity(at(3)), Activity::Changed);
        tracker.observe(&nothing(4));
        assert_eq!(tracker.activity(at(4)), Activity::Untracked);
    }

    proptest! {
        // Sightings of one accession a few seconds apart, then an empty snapshot
        #[test]
        fn dwell_decides_completion(steps in proptest::collection::vec(1i64..=5, 0..10)) {
            let mut tracker = StudyTracker::default();
            let mut now = 0;
            let mut observations = vec![tracker.observe(&seen("ACC1", now))];
            for step in &steps {
                now += step;
                observations.push(tracker.observe(&seen("ACC1", now)));
            }
            observations.push(tracker.observe(&nothing(now + 1)));

            let emitted = completed(&observations).len();
            if now >= 10 {
                prop_assert_eq!(emitted, 1);
            } else {
                prop_assert_eq!(emitted, 0);
            }
        }
    }
}
