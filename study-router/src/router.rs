//! Main routing logic for the RVU router.
//!
//! One cycle asks each extractor in turn for the current study, feeds the
//! first non-empty snapshot to the tracker, classifies whatever the tracker
//! completed and picks the interval before the next cycle. The worker runs
//! cycles on a dedicated thread; the gaps between cycles are the only points
//! where rules are swapped or the worker is paused.

use crate::bounded::{BoundedReader, BoundedRunner};
use crate::classifier::Classifier;
use crate::config::{Config, ConfigError};
use crate::extractors::{build_extractors, StudyExtractor};
use crate::platform::Desktop;
use crate::poller::{AdaptivePoller, PollIntervals, PollSpeed};
use crate::rules::RuleSet;
use crate::tracker::{FinishedStudy, StudyState, StudyTracker, TrackerSettings};
use crate::types::{CompletedStudyRecord, Integration, Snapshot};
use chrono::{DateTime, Utc};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Main study router
pub struct StudyRouter {
    /// Extractors in the order they are tried
    extractors: Vec<Box<dyn StudyExtractor>>,
    tracker: StudyTracker,
    poller: AdaptivePoller,
    classifier: Classifier,
    /// Complete an active study on shutdown
    complete_on_shutdown: bool,
    paused: bool,
    cycles: u64,
    completed: u64,
    abandoned: u64,
}

impl StudyRouter {
    pub fn new(
        extractors: Vec<Box<dyn StudyExtractor>>,
        tracker: TrackerSettings,
        intervals: PollIntervals,
        classifier: Classifier,
        complete_on_shutdown: bool,
    ) -> Self {
        Self {
            extractors,
            tracker: StudyTracker::new(tracker),
            poller: AdaptivePoller::new(intervals),
            classifier,
            complete_on_shutdown,
            paused: false,
            cycles: 0,
            completed: 0,
            abandoned: 0,
        }
    }

    /// Router reading from `desktop` with the enabled integrations of `config`
    pub fn from_config<D: Desktop>(config: &Config, desktop: Arc<D>, rules: Arc<RuleSet>) -> Result<Self, ConfigError> {
        config.validate()?;
        let reader = BoundedReader::new(
            desktop,
            BoundedRunner::new(config.reader.max_in_flight),
            config.reader.read_timeout(),
        );
        let extractors = build_extractors(config, &reader)?;
        info!(
            "Router configured with {} integrations: {:?}",
            extractors.len(),
            extractors.iter().map(|e| e.integration()).collect::<Vec<_>>()
        );

        Ok(Self::new(
            extractors,
            config.tracker.settings(),
            config.polling.intervals(),
            Classifier::new(rules),
            config.tracker.complete_on_shutdown,
        ))
    }

    /// Snapshot of the first integration that currently shows a study
    fn capture(&mut self, now: DateTime<Utc>) -> Snapshot {
        for extractor in self.extractors.iter_mut() {
            let snapshot = extractor.capture(now);
            if !snapshot.is_empty() {
                return snapshot;
            }
        }
        let source = self
            .extractors
            .first()
            .map(|e| e.integration())
            .unwrap_or(Integration::PowerScribe);
        Snapshot::empty(source, now)
    }

    /// Run one poll cycle at `now`, returning the studies it completed
    pub fn cycle_at(&mut self, now: DateTime<Utc>) -> Vec<CompletedStudyRecord> {
        self.cycles += 1;
        let snapshot = self.capture(now);
        self.track(&snapshot)
    }

    /// Feed an already-captured snapshot through tracking and classification
    pub fn track(&mut self, snapshot: &Snapshot) -> Vec<CompletedStudyRecord> {
        let observation = self.tracker.observe(snapshot);
        if observation.changed {
            debug!(
                "Tracked study now {:?}",
                self.tracker.current().map(|s| s.accession.as_str())
            );
        }

        let records = observation
            .finished
            .and_then(|finished| self.settle(finished))
            .into_iter()
            .collect();
        self.poller.next_interval(self.tracker.activity(snapshot.captured_at));
        records
    }

    fn settle(&mut self, finished: FinishedStudy) -> Option<CompletedStudyRecord> {
        match finished {
            FinishedStudy::Completed { study, completed_at } => {
                let classification = self.classifier.classify(&study.last_raw_text);
                info!(
                    "Completed {} as '{}' ({} RVU, {})",
                    study.accession, classification.study_type, classification.rvu, classification.matched_by
                );
                self.completed += 1;
                Some(CompletedStudyRecord {
                    accession: study.accession,
                    study_type: classification.study_type,
                    rvu: classification.rvu,
                    started_at: study.first_seen_at,
                    completed_at,
                })
            }
            FinishedStudy::Abandoned(_) => {
                self.abandoned += 1;
                None
            }
        }
    }

    /// Finish the tracked study at shutdown
    pub fn shutdown_at(&mut self, now: DateTime<Utc>) -> Option<CompletedStudyRecord> {
        let finished = self.tracker.finish_all(now, self.complete_on_shutdown)?;
        self.settle(finished)
    }

    /// Interval to wait before the next cycle
    pub fn next_interval(&self) -> Duration {
        self.poller.current()
    }

    /// Swap the rule table; takes effect from the next cycle
    pub fn reload_rules(&mut self, rules: Arc<RuleSet>) {
        info!("Rules reloaded: {} study types", rules.study_types().len());
        self.classifier.replace_rules(rules);
    }

    /// Pause the router
    pub fn pause(&mut self) {
        info!("Router paused");
        self.paused = true;
    }

    /// Resume the router
    pub fn resume(&mut self) {
        info!("Router resumed");
        self.paused = false;
        // Windows may have come and gone while paused
        for extractor in self.extractors.iter_mut() {
            extractor.invalidate();
        }
    }

    /// Check if router is paused
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Get router status
    pub fn status(&self) -> RouterStatus {
        let current = self.tracker.current();
        RouterStatus {
            paused: self.paused,
            cycles: self.cycles,
            completed: self.completed,
            abandoned: self.abandoned,
            tracking: current.map(|s| s.accession.clone()),
            state: current.map(|s| s.state),
            speed: self.poller.speed(),
        }
    }
}

/// Router status information
#[derive(Debug, Clone, PartialEq)]
pub struct RouterStatus {
    pub paused: bool,
    pub cycles: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub tracking: Option<String>,
    pub state: Option<StudyState>,
    pub speed: PollSpeed,
}

/// Commands accepted by a running worker between cycles
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    ReloadRules(Arc<RuleSet>),
    Pause,
    Resume,
    Shutdown,
}

/// Handle to the worker thread
pub struct WorkerHandle {
    control: std_mpsc::Sender<WorkerCommand>,
    thread: JoinHandle<RouterStatus>,
}

impl WorkerHandle {
    /// Queue a command; false if the worker has already stopped
    pub fn send(&self, command: WorkerCommand) -> bool {
        self.control.send(command).is_ok()
    }

    /// Stop the worker and wait for it to flush the tracked study
    pub fn shutdown(self) -> Option<RouterStatus> {
        let _ = self.control.send(WorkerCommand::Shutdown);
        match self.thread.join() {
            Ok(status) => Some(status),
            Err(_) => {
                error!("Router worker panicked");
                None
            }
        }
    }
}

/// Run `router` on a dedicated thread, sending completed records to `records`
pub fn spawn_worker(
    router: StudyRouter,
    records: mpsc::Sender<CompletedStudyRecord>,
) -> std::io::Result<WorkerHandle> {
    let (control, commands) = std_mpsc::channel();
    let thread = std::thread::Builder::new()
        .name("rvu-router".to_string())
        .spawn(move || run_worker(router, commands, records))?;
    Ok(WorkerHandle { control, thread })
}

fn send_record(records: &mpsc::Sender<CompletedStudyRecord>, record: CompletedStudyRecord) {
    let accession = record.accession.clone();
    if records.blocking_send(record).is_err() {
        warn!("Record channel closed, dropping {}", accession);
    }
}

fn run_worker(
    mut router: StudyRouter,
    commands: std_mpsc::Receiver<WorkerCommand>,
    records: mpsc::Sender<CompletedStudyRecord>,
) -> RouterStatus {
    info!("Router worker started");

    loop {
        if !router.is_paused() {
            for record in router.cycle_at(Utc::now()) {
                send_record(&records, record);
            }
        }

        let command = if router.is_paused() {
            commands.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            commands.recv_timeout(router.next_interval())
        };

        match command {
            Ok(WorkerCommand::ReloadRules(rules)) => router.reload_rules(rules),
            Ok(WorkerCommand::Pause) => router.pause(),
            Ok(WorkerCommand::Resume) => router.resume(),
            Ok(WorkerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    if let Some(record) = router.shutdown_at(Utc::now()) {
        send_record(&records, record);
    }
    let status = router.status();
    info!(
        "Router worker stopped after {} cycles ({} completed, {} abandoned)",
        status.cycles, status.completed, status.abandoned
    );
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeSet, VecDeque};

    /// Replays a fixed sequence of accessions; `None` is an empty read
    struct ReplayExtractor {
        integration: Integration,
        script: VecDeque<Option<(&'static str, &'static str)>>,
        repeat_last: bool,
        last: Option<(&'static str, &'static str)>,
    }

    impl ReplayExtractor {
        fn new(integration: Integration, script: Vec<Option<(&'static str, &'static str)>>) -> Self {
            Self {
                integration,
                script: script.into(),
                repeat_last: false,
                last: None,
            }
        }
    }

    impl StudyExtractor for ReplayExtractor {
        fn integration(&self) -> Integration {
            self.integration
        }

        fn capture(&mut self, now: DateTime<Utc>) -> Snapshot {
            let next = match self.script.pop_front() {
                Some(step) => step,
                None if self.repeat_last => self.last,
                None => None,
            };
            self.last = next;
            match next {
                Some((accession, text)) => Snapshot {
                    accession: accession.to_string(),
                    raw_text: text.to_string(),
                    status_flags: BTreeSet::new(),
                    captured_at: now,
                    source: self.integration,
                },
                None => Snapshot::empty(self.integration, now),
            }
        }

        fn invalidate(&mut self) {}
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn router(extractors: Vec<Box<dyn StudyExtractor>>, settings: TrackerSettings) -> StudyRouter {
        let rules = Arc::new(RuleSet::builtin().unwrap());
        StudyRouter::new(extractors, settings, PollIntervals::default(), Classifier::new(rules), true)
    }

    #[test]
    fn test_sustained_study_produces_one_record() {
        let extractor = ReplayExtractor::new(
            Integration::PowerScribe,
            vec![
                Some(("ACC1", "CT\tchest abdomen pelvis")),
                Some(("ACC1", "CT\tchest abdomen pelvis")),
                Some(("ACC1", "CT\tchest abdomen pelvis")),
                None,
            ],
        );
        let mut router = router(vec![Box::new(extractor)], TrackerSettings::default());

        assert!(router.cycle_at(at(0)).is_empty());
        assert!(router.cycle_at(at(6)).is_empty());
        assert!(router.cycle_at(at(12)).is_empty());
        let records = router.cycle_at(at(13));

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.accession, "ACC1");
        assert_eq!(record.study_type, "CT CAP");
        assert_eq!(record.started_at, at(0));
        assert_eq!(record.completed_at, at(13));
        assert_eq!(router.status().completed, 1);
    }

    #[test]
    fn test_brief_study_produces_nothing() {
        let extractor = ReplayExtractor::new(
            Integration::Clario,
            vec![Some(("ACC1", "CT\thead")), Some(("ACC2", "CT\thead"))],
        );
        let mut router = router(vec![Box::new(extractor)], TrackerSettings::default());

        assert!(router.cycle_at(at(0)).is_empty());
        assert!(router.cycle_at(at(1)).is_empty());
        let status = router.status();
        assert_eq!(status.abandoned, 1);
        assert_eq!(status.tracking.as_deref(), Some("ACC2"));
    }

    #[test]
    fn test_first_non_empty_extractor_wins() {
        let quiet = ReplayExtractor::new(Integration::PowerScribe, vec![None]);
        let busy = ReplayExtractor::new(Integration::Mosaic, vec![Some(("ACC9", "MRI\tbrain"))]);
        let mut router = router(vec![Box::new(quiet), Box::new(busy)], TrackerSettings::default());

        router.cycle_at(at(0));
        assert_eq!(router.status().tracking.as_deref(), Some("ACC9"));
        assert_eq!(router.next_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_no_extractors() {
        let mut router = router(Vec::new(), TrackerSettings::default());
        assert!(router.cycle_at(at(0)).is_empty());
        assert_eq!(router.next_interval(), Duration::from_millis(2000));
    }

    #[test]
    fn test_reload_rules_between_cycles() {
        let extractor = ReplayExtractor::new(
            Integration::PowerScribe,
            vec![Some(("ACC1", "CT\tguided biopsy")), Some(("ACC1", "CT\tguided biopsy")), None],
        );
        let mut router = router(vec![Box::new(extractor)], TrackerSettings::default());
        router.cycle_at(at(0));
        router.cycle_at(at(11));

        let extended = RuleSet::builtin()
            .unwrap()
            .with_overlay("[rvu]\n\"CT Biopsy\" = 1.5\n[[study_types]]\nlabel = \"CT Biopsy\"\nmodality = \"CT\"\n[[study_types.rules]]\nrequired = [\"biopsy\"]\n")
            .unwrap();
        router.reload_rules(Arc::new(extended));

        let records = router.cycle_at(at(12));
        assert_eq!(records[0].study_type, "CT Biopsy");
        assert_eq!(records[0].rvu, 1.5);
    }

    #[test]
    fn test_shutdown_flushes_active_study() {
        let extractor = ReplayExtractor::new(
            Integration::PowerScribe,
            vec![Some(("ACC1", "XR\tchest")), Some(("ACC1", "XR\tchest"))],
        );
        let mut router = router(vec![Box::new(extractor)], TrackerSettings::default());
        router.cycle_at(at(0));
        router.cycle_at(at(10));

        let record = router.shutdown_at(at(11)).unwrap();
        assert_eq!(record.study_type, "XR Chest");
        assert!(router.shutdown_at(at(12)).is_none());
    }

    #[test]
    fn test_worker_runs_and_flushes_on_shutdown() {
        let mut extractor = ReplayExtractor::new(Integration::PowerScribe, vec![Some(("ACC1", "CT\tpelvis"))]);
        extractor.repeat_last = true;
        let settings = TrackerSettings {
            min_dwell: chrono::Duration::zero(),
            ..TrackerSettings::default()
        };
        let router = router(vec![Box::new(extractor)], settings);
        let (tx, mut rx) = mpsc::channel(8);

        let worker = spawn_worker(router, tx).unwrap();
        assert!(worker.send(WorkerCommand::Pause));
        assert!(worker.send(WorkerCommand::Resume));
        std::thread::sleep(Duration::from_millis(50));
        let status = worker.shutdown().unwrap();

        assert!(status.cycles >= 1);
        let record = rx.blocking_recv().unwrap();
        assert_eq!(record.accession, "ACC1");
        assert_eq!(record.study_type, "CT MSK Pelvis");
        assert!(rx.blocking_recv().is_none());
    }
}
