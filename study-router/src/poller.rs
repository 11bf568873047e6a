//! Poll interval selection.
//!
//! Fast right after the tracked accession changes, medium while a study is
//! tracked, slow when nothing is. While a study is still settling (pending,
//! or changed less than `settle` ago) the interval may shrink but never grow.

use crate::tracker::{Activity, StudyState};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PollSpeed {
    Fast,
    Medium,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollIntervals {
    pub fast: Duration,
    pub medium: Duration,
    pub slow: Duration,
    pub settle: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            fast: Duration::from_millis(500),
            medium: Duration::from_millis(1000),
            slow: Duration::from_millis(2000),
            settle: Duration::from_millis(1000),
        }
    }
}

impl PollIntervals {
    pub fn interval(&self, speed: PollSpeed) -> Duration {
        match speed {
            PollSpeed::Fast => self.fast,
            PollSpeed::Medium => self.medium,
            PollSpeed::Slow => self.slow,
        }
    }
}

pub struct AdaptivePoller {
    intervals: PollIntervals,
    speed: PollSpeed,
}

impl AdaptivePoller {
    pub fn new(intervals: PollIntervals) -> Self {
        Self {
            intervals,
            speed: PollSpeed::Slow,
        }
    }

    pub fn speed(&self) -> PollSpeed {
        self.speed
    }

    pub fn current(&self) -> Duration {
        self.intervals.interval(self.speed)
    }

    /// Pick the interval before the next cycle
    pub fn next_interval(&mut self, activity: Activity) -> Duration {
        let settle = chrono::Duration::from_std(self.intervals.settle).unwrap_or_else(|_| chrono::Duration::zero());
        let speed = match activity {
            Activity::Changed => PollSpeed::Fast,
            Activity::Tracked { state, unchanged_for } if state == StudyState::Pending || unchanged_for < settle => {
                self.speed.min(PollSpeed::Medium)
            }
            Activity::Tracked { .. } => PollSpeed::Medium,
            Activity::Untracked => PollSpeed::Slow,
        };
        if speed != self.speed {
            trace!("Poll speed {:?} -> {:?}", self.speed, speed);
        }
        self.speed = speed;
        self.current()
    }
}

impl Default for AdaptivePoller {
    fn default() -> Self {
        Self::new(PollIntervals::default())
    }
}
