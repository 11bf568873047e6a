//! Bounded operations against foreign UI elements.
//!
//! UI automation calls into a busy application can block indefinitely and
//! offer no cancellation. Every read and search therefore runs on a
//! short-lived detached thread; the caller waits at most until its deadline
//! and then moves on. A late thread is abandoned: its result goes into a
//! channel nobody reads, so no state written after the deadline is ever
//! observed by a later cycle.

use crate::platform::{Desktop, Property};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Result of a bounded operation
#[derive(Debug, Clone, PartialEq)]
pub enum Bounded<T> {
    /// Finished before the deadline
    Completed(T),
    /// Deadline passed; the worker thread was abandoned
    TimedOut,
    /// The operation panicked
    Panicked,
    /// Not started because too many abandoned operations are still running
    Rejected,
}

impl<T> Bounded<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Bounded::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Bounded::Completed(_))
    }
}

/// Decrements the in-flight counter when the worker thread ends
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawns bounded operations and keeps count of those still running
#[derive(Debug, Clone)]
pub struct BoundedRunner {
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
}

impl BoundedRunner {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Operations started and not yet finished (including abandoned ones)
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// A runner with the same limit and a budget of its own
    pub fn detached(&self) -> Self {
        Self::new(self.max_in_flight)
    }

    /// Run `op` on a detached thread, waiting at most `deadline` for it
    pub fn run<T, F>(&self, deadline: Duration, label: &str, op: F) -> Bounded<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) >= self.max_in_flight {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!(
                "{}: {} operations still in flight, not starting another",
                label, self.max_in_flight
            );
            return Bounded::Rejected;
        }

        // Capacity 1: the worker's send never blocks, even after we stop listening
        let (tx, rx) = mpsc::sync_channel(1);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));

        let spawned = std::thread::Builder::new()
            .name(format!("bounded-{}", label))
            .spawn(move || {
                let _guard = guard;
                let result = panic::catch_unwind(AssertUnwindSafe(op));
                let _ = tx.send(result);
            });

        if let Err(e) = spawned {
            // The closure (and its guard) was dropped, so the count is already restored
            warn!("{}: failed to spawn worker thread: {}", label, e);
            return Bounded::Rejected;
        }

        match rx.recv_timeout(deadline) {
            Ok(Ok(value)) => Bounded::Completed(value),
            Ok(Err(_)) => {
                warn!("{}: operation panicked", label);
                Bounded::Panicked
            }
            Err(RecvTimeoutError::Timeout) => {
                trace!("{}: no result within {:?}, abandoning", label, deadline);
                Bounded::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => Bounded::Panicked,
        }
    }
}

impl Default for BoundedRunner {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Outcome of a single property read
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Text(String),
    TimedOut,
    /// Not attempted; the in-flight limit was reached
    Rejected,
    Failed,
}

impl ReadOutcome {
    /// Text, or empty string for any failure
    pub fn into_text(self) -> String {
        match self {
            ReadOutcome::Text(text) => text,
            _ => String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ReadOutcome::Text(_))
    }
}

/// Reads element properties without ever blocking past a deadline
pub struct BoundedReader<D: Desktop> {
    desktop: Arc<D>,
    runner: BoundedRunner,
    timeout: Duration,
}

impl<D: Desktop> Clone for BoundedReader<D> {
    fn clone(&self) -> Self {
        Self {
            desktop: Arc::clone(&self.desktop),
            runner: self.runner.clone(),
            timeout: self.timeout,
        }
    }
}

impl<D: Desktop> BoundedReader<D> {
    pub fn new(desktop: Arc<D>, runner: BoundedRunner, timeout: Duration) -> Self {
        Self {
            desktop,
            runner,
            timeout,
        }
    }

    pub fn desktop(&self) -> &Arc<D> {
        &self.desktop
    }

    /// Reader over the same desktop whose in-flight budget is not shared
    /// with this one
    pub fn with_own_budget(&self) -> Self {
        Self {
            desktop: Arc::clone(&self.desktop),
            runner: self.runner.detached(),
            timeout: self.timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read a property, reporting how the read ended
    pub fn read(&self, element: &D::Element, property: Property) -> ReadOutcome {
        let desktop = Arc::clone(&self.desktop);
        let element = element.clone();

        match self.runner.run(self.timeout, "read", move || desktop.property(&element, property)) {
            Bounded::Completed(Ok(text)) => ReadOutcome::Text(text),
            Bounded::Completed(Err(e)) => {
                warn!("Reading {:?} failed: {}", property, e);
                ReadOutcome::Failed
            }
            Bounded::TimedOut => {
                warn!("Reading {:?} timed out after {:?}", property, self.timeout);
                ReadOutcome::TimedOut
            }
            // The runner has already logged the rejection
            Bounded::Rejected => ReadOutcome::Rejected,
            Bounded::Panicked => ReadOutcome::Failed,
        }
    }

    /// Read a property; any failure yields an empty string
    pub fn read_text(&self, element: &D::Element, property: Property) -> String {
        self.read(element, property).into_text()
    }

    /// Run an arbitrary desktop operation under `deadline`
    pub fn run<T, F>(&self, deadline: Duration, label: &str, op: F) -> Bounded<T>
    where
        T: Send + 'static,
        F: FnOnce(&D) -> T + Send + 'static,
    {
        let desktop = Arc::clone(&self.desktop);
        self.runner.run(deadline, label, move || op(desktop.as_ref()))
    }
}
