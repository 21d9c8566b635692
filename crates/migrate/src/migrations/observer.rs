//! Run Observers - Hooks fired as the engine works through a run
//!
//! The engine never logs through a process-wide handle of its own. It reports
//! progress to the observers registered on it; `TracingObserver` is
//! registered by default and turns each hook into a structured `tracing`
//! event.

use std::sync::Arc;
use std::time::Duration;

use super::definitions::{ChangeSet, Direction, RunReport};
use crate::error::{MigrationError, RunError};

/// Why a change-set was left out of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Up change-set whose ledger entry is already active
    AlreadyActive,
    /// Down change-set with no active Up entry, skipped by configuration
    NotActive,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadyActive => "already active",
            SkipReason::NotActive => "not active",
        }
    }
}

/// Receives progress notifications from the migration engine.
///
/// All methods default to no-ops; implement only what you need.
pub trait MigrationObserver: Send + Sync {
    /// Pending change-sets have been selected and the first is about to run
    fn run_started(&self, _direction: Direction, _pending: usize) {}

    fn change_set_skipped(&self, _change_set: &ChangeSet, _reason: SkipReason) {}

    /// A transaction is open and the body is about to execute
    fn change_set_started(&self, _change_set: &ChangeSet) {}

    /// The body and its ledger write committed together
    fn change_set_committed(&self, _change_set: &ChangeSet, _elapsed: Duration) {}

    /// The transaction was rolled back; the run stops after this
    fn change_set_failed(&self, _change_set: &ChangeSet, _error: &MigrationError) {}

    fn run_finished(&self, _report: &RunReport) {}

    fn run_failed(&self, _error: &RunError) {}
}

/// Emits one `tracing` event per hook
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl MigrationObserver for TracingObserver {
    fn run_started(&self, direction: Direction, pending: usize) {
        tracing::info!(%direction, pending, "Starting migration run");
    }

    fn change_set_skipped(&self, change_set: &ChangeSet, reason: SkipReason) {
        tracing::debug!(
            change_set = %change_set.name,
            direction = %change_set.direction,
            reason = reason.as_str(),
            "Skipping change-set"
        );
    }

    fn change_set_started(&self, change_set: &ChangeSet) {
        tracing::debug!(
            change_set = %change_set.name,
            direction = %change_set.direction,
            path = %change_set.path.display(),
            "Executing change-set"
        );
    }

    fn change_set_committed(&self, change_set: &ChangeSet, elapsed: Duration) {
        tracing::info!(
            change_set = %change_set.name,
            direction = %change_set.direction,
            elapsed_ms = elapsed.as_millis() as u64,
            "Change-set committed"
        );
    }

    fn change_set_failed(&self, change_set: &ChangeSet, error: &MigrationError) {
        tracing::error!(
            change_set = %change_set.name,
            direction = %change_set.direction,
            error = %error,
            "Change-set rolled back"
        );
    }

    fn run_finished(&self, report: &RunReport) {
        tracing::info!(
            direction = %report.direction,
            completed = report.completed.len(),
            skipped = report.skipped.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Migration run finished"
        );
    }

    fn run_failed(&self, error: &RunError) {
        tracing::error!(
            direction = %error.direction,
            completed = error.completed.len(),
            error = %error.error,
            "Migration run failed"
        );
    }
}

/// Ordered set of observers notified one after another
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    observers: Vec<Arc<dyn MigrationObserver>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn MigrationObserver>) {
        self.observers.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn clear(&mut self) {
        self.observers.clear();
    }
}

impl MigrationObserver for ObserverRegistry {
    fn run_started(&self, direction: Direction, pending: usize) {
        for observer in &self.observers {
            observer.run_started(direction, pending);
        }
    }

    fn change_set_skipped(&self, change_set: &ChangeSet, reason: SkipReason) {
        for observer in &self.observers {
            observer.change_set_skipped(change_set, reason);
        }
    }

    fn change_set_started(&self, change_set: &ChangeSet) {
        for observer in &self.observers {
            observer.change_set_started(change_set);
        }
    }

    fn change_set_committed(&self, change_set: &ChangeSet, elapsed: Duration) {
        for observer in &self.observers {
            observer.change_set_committed(change_set, elapsed);
        }
    }

    fn change_set_failed(&self, change_set: &ChangeSet, error: &MigrationError) {
        for observer in &self.observers {
            observer.change_set_failed(change_set, error);
        }
    }

    fn run_finished(&self, report: &RunReport) {
        for observer in &self.observers {
            observer.run_finished(report);
        }
    }

    fn run_failed(&self, error: &RunError) {
        for observer in &self.observers {
            observer.run_failed(error);
        }
    }
}
