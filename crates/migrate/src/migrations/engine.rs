//! Migration Engine - Applies and reverts change-sets against the ledger
//!
//! Each change-set runs in its own transaction together with its ledger
//! write, so a change-set is either fully applied and recorded or not at all.
//! Runs stop at the first failure; change-sets committed before it stay
//! committed and are reported in the `RunError`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::definitions::{
    ChangeSet, ChangeSetStatus, Direction, LedgerEntry, MigrationConfig, RunReport, StatusReport,
};
use super::ledger::ApplicationLedger;
use super::lock::{lock_key, MigrationLock};
use super::observer::{MigrationObserver, ObserverRegistry, SkipReason, TracingObserver};
use super::repository::{ChangeSetRepository, DirectoryRepository};
use crate::backends::{DatabasePool, DatabaseTransaction};
use crate::error::{MigrationError, MigrationResult, RunError};

/// Progress of a run, kept outside the fallible part so a failure can report it
#[derive(Debug, Default)]
struct RunProgress {
    completed: Vec<String>,
    skipped: Vec<String>,
}

/// Applies Up change-sets and reverts them with their Down counterparts
pub struct MigrationEngine {
    pool: Arc<dyn DatabasePool>,
    repository: Arc<dyn ChangeSetRepository>,
    ledger: ApplicationLedger,
    config: MigrationConfig,
    observers: ObserverRegistry,
    cancellation: CancellationToken,
}

impl MigrationEngine {
    /// Engine reading change-sets from the directories in `config`,
    /// reporting through `tracing`
    pub fn new(pool: Arc<dyn DatabasePool>, config: MigrationConfig) -> Self {
        let repository = Arc::new(DirectoryRepository::from_config(&config));
        let ledger = ApplicationLedger::new(pool.clone(), config.ledger_table.clone());
        let mut observers = ObserverRegistry::new();
        observers.register(Arc::new(TracingObserver));

        Self {
            pool,
            repository,
            ledger,
            config,
            observers,
            cancellation: CancellationToken::new(),
        }
    }

    /// Read change-sets from `repository` instead of the configured directories
    pub fn with_repository(mut self, repository: Arc<dyn ChangeSetRepository>) -> Self {
        self.repository = repository;
        self
    }

    /// Notify `observer` in addition to the ones already registered
    pub fn with_observer(mut self, observer: Arc<dyn MigrationObserver>) -> Self {
        self.observers.register(observer);
        self
    }

    /// Drop all registered observers, including the default tracing one
    pub fn without_observers(mut self) -> Self {
        self.observers.clear();
        self
    }

    /// Stop runs before the next change-set once `token` is cancelled. A run
    /// still waiting for the advisory lock gives up immediately.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn ledger(&self) -> &ApplicationLedger {
        &self.ledger
    }

    /// Apply every Up change-set that is not active, in ascending name order
    pub async fn apply(&self) -> Result<RunReport, RunError> {
        self.run(Direction::Up).await
    }

    /// Execute every Down change-set, closing the matching ledger entry.
    ///
    /// A Down whose Up is not active fails the run with `NoActiveEntry`
    /// unless `skip_inactive_on_revert` is set.
    pub async fn revert(&self) -> Result<RunReport, RunError> {
        self.run(Direction::Down).await
    }

    /// Compare the Up change-sets on disk with the ledger
    pub async fn status(&self) -> MigrationResult<StatusReport> {
        let change_sets = self.repository.list(Direction::Up)?;

        let entries = match self.ledger.entries().await {
            Ok(entries) => entries,
            // Nothing has ever been applied
            Err(MigrationError::Ledger(e)) if e.is_undefined_table() => Vec::new(),
            Err(e) => return Err(e),
        };

        Ok(build_status(&change_sets, &entries))
    }

    async fn run(&self, direction: Direction) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let mut progress = RunProgress::default();

        let lock = if self.config.use_advisory_lock {
            let key = lock_key(&self.config.ledger_table);
            let acquired = tokio::select! {
                acquired = MigrationLock::acquire(self.pool.as_ref(), key) => acquired,
                _ = self.cancellation.cancelled() => Err(MigrationError::LockCancelled),
            };
            match acquired {
                Ok(lock) => Some(lock),
                Err(error) => return Err(self.fail(direction, progress, error)),
            }
        } else {
            None
        };

        let outcome = self.run_locked(direction, &mut progress).await;

        if let Some(lock) = lock {
            lock.release().await;
        }

        match outcome {
            Ok(()) => {
                let report = RunReport {
                    direction,
                    completed: progress.completed,
                    skipped: progress.skipped,
                    elapsed: started.elapsed(),
                };
                self.observers.run_finished(&report);
                Ok(report)
            }
            Err(error) => Err(self.fail(direction, progress, error)),
        }
    }

    fn fail(&self, direction: Direction, progress: RunProgress, error: MigrationError) -> RunError {
        let error = RunError {
            direction,
            completed: progress.completed,
            error,
        };
        self.observers.run_failed(&error);
        error
    }

    async fn run_locked(
        &self,
        direction: Direction,
        progress: &mut RunProgress,
    ) -> MigrationResult<()> {
        self.ledger.ensure_schema().await?;

        // Down change-sets run in the same ascending order as Up. Undoing
        // dependent change-sets safely needs the reverse; existing down
        // directories are written against the ascending order.
        let change_sets = self.repository.list(direction)?;
        let pending = self.select_pending(direction, change_sets, progress).await?;
        self.observers.run_started(direction, pending.len());

        for change_set in &pending {
            if self.cancellation.is_cancelled() {
                return Err(MigrationError::Cancelled {
                    next: change_set.name.clone(),
                });
            }

            self.observers.change_set_started(change_set);
            let started = Instant::now();

            match self.execute(change_set).await {
                Ok(()) => {
                    self.observers
                        .change_set_committed(change_set, started.elapsed());
                    progress.completed.push(change_set.name.clone());
                }
                Err(error) => {
                    self.observers.change_set_failed(change_set, &error);
                    return Err(error);
                }
            }
        }

        Ok(())
    }

    async fn select_pending(
        &self,
        direction: Direction,
        change_sets: Vec<ChangeSet>,
        progress: &mut RunProgress,
    ) -> MigrationResult<Vec<ChangeSet>> {
        let mut pending = Vec::with_capacity(change_sets.len());

        for change_set in change_sets {
            let skip = match direction {
                Direction::Up => {
                    if self.ledger.is_active(&change_set.name).await? {
                        Some(SkipReason::AlreadyActive)
                    } else {
                        None
                    }
                }
                Direction::Down if self.config.skip_inactive_on_revert => {
                    if self.ledger.is_active(&change_set.name).await? {
                        None
                    } else {
                        Some(SkipReason::NotActive)
                    }
                }
                Direction::Down => None,
            };

            match skip {
                Some(reason) => {
                    self.observers.change_set_skipped(&change_set, reason);
                    progress.skipped.push(change_set.name);
                }
                None => pending.push(change_set),
            }
        }

        Ok(pending)
    }

    /// Run one change-set and its ledger write in a single transaction
    async fn execute(&self, change_set: &ChangeSet) -> MigrationResult<()> {
        let mut tx = self
            .pool
            .begin_transaction()
            .await
            .map_err(|source| MigrationError::Transaction {
                name: change_set.name.clone(),
                source,
            })?;

        let outcome = self.execute_in(tx.as_mut(), change_set).await;
        match outcome {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|source| MigrationError::Transaction {
                    name: change_set.name.clone(),
                    source,
                }),
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    // The server discards the transaction with the connection
                    tracing::warn!(
                        change_set = %change_set.name,
                        error = %rollback_error,
                        "Rollback failed"
                    );
                }
                Err(error)
            }
        }
    }

    async fn execute_in(
        &self,
        tx: &mut dyn DatabaseTransaction,
        change_set: &ChangeSet,
    ) -> MigrationResult<()> {
        let name = change_set.name.as_str();

        // Checked before the body so an unmatched Down changes nothing
        if change_set.direction == Direction::Down && !self.ledger.is_active_in(tx, name).await? {
            return Err(MigrationError::NoActiveEntry {
                name: name.to_string(),
            });
        }

        if change_set.is_empty() {
            tracing::debug!(change_set = name, "Change-set body is empty");
        } else {
            tx.execute_script(&change_set.body)
                .await
                .map_err(|source| MigrationError::Execution {
                    name: name.to_string(),
                    source,
                })?;
        }

        match change_set.direction {
            Direction::Up => self.ledger.record_applied(tx, name).await,
            Direction::Down => self.ledger.record_reverted(tx, name).await,
        }
    }
}

fn build_status(change_sets: &[ChangeSet], entries: &[LedgerEntry]) -> StatusReport {
    let mut by_name: BTreeMap<&str, Vec<&LedgerEntry>> = BTreeMap::new();
    for entry in entries {
        by_name.entry(entry.name.as_str()).or_default().push(entry);
    }

    let statuses = change_sets
        .iter()
        .map(|change_set| {
            let history = by_name.get(change_set.name.as_str());
            let active_entry = history.and_then(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.is_active())
                    .max_by_key(|entry| (entry.applied_at, entry.id))
            });

            ChangeSetStatus {
                name: change_set.name.clone(),
                active: active_entry.is_some(),
                applied_at: active_entry.map(|entry| entry.applied_at),
                applications: history.map_or(0, |entries| entries.len()),
            }
        })
        .collect();

    let known: BTreeSet<&str> = change_sets.iter().map(|c| c.name.as_str()).collect();
    let orphaned = by_name
        .iter()
        .filter(|(name, history)| {
            !known.contains(*name) && history.iter().any(|entry| entry.is_active())
        })
        .map(|(name, _)| name.to_string())
        .collect();

    StatusReport {
        change_sets: statuses,
        orphaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn entry(id: i64, name: &str, reverted: bool) -> LedgerEntry {
        let applied_at = Utc::now() - Duration::minutes(10 - id);
        LedgerEntry {
            id,
            name: name.to_string(),
            applied_at,
            reverted_at: reverted.then(|| applied_at + Duration::seconds(30)),
        }
    }

    #[test]
    fn test_build_status() {
        let change_sets = vec![
            ChangeSet::new("001_a", Direction::Up, "CREATE TABLE a ();"),
            ChangeSet::new("002_b", Direction::Up, "CREATE TABLE b ();"),
            ChangeSet::new("003_c", Direction::Up, "CREATE TABLE c ();"),
        ];
        let entries = vec![
            entry(1, "001_a", true),
            entry(2, "001_a", false),
            entry(3, "002_b", true),
            entry(4, "000_gone", false),
            entry(5, "000_reverted_and_gone", true),
        ];

        let report = build_status(&change_sets, &entries);

        assert_eq!(report.change_sets.len(), 3);
        let a = &report.change_sets[0];
        assert!(a.active);
        assert_eq!(a.applications, 2);
        assert_eq!(a.applied_at, Some(entries[1].applied_at));

        let b = &report.change_sets[1];
        assert!(!b.active);
        assert_eq!(b.applications, 1);
        assert_eq!(b.applied_at, None);

        let c = &report.change_sets[2];
        assert!(!c.active);
        assert_eq!(c.applications, 0);

        let pending: Vec<_> = report.pending().map(|s| s.name.as_str()).collect();
        assert_eq!(pending, vec!["002_b", "003_c"]);
        assert_eq!(report.orphaned, vec!["000_gone".to_string()]);
    }
}
