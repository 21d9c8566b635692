//! Integration tests for the migration engine
//!
//! Runs apply, revert and status end to end against change-set directories
//! on disk and the in-memory backend.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use elif_migrate::{
    lock_key, ChangeSet, Direction, MemoryDatabase, MigrationConfig, MigrationEngine,
    MigrationError, MigrationLock, MigrationObserver, RunError, RunReport, SkipReason,
    LOCKED_RUN_CONNECTIONS,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Records hook invocations as short strings
#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl MigrationObserver for RecordingObserver {
    fn run_started(&self, direction: Direction, pending: usize) {
        self.push(format!("run_started:{}:{}", direction, pending));
    }

    fn change_set_skipped(&self, change_set: &ChangeSet, reason: SkipReason) {
        self.push(format!("skipped:{}:{}", change_set.name, reason.as_str()));
    }

    fn change_set_started(&self, change_set: &ChangeSet) {
        self.push(format!("started:{}", change_set.name));
    }

    fn change_set_committed(&self, change_set: &ChangeSet, _elapsed: Duration) {
        self.push(format!("committed:{}", change_set.name));
    }

    fn change_set_failed(&self, change_set: &ChangeSet, _error: &MigrationError) {
        self.push(format!("failed:{}", change_set.name));
    }

    fn run_finished(&self, report: &RunReport) {
        self.push(format!("run_finished:{}", report.completed.len()));
    }

    fn run_failed(&self, error: &RunError) {
        self.push(format!("run_failed:{}", error.completed.len()));
    }
}

struct Fixture {
    _temp_dir: TempDir,
    config: MigrationConfig,
    db: MemoryDatabase,
    observer: Arc<RecordingObserver>,
}

impl Fixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = MigrationConfig {
            up_dir: temp_dir.path().join("up"),
            down_dir: temp_dir.path().join("down"),
            ..MigrationConfig::default()
        };
        fs::create_dir_all(&config.up_dir).unwrap();
        fs::create_dir_all(&config.down_dir).unwrap();

        Self {
            _temp_dir: temp_dir,
            config,
            db: MemoryDatabase::new(),
            observer: Arc::new(RecordingObserver::default()),
        }
    }

    fn up(&self, name: &str, body: &str) -> &Self {
        fs::write(self.config.up_dir.join(format!("{}.sql", name)), body).unwrap();
        self
    }

    fn down(&self, name: &str, body: &str) -> &Self {
        fs::write(self.config.down_dir.join(format!("{}.sql", name)), body).unwrap();
        self
    }

    fn engine(&self) -> MigrationEngine {
        self.engine_with(self.config.clone())
    }

    fn engine_with(&self, config: MigrationConfig) -> MigrationEngine {
        MigrationEngine::new(Arc::new(self.db.clone()), config)
            .without_observers()
            .with_observer(self.observer.clone())
    }

    async fn active_names(&self) -> Vec<String> {
        self.db
            .ledger_entries()
            .await
            .into_iter()
            .filter(|entry| entry.is_active())
            .map(|entry| entry.name)
            .collect()
    }
}

#[tokio::test]
async fn test_end_to_end_apply_then_noop() {
    let fixture = Fixture::new();
    fixture
        .up("001_create_users", "CREATE TABLE users (id BIGSERIAL PRIMARY KEY, email TEXT);")
        .up("002_add_index", "CREATE INDEX users_email_idx ON users (email);");

    let engine = fixture.engine();

    let first = engine.apply().await.unwrap();
    assert_eq!(first.direction, Direction::Up);
    assert_eq!(first.completed, vec!["001_create_users", "002_add_index"]);
    assert!(first.skipped.is_empty());
    assert_eq!(fixture.active_names().await, vec!["001_create_users", "002_add_index"]);

    let second = engine.apply().await.unwrap();
    assert!(second.is_noop());
    assert_eq!(second.skipped, vec!["001_create_users", "002_add_index"]);
    assert_eq!(fixture.db.ledger_entries().await.len(), 2);
    assert_eq!(fixture.db.executed_scripts().await.len(), 2);
}

#[tokio::test]
async fn test_apply_orders_by_name_not_discovery() {
    let fixture = Fixture::new();
    fixture
        .up("010_c", "CREATE TABLE c ();")
        .up("001_a", "CREATE TABLE a ();")
        .up("002_b", "CREATE TABLE b ();");

    let report = fixture.engine().apply().await.unwrap();

    assert_eq!(report.completed, vec!["001_a", "002_b", "010_c"]);
    assert_eq!(
        fixture.db.executed_scripts().await,
        vec!["CREATE TABLE a ();", "CREATE TABLE b ();", "CREATE TABLE c ();"]
    );
    assert_eq!(
        fixture.observer.events(),
        vec![
            "run_started:up:3",
            "started:001_a",
            "committed:001_a",
            "started:002_b",
            "committed:002_b",
            "started:010_c",
            "committed:010_c",
            "run_finished:3",
        ]
    );
}

#[tokio::test]
async fn test_failure_stops_run_and_keeps_earlier_commits() {
    let fixture = Fixture::new();
    fixture
        .up("001_a", "CREATE TABLE a ();")
        .up("002_b", "CREATE TABLE b (BROKEN);")
        .up("003_c", "CREATE TABLE c ();");
    fixture.db.fail_script_containing("BROKEN").await;

    let err = fixture.engine().apply().await.unwrap_err();

    assert_eq!(err.direction, Direction::Up);
    assert_eq!(err.completed, vec!["001_a"]);
    match &err.error {
        MigrationError::Execution { name, source } => {
            assert_eq!(name, "002_b");
            assert_eq!(source.code(), Some("42601"));
        }
        other => panic!("Expected execution error, got {:?}", other),
    }

    // 002_b is neither recorded nor executed, 003_c never started
    assert_eq!(fixture.active_names().await, vec!["001_a"]);
    assert_eq!(fixture.db.executed_scripts().await, vec!["CREATE TABLE a ();"]);
    assert!(!fixture.observer.events().contains(&"started:003_c".to_string()));
    assert!(fixture.observer.events().contains(&"failed:002_b".to_string()));
    assert_eq!(fixture.observer.events().last().unwrap(), "run_failed:1");

    let stats = fixture.db.stats().await;
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.rolled_back, 1);

    // Once repaired, the run resumes where it stopped
    fixture.db.clear_script_failures().await;
    let report = fixture.engine().apply().await.unwrap();
    assert_eq!(report.completed, vec!["002_b", "003_c"]);
    assert_eq!(report.skipped, vec!["001_a"]);
}

#[tokio::test]
async fn test_revert_without_active_entry_changes_nothing() {
    let fixture = Fixture::new();
    fixture.down("001_a", "DROP TABLE a;");

    let err = fixture.engine().revert().await.unwrap_err();

    assert_eq!(err.direction, Direction::Down);
    assert!(err.completed.is_empty());
    assert!(matches!(
        err.error,
        MigrationError::NoActiveEntry { ref name } if name == "001_a"
    ));
    assert!(fixture.db.executed_scripts().await.is_empty());
    assert!(fixture.db.ledger_entries().await.is_empty());
}

#[tokio::test]
async fn test_reapply_after_revert_appends_history() {
    let fixture = Fixture::new();
    fixture
        .up("001_a", "CREATE TABLE a ();")
        .down("001_a", "DROP TABLE a;");
    let engine = fixture.engine();

    engine.apply().await.unwrap();
    let reverted = engine.revert().await.unwrap();
    assert_eq!(reverted.direction, Direction::Down);
    assert_eq!(reverted.completed, vec!["001_a"]);
    assert!(fixture.active_names().await.is_empty());

    engine.apply().await.unwrap();

    let entries = fixture.db.ledger_entries().await;
    assert_eq!(entries.len(), 2);
    assert_ne!(entries[0].id, entries[1].id);
    assert!(entries[0].reverted_at.is_some());
    assert!(entries[0].reverted_at.unwrap() >= entries[0].applied_at);
    assert!(entries[1].is_active());

    let status = engine.status().await.unwrap();
    assert_eq!(status.change_sets.len(), 1);
    assert!(status.change_sets[0].active);
    assert_eq!(status.change_sets[0].applications, 2);
    assert_eq!(status.change_sets[0].applied_at, Some(entries[1].applied_at));
}

#[tokio::test]
async fn test_revert_runs_in_ascending_order() {
    let fixture = Fixture::new();
    fixture
        .up("001_a", "CREATE TABLE a ();")
        .up("002_b", "CREATE TABLE b ();")
        .down("001_a", "DROP TABLE a;")
        .down("002_b", "DROP TABLE b;");
    let engine = fixture.engine();

    engine.apply().await.unwrap();
    let report = engine.revert().await.unwrap();

    assert_eq!(report.completed, vec!["001_a", "002_b"]);
    let scripts = fixture.db.executed_scripts().await;
    assert_eq!(&scripts[2..], &["DROP TABLE a;", "DROP TABLE b;"]);
}

#[tokio::test]
async fn test_revert_stops_at_first_inactive_entry() {
    let fixture = Fixture::new();
    fixture
        .up("001_a", "CREATE TABLE a ();")
        .down("001_a", "DROP TABLE a;")
        .down("002_b", "DROP TABLE b;")
        .down("003_c", "DROP TABLE c;");
    let engine = fixture.engine();
    engine.apply().await.unwrap();

    let err = engine.revert().await.unwrap_err();
    assert_eq!(err.completed, vec!["001_a"]);
    assert_eq!(err.error.change_set(), Some("002_b"));
    assert!(!fixture
        .db
        .executed_scripts()
        .await
        .contains(&"DROP TABLE c;".to_string()));
}

#[tokio::test]
async fn test_revert_can_skip_inactive_entries() {
    let fixture = Fixture::new();
    fixture
        .up("002_b", "CREATE TABLE b ();")
        .down("001_a", "DROP TABLE a;")
        .down("002_b", "DROP TABLE b;");

    let config = MigrationConfig {
        skip_inactive_on_revert: true,
        ..fixture.config.clone()
    };
    let engine = fixture.engine_with(config);
    engine.apply().await.unwrap();

    let report = engine.revert().await.unwrap();
    assert_eq!(report.completed, vec!["002_b"]);
    assert_eq!(report.skipped, vec!["001_a"]);
    assert!(fixture
        .observer
        .events()
        .contains(&"skipped:001_a:not active".to_string()));
}

#[tokio::test]
async fn test_cancellation_between_change_sets() {
    let fixture = Fixture::new();
    fixture
        .up("001_a", "CREATE TABLE a ();")
        .up("002_b", "CREATE TABLE b ();");

    let token = CancellationToken::new();

    /// Cancels the run as soon as the first change-set commits
    struct CancelAfterFirst(CancellationToken);
    impl MigrationObserver for CancelAfterFirst {
        fn change_set_committed(&self, _change_set: &ChangeSet, _elapsed: Duration) {
            self.0.cancel();
        }
    }

    let engine = fixture
        .engine()
        .with_observer(Arc::new(CancelAfterFirst(token.clone())))
        .with_cancellation(token);

    let err = engine.apply().await.unwrap_err();
    assert_eq!(err.completed, vec!["001_a"]);
    assert!(matches!(
        err.error,
        MigrationError::Cancelled { ref next } if next == "002_b"
    ));
    assert_eq!(fixture.active_names().await, vec!["001_a"]);
}

#[tokio::test]
async fn test_empty_body_is_recorded_without_executing() {
    let fixture = Fixture::new();
    fixture.up("001_placeholder", "-- nothing to do yet\n");

    let report = fixture.engine().apply().await.unwrap();
    assert_eq!(report.completed, vec!["001_placeholder"]);
    assert!(fixture.db.executed_scripts().await.is_empty());
    assert_eq!(fixture.active_names().await, vec!["001_placeholder"]);
}

#[tokio::test]
async fn test_transaction_failures() {
    let fixture = Fixture::new();
    fixture.up("001_a", "CREATE TABLE a ();");

    fixture.db.fail_next_begin().await;
    let err = fixture.engine().apply().await.unwrap_err();
    assert!(matches!(
        err.error,
        MigrationError::Transaction { ref name, .. } if name == "001_a"
    ));

    fixture.db.fail_next_commit().await;
    let err = fixture.engine().apply().await.unwrap_err();
    assert!(matches!(err.error, MigrationError::Transaction { .. }));
    assert!(err.completed.is_empty());
    assert!(fixture.active_names().await.is_empty());
    assert!(fixture.db.executed_scripts().await.is_empty());

    let report = fixture.engine().apply().await.unwrap();
    assert_eq!(report.completed, vec!["001_a"]);
}

#[tokio::test]
async fn test_missing_directory_is_discovery_error() {
    let fixture = Fixture::new();
    let config = MigrationConfig {
        up_dir: fixture.config.up_dir.join("missing"),
        ..fixture.config.clone()
    };

    let err = fixture.engine_with(config).apply().await.unwrap_err();
    assert!(matches!(err.error, MigrationError::Discovery { .. }));
    // The lock is released even when the run fails
    assert!(fixture.db.held_locks().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_schema_creation_is_tolerated() {
    let fixture = Fixture::new();
    fixture.up("001_a", "CREATE TABLE a ();");
    fixture.db.race_next_create("42P07").await;

    let report = fixture.engine().apply().await.unwrap();
    assert_eq!(report.completed, vec!["001_a"]);
}

#[tokio::test]
async fn test_advisory_lock_serialises_runs() {
    let fixture = Fixture::new();
    fixture.up("001_a", "CREATE TABLE a ();");
    let engine = fixture.engine();

    // Another process holds the lock for this ledger table
    let key = lock_key(&fixture.config.ledger_table);
    let held = MigrationLock::acquire(&fixture.db, key).await.unwrap();

    let run = engine.apply();
    tokio::pin!(run);
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut run)
        .await
        .is_err());
    assert!(fixture.db.executed_scripts().await.is_empty());

    held.release().await;
    let report = run.await.unwrap();
    assert_eq!(report.completed, vec!["001_a"]);

    let stats = fixture.db.stats().await;
    assert_eq!(stats.locks_acquired, 2);
    assert_eq!(stats.locks_released, 2);
    assert!(fixture.db.held_locks().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_runs_apply_each_change_set_once() {
    let fixture = Fixture::new();
    fixture
        .up("001_a", "CREATE TABLE a ();")
        .up("002_b", "CREATE TABLE b ();");
    let first = fixture.engine();
    let second = fixture.engine();

    let (first, second) = tokio::join!(first.apply(), second.apply());
    let (first, second) = (first.unwrap(), second.unwrap());

    let mut completed = [first.completed.len(), second.completed.len()];
    completed.sort_unstable();
    assert_eq!(completed, [0, 2]);
    assert_eq!(first.skipped.len() + second.skipped.len(), 2);
    assert_eq!(fixture.db.executed_scripts().await.len(), 2);
    assert_eq!(fixture.active_names().await, vec!["001_a", "002_b"]);
}

#[tokio::test]
async fn test_cancellation_while_waiting_for_lock() {
    let fixture = Fixture::new();
    fixture.up("001_a", "CREATE TABLE a ();");
    let token = CancellationToken::new();
    let engine = fixture.engine().with_cancellation(token.clone());

    let key = lock_key(&fixture.config.ledger_table);
    let held = MigrationLock::acquire(&fixture.db, key).await.unwrap();

    let (result, _) = tokio::join!(engine.apply(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let err = result.unwrap_err();
    assert!(matches!(err.error, MigrationError::LockCancelled));
    assert!(err.completed.is_empty());
    assert!(fixture.db.executed_scripts().await.is_empty());
    assert!(!fixture.db.ledger_created().await);
    assert_eq!(fixture.db.held_locks().await, vec![key]);

    held.release().await;
    assert!(fixture.db.held_locks().await.is_empty());
}

#[tokio::test]
async fn test_locked_run_fits_minimum_pool() {
    let fixture = Fixture {
        db: MemoryDatabase::new().with_max_connections(LOCKED_RUN_CONNECTIONS),
        ..Fixture::new()
    };
    fixture.up("001_a", "CREATE TABLE a ();");
    fixture.down("001_a", "DROP TABLE a;");

    let report = fixture.engine().apply().await.unwrap();
    assert_eq!(report.completed, vec!["001_a"]);
    let report = fixture.engine().revert().await.unwrap();
    assert_eq!(report.completed, vec!["001_a"]);
    assert!(!fixture.engine().status().await.unwrap().change_sets[0].active);

    // One fewer and the lock session starves the rest of the run
    let starved = Fixture {
        db: MemoryDatabase::new().with_max_connections(LOCKED_RUN_CONNECTIONS - 1),
        ..Fixture::new()
    };
    starved.up("001_a", "CREATE TABLE a ();");
    let err = starved.engine().apply().await.unwrap_err();
    assert!(matches!(err.error, MigrationError::Ledger(_)));
    assert!(starved.db.held_locks().await.is_empty());
}

#[tokio::test]
async fn test_without_advisory_lock() {
    let fixture = Fixture::new();
    fixture.up("001_a", "CREATE TABLE a ();");
    let config = MigrationConfig {
        use_advisory_lock: false,
        ..fixture.config.clone()
    };

    fixture.engine_with(config).apply().await.unwrap();
    assert_eq!(fixture.db.stats().await.locks_acquired, 0);
}

#[tokio::test]
async fn test_status_before_and_after_apply() {
    let fixture = Fixture::new();
    fixture
        .up("001_a", "CREATE TABLE a ();")
        .up("002_b", "CREATE TABLE b ();");
    let engine = fixture.engine();

    // No ledger table yet: everything pending, nothing created
    let status = engine.status().await.unwrap();
    assert_eq!(status.pending().count(), 2);
    assert!(!fixture.db.ledger_created().await);

    engine.apply().await.unwrap();
    fs::remove_file(fixture.config.up_dir.join("002_b.sql")).unwrap();

    let status = engine.status().await.unwrap();
    assert_eq!(status.change_sets.len(), 1);
    assert_eq!(status.pending().count(), 0);
    assert_eq!(status.orphaned, vec!["002_b"]);
}

#[tokio::test]
async fn test_custom_ledger_table() {
    let fixture = Fixture::new();
    fixture.up("001_a", "CREATE TABLE a ();");
    let db = MemoryDatabase::with_ledger_table("ops.schema_changes");
    let config = MigrationConfig {
        ledger_table: "ops.schema_changes".to_string(),
        ..fixture.config.clone()
    };

    let engine = MigrationEngine::new(Arc::new(db.clone()), config).without_observers();
    assert_eq!(engine.ledger().table(), "ops.schema_changes");

    engine.apply().await.unwrap();
    assert_eq!(db.ledger_entries().await.len(), 1);
}
