//! In-Memory Backend
//!
//! A process-local implementation of the backend traits. It understands the
//! statements issued by the ledger and the advisory lock, records every other
//! script it is asked to run, and can be told to fail in the ways a real
//! server does. Transactions work on a private snapshot that replaces the
//! committed state on commit, so rollbacks leave no trace.
//!
//! Concurrent transactions are not isolated from each other: the last commit
//! wins. The engine never has more than one open at a time.
//!
//! `pg_advisory_lock` waits for the holding session to unlock or go away, as
//! the server does. A connection cap can be set to behave like a bounded
//! pool; running out of connections fails immediately where sqlx would wait
//! out its acquire timeout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};

use super::core::*;
use crate::error::{DatabaseError, DbResult};
use crate::migrations::LedgerEntry;

const UNDEFINED_TABLE: &str = "42P01";
const SYNTAX_ERROR: &str = "42601";

/// Committed (or staged) contents of the database
#[derive(Debug, Clone, Default)]
struct Snapshot {
    ledger_created: bool,
    entries: Vec<LedgerEntry>,
    scripts: Vec<String>,
    next_id: i64,
}

/// Failures to inject into subsequent operations
#[derive(Debug, Default)]
struct Faults {
    script_needles: Vec<String>,
    create_race_code: Option<String>,
    fail_next_begin: bool,
    fail_next_commit: bool,
}

/// Counters for assertions on transaction handling
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub locks_acquired: usize,
    pub locks_released: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    committed: Snapshot,
    faults: Faults,
    stats: MemoryStats,
    held_locks: HashSet<i64>,
}

/// In-memory database shared by every handle cloned from it
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
    ledger_table: String,
    lock_released: Arc<Notify>,
    connections: Option<Arc<Semaphore>>,
}

impl MemoryDatabase {
    /// Create an empty database whose ledger lives in the default `migrations` table
    pub fn new() -> Self {
        Self::with_ledger_table("migrations")
    }

    /// Create an empty database whose ledger lives in `table`
    pub fn with_ledger_table(table: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            ledger_table: table.into(),
            lock_released: Arc::new(Notify::new()),
            connections: None,
        }
    }

    /// Allow at most `max` connections to be checked out at once. Sessions
    /// and open transactions hold theirs until dropped.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.connections = Some(Arc::new(Semaphore::new(max as usize)));
        self
    }

    fn checkout(&self) -> DbResult<Option<OwnedSemaphorePermit>> {
        match &self.connections {
            Some(connections) => Arc::clone(connections)
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| {
                    DatabaseError::Connection(
                        "pool timed out while waiting for an open connection".to_string(),
                    )
                }),
            None => Ok(None),
        }
    }

    /// Make every script containing `needle` fail with a syntax error
    pub async fn fail_script_containing(&self, needle: impl Into<String>) {
        self.state.lock().await.faults.script_needles.push(needle.into());
    }

    /// Remove all script failures
    pub async fn clear_script_failures(&self) {
        self.state.lock().await.faults.script_needles.clear();
    }

    /// Make the next ledger `CREATE TABLE` lose a race with another session,
    /// failing with `code` after the table has been created by the "winner"
    pub async fn race_next_create(&self, code: impl Into<String>) {
        self.state.lock().await.faults.create_race_code = Some(code.into());
    }

    /// Make the next `begin_transaction` fail
    pub async fn fail_next_begin(&self) {
        self.state.lock().await.faults.fail_next_begin = true;
    }

    /// Make the next `commit` fail
    pub async fn fail_next_commit(&self) {
        self.state.lock().await.faults.fail_next_commit = true;
    }

    /// Committed scripts, in execution order
    pub async fn executed_scripts(&self) -> Vec<String> {
        self.state.lock().await.committed.scripts.clone()
    }

    /// Committed ledger rows, ordered by id
    pub async fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().await.committed.entries.clone()
    }

    /// Whether the ledger table exists
    pub async fn ledger_created(&self) -> bool {
        self.state.lock().await.committed.ledger_created
    }

    /// Transaction and lock counters
    pub async fn stats(&self) -> MemoryStats {
        self.state.lock().await.stats.clone()
    }

    /// Advisory lock keys currently held
    pub async fn held_locks(&self) -> Vec<i64> {
        let mut keys: Vec<i64> = self.state.lock().await.held_locks.iter().copied().collect();
        keys.sort_unstable();
        keys
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabasePool for MemoryDatabase {
    async fn acquire(&self) -> DbResult<Box<dyn DatabaseConnection>> {
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            ledger_table: self.ledger_table.clone(),
            session_locks: HashSet::new(),
            lock_released: Arc::clone(&self.lock_released),
            _slot: self.checkout()?,
        }))
    }

    async fn begin_transaction(&self) -> DbResult<Box<dyn DatabaseTransaction>> {
        let slot = self.checkout()?;
        let mut state = self.state.lock().await;
        if std::mem::take(&mut state.faults.fail_next_begin) {
            return Err(DatabaseError::Transaction(
                "could not begin transaction: connection reset".to_string(),
            ));
        }
        state.stats.begun += 1;

        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            ledger_table: self.ledger_table.clone(),
            staged: Some(state.committed.clone()),
            _slot: slot,
        }))
    }

    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> DbResult<u64> {
        let _slot = self.checkout()?;
        let mut state = self.state.lock().await;
        let MemoryState {
            committed, faults, ..
        } = &mut *state;
        let outcome = run_statement(committed, faults, &self.ledger_table, sql, params, false)?;
        Ok(outcome.rows_affected())
    }

    async fn fetch_all(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DbResult<Vec<Box<dyn DatabaseRow>>> {
        let _slot = self.checkout()?;
        let mut state = self.state.lock().await;
        let MemoryState {
            committed, faults, ..
        } = &mut *state;
        let outcome = run_statement(committed, faults, &self.ledger_table, sql, params, false)?;
        Ok(outcome.into_rows())
    }

    async fn fetch_optional(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DbResult<Option<Box<dyn DatabaseRow>>> {
        Ok(self.fetch_all(sql, params).await?.into_iter().next())
    }

    async fn close(&self) -> DbResult<()> {
        Ok(())
    }
}

/// Transaction over a private copy of the committed snapshot
pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    ledger_table: String,
    staged: Option<Snapshot>,
    _slot: Option<OwnedSemaphorePermit>,
}

impl MemoryTransaction {
    fn staged(&mut self) -> DbResult<&mut Snapshot> {
        self.staged
            .as_mut()
            .ok_or_else(|| DatabaseError::Transaction("Transaction already completed".to_string()))
    }

    async fn run(&mut self, sql: &str, params: &[DatabaseValue], script: bool) -> DbResult<Outcome> {
        let state = Arc::clone(&self.state);
        let mut state = state.lock().await;
        let table = self.ledger_table.clone();
        let staged = self.staged()?;
        run_statement(staged, &mut state.faults, &table, sql, params, script)
    }
}

#[async_trait]
impl DatabaseTransaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DbResult<u64> {
        Ok(self.run(sql, params, false).await?.rows_affected())
    }

    async fn execute_script(&mut self, sql: &str) -> DbResult<()> {
        self.run(sql, &[], true).await.map(|_| ())
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DbResult<Option<Box<dyn DatabaseRow>>> {
        Ok(self.run(sql, params, false).await?.into_rows().into_iter().next())
    }

    async fn commit(mut self: Box<Self>) -> DbResult<()> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| DatabaseError::Transaction("Transaction already completed".to_string()))?;
        let mut state = self.state.lock().await;

        if std::mem::take(&mut state.faults.fail_next_commit) {
            state.stats.rolled_back += 1;
            return Err(DatabaseError::Transaction(
                "Transaction commit failed: server closed the connection".to_string(),
            ));
        }

        state.committed = staged;
        state.stats.committed += 1;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> DbResult<()> {
        self.staged
            .take()
            .ok_or_else(|| DatabaseError::Transaction("Transaction already completed".to_string()))?;
        self.state.lock().await.stats.rolled_back += 1;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        // Dropped while still open: implicit rollback
        if self.staged.take().is_some() {
            if let Ok(mut state) = self.state.try_lock() {
                state.stats.rolled_back += 1;
            }
        }
    }
}

/// Dedicated session, used for advisory locks
pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    ledger_table: String,
    session_locks: HashSet<i64>,
    lock_released: Arc<Notify>,
    _slot: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl DatabaseConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DbResult<u64> {
        if let Some(key) = advisory_call(sql, "PG_ADVISORY_LOCK", params)? {
            let lock_released = Arc::clone(&self.lock_released);
            loop {
                // Registered before the check so a release in between is not missed
                let released = lock_released.notified();
                {
                    let mut state = self.state.lock().await;
                    if !state.held_locks.contains(&key) || self.session_locks.contains(&key) {
                        state.held_locks.insert(key);
                        state.stats.locks_acquired += 1;
                        self.session_locks.insert(key);
                        return Ok(1);
                    }
                }
                released.await;
            }
        }

        let mut state = self.state.lock().await;
        let MemoryState {
            committed, faults, ..
        } = &mut *state;
        let outcome = run_statement(committed, faults, &self.ledger_table, sql, params, false)?;
        Ok(outcome.rows_affected())
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DbResult<Option<Box<dyn DatabaseRow>>> {
        if let Some(key) = advisory_call(sql, "PG_ADVISORY_UNLOCK", params)? {
            let released = self.session_locks.remove(&key);
            let mut state = self.state.lock().await;
            if released {
                state.held_locks.remove(&key);
                state.stats.locks_released += 1;
                self.lock_released.notify_waiters();
            }
            return Ok(Some(Box::new(MemoryRow::new(vec![(
                "pg_advisory_unlock",
                DatabaseValue::Bool(released),
            )]))));
        }

        let mut state = self.state.lock().await;
        let MemoryState {
            committed, faults, ..
        } = &mut *state;
        let outcome = run_statement(committed, faults, &self.ledger_table, sql, params, false)?;
        Ok(outcome.into_rows().into_iter().next())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        // Session teardown releases session-level advisory locks
        if self.session_locks.is_empty() {
            return;
        }
        if let Ok(mut state) = self.state.try_lock() {
            for key in self.session_locks.drain() {
                state.held_locks.remove(&key);
            }
        }
        self.lock_released.notify_waiters();
    }
}

/// Result row built from name/value pairs
pub struct MemoryRow {
    columns: Vec<(String, DatabaseValue)>,
}

impl MemoryRow {
    fn new(columns: Vec<(&str, DatabaseValue)>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        }
    }
}

impl DatabaseRow for MemoryRow {
    fn get_by_index(&self, index: usize) -> DbResult<DatabaseValue> {
        self.columns
            .get(index)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| DatabaseError::Decode(format!("Column index {} out of range", index)))
    }

    fn get_by_name(&self, name: &str) -> DbResult<DatabaseValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| DatabaseError::Decode(format!("Column '{}' not found", name)))
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }
}

enum Outcome {
    Affected(u64),
    Rows(Vec<MemoryRow>),
}

impl Outcome {
    fn rows_affected(&self) -> u64 {
        match self {
            Outcome::Affected(n) => *n,
            Outcome::Rows(rows) => rows.len() as u64,
        }
    }

    fn into_rows(self) -> Vec<Box<dyn DatabaseRow>> {
        match self {
            Outcome::Affected(_) => Vec::new(),
            Outcome::Rows(rows) => rows
                .into_iter()
                .map(|row| Box::new(row) as Box<dyn DatabaseRow>)
                .collect(),
        }
    }
}

/// Interpret one statement against `snapshot`
fn run_statement(
    snapshot: &mut Snapshot,
    faults: &mut Faults,
    ledger_table: &str,
    sql: &str,
    params: &[DatabaseValue],
    script: bool,
) -> DbResult<Outcome> {
    let upper = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    let on_ledger = mentions(&upper, &ledger_table.to_uppercase());

    if !script && on_ledger {
        if upper.starts_with("CREATE TABLE IF NOT EXISTS") {
            snapshot.ledger_created = true;
            if let Some(code) = faults.create_race_code.take() {
                return Err(DatabaseError::query_with_code(
                    format!("relation \"{}\" already exists", ledger_table),
                    code,
                ));
            }
            return Ok(Outcome::Affected(0));
        }

        require_ledger(snapshot, ledger_table)?;

        if upper.starts_with("CREATE INDEX IF NOT EXISTS") {
            return Ok(Outcome::Affected(0));
        }
        if upper.starts_with("SELECT EXISTS") {
            let name = string_param(params, 0)?;
            let active = snapshot
                .entries
                .iter()
                .any(|entry| entry.name == name && entry.reverted_at.is_none());
            return Ok(Outcome::Rows(vec![MemoryRow::new(vec![(
                "active",
                DatabaseValue::Bool(active),
            )])]));
        }
        if upper.starts_with("INSERT INTO") {
            let name = string_param(params, 0)?;
            let applied_at = datetime_param(params, 1)?;
            snapshot.next_id += 1;
            snapshot.entries.push(LedgerEntry {
                id: snapshot.next_id,
                name: name.to_string(),
                applied_at,
                reverted_at: None,
            });
            return Ok(Outcome::Affected(1));
        }
        if upper.starts_with("UPDATE") {
            let name = string_param(params, 0)?;
            let reverted_at = datetime_param(params, 1)?;
            let latest = snapshot
                .entries
                .iter_mut()
                .filter(|entry| entry.name == name && entry.reverted_at.is_none())
                .max_by_key(|entry| (entry.applied_at, entry.id));
            return Ok(match latest {
                Some(entry) => {
                    entry.reverted_at = Some(reverted_at);
                    Outcome::Affected(1)
                }
                None => Outcome::Affected(0),
            });
        }
        if upper.starts_with("SELECT") {
            let mut entries = snapshot.entries.clone();
            entries.sort_by_key(|entry| entry.id);
            return Ok(Outcome::Rows(entries.into_iter().map(entry_row).collect()));
        }

        return Err(DatabaseError::query_with_code(
            format!("unsupported ledger statement: {}", sql),
            SYNTAX_ERROR,
        ));
    }

    if let Some(needle) = faults.script_needles.iter().find(|n| sql.contains(n.as_str())) {
        return Err(DatabaseError::query_with_code(
            format!("syntax error at or near \"{}\"", needle),
            SYNTAX_ERROR,
        ));
    }

    snapshot.scripts.push(sql.to_string());
    Ok(Outcome::Affected(0))
}

fn mentions(upper_sql: &str, upper_table: &str) -> bool {
    let relation = upper_table.rsplit('.').next().unwrap_or(upper_table);
    upper_sql
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|token| token == relation)
}

fn require_ledger(snapshot: &Snapshot, ledger_table: &str) -> DbResult<()> {
    if snapshot.ledger_created {
        Ok(())
    } else {
        Err(DatabaseError::query_with_code(
            format!("relation \"{}\" does not exist", ledger_table),
            UNDEFINED_TABLE,
        ))
    }
}

fn entry_row(entry: LedgerEntry) -> MemoryRow {
    MemoryRow::new(vec![
        ("id", DatabaseValue::Int64(entry.id)),
        ("name", DatabaseValue::String(entry.name)),
        ("applied_at", DatabaseValue::DateTime(entry.applied_at)),
        ("reverted_at", DatabaseValue::from(entry.reverted_at)),
    ])
}

fn advisory_call(sql: &str, function: &str, params: &[DatabaseValue]) -> DbResult<Option<i64>> {
    let upper = sql.to_uppercase();
    if !upper.contains(&format!("{}(", function)) {
        return Ok(None);
    }
    match params.first() {
        Some(DatabaseValue::Int64(key)) => Ok(Some(*key)),
        Some(DatabaseValue::Int32(key)) => Ok(Some(*key as i64)),
        other => Err(DatabaseError::query(format!(
            "{} expects a bigint key, got {:?}",
            function.to_lowercase(),
            other
        ))),
    }
}

fn string_param(params: &[DatabaseValue], index: usize) -> DbResult<&str> {
    params
        .get(index)
        .and_then(DatabaseValue::as_str)
        .ok_or_else(|| DatabaseError::query(format!("missing text parameter ${}", index + 1)))
}

fn datetime_param(params: &[DatabaseValue], index: usize) -> DbResult<DateTime<Utc>> {
    match params.get(index) {
        Some(DatabaseValue::DateTime(dt)) => Ok(*dt),
        _ => Err(DatabaseError::query(format!(
            "missing timestamp parameter ${}",
            index + 1
        ))),
    }
}
