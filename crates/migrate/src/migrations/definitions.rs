//! Migration Definitions - Core types shared by the repository, the ledger and the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// File extension that marks a change-set artifact
pub const CHANGE_SET_EXTENSION: &str = "sql";

/// Which side of a change-set a definition belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Additive schema change
    Up,
    /// Inverse of the Up change-set with the same name
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// One migration definition read from storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// File stem; ascending byte order of names is execution order
    pub name: String,
    pub direction: Direction,
    /// Statement block executed verbatim
    pub body: String,
    /// Artifact the definition was read from
    pub path: PathBuf,
}

impl ChangeSet {
    pub fn new(name: impl Into<String>, direction: Direction, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction,
            body: body.into(),
            path: PathBuf::new(),
        }
    }

    /// Whether the body contains anything besides whitespace and `--` comments
    pub fn is_empty(&self) -> bool {
        self.body
            .lines()
            .map(str::trim)
            .all(|line| line.is_empty() || line.starts_with("--"))
    }
}

/// One row of the application ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    /// `None` while the change-set is active
    pub reverted_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn is_active(&self) -> bool {
        self.reverted_at.is_none()
    }
}

/// Configuration for the migration engine
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory holding Up change-sets
    pub up_dir: PathBuf,
    /// Directory holding Down change-sets
    pub down_dir: PathBuf,
    /// Table backing the ledger
    pub ledger_table: String,
    /// Hold a Postgres advisory lock for the duration of each run
    pub use_advisory_lock: bool,
    /// Skip Down change-sets whose Up is not active instead of failing
    pub skip_inactive_on_revert: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            up_dir: PathBuf::from("./migrations/up"),
            down_dir: PathBuf::from("./migrations/down"),
            ledger_table: "migrations".to_string(),
            use_advisory_lock: true,
            skip_inactive_on_revert: false,
        }
    }
}

impl MigrationConfig {
    /// Storage location for `direction`
    pub fn dir_for(&self, direction: Direction) -> &PathBuf {
        match direction {
            Direction::Up => &self.up_dir,
            Direction::Down => &self.down_dir,
        }
    }
}

/// Outcome of a successful apply or revert run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub direction: Direction,
    /// Committed change-sets, in execution order
    pub completed: Vec<String>,
    /// Change-sets left alone because the ledger already reflected them
    pub skipped: Vec<String>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn is_noop(&self) -> bool {
        self.completed.is_empty()
    }
}

/// Status of one Up change-set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSetStatus {
    pub name: String,
    pub active: bool,
    /// When the currently active entry was written
    pub applied_at: Option<DateTime<Utc>>,
    /// Number of ledger entries ever written for this name
    pub applications: usize,
}

/// Result of `MigrationEngine::status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub change_sets: Vec<ChangeSetStatus>,
    /// Active ledger names with no Up definition on disk
    pub orphaned: Vec<String>,
}

impl StatusReport {
    pub fn pending(&self) -> impl Iterator<Item = &ChangeSetStatus> {
        self.change_sets.iter().filter(|status| !status.active)
    }
}
