//! Change-set Repository - Reads migration definitions from storage
//!
//! Enumeration order of the underlying storage is unspecified, so every
//! implementation must hand back change-sets sorted by name.

use std::fs;
use std::path::{Path, PathBuf};

use super::definitions::{ChangeSet, Direction, MigrationConfig, CHANGE_SET_EXTENSION};
use crate::error::{MigrationError, MigrationResult};

/// Source of change-set definitions
pub trait ChangeSetRepository: Send + Sync {
    /// All change-sets of `direction`, ascending by name
    fn list(&self, direction: Direction) -> MigrationResult<Vec<ChangeSet>>;
}

/// Repository backed by one directory per direction
#[derive(Debug, Clone)]
pub struct DirectoryRepository {
    up_dir: PathBuf,
    down_dir: PathBuf,
}

impl DirectoryRepository {
    pub fn new(up_dir: impl Into<PathBuf>, down_dir: impl Into<PathBuf>) -> Self {
        Self {
            up_dir: up_dir.into(),
            down_dir: down_dir.into(),
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.up_dir.clone(), config.down_dir.clone())
    }

    fn dir(&self, direction: Direction) -> &Path {
        match direction {
            Direction::Up => &self.up_dir,
            Direction::Down => &self.down_dir,
        }
    }

    fn read_change_set(&self, path: &Path, direction: Direction) -> MigrationResult<ChangeSet> {
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| MigrationError::discovery(path, "file name is not valid UTF-8"))?
            .to_string();

        let body = fs::read_to_string(path)
            .map_err(|e| MigrationError::discovery(path, format!("failed to read file: {}", e)))?;

        Ok(ChangeSet {
            name,
            direction,
            body,
            path: path.to_path_buf(),
        })
    }
}

impl ChangeSetRepository for DirectoryRepository {
    fn list(&self, direction: Direction) -> MigrationResult<Vec<ChangeSet>> {
        let dir = self.dir(direction);
        let entries = fs::read_dir(dir).map_err(|e| {
            MigrationError::discovery(dir, format!("failed to read migrations directory: {}", e))
        })?;

        let mut change_sets = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                MigrationError::discovery(dir, format!("failed to read directory entry: {}", e))
            })?;

            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().map_or(true, |ext| ext != CHANGE_SET_EXTENSION) {
                tracing::trace!(path = %path.display(), "Ignoring non change-set file");
                continue;
            }

            change_sets.push(self.read_change_set(&path, direction)?);
        }

        change_sets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(change_sets)
    }
}
