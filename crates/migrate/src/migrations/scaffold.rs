//! Change-set scaffolding
//!
//! Creates an empty Up/Down pair named `<timestamp>_<slug>` so the new
//! change-set sorts after every existing one. No SQL is generated.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::PathBuf;

use super::definitions::{Direction, MigrationConfig, CHANGE_SET_EXTENSION};
use crate::error::{MigrationError, MigrationResult};

/// Files written by `create_change_set`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaffoldedChangeSet {
    pub name: String,
    pub up_path: PathBuf,
    pub down_path: PathBuf,
}

/// Write an empty change-set pair for `name`, stamped with the current time
pub fn create_change_set(
    config: &MigrationConfig,
    name: &str,
) -> MigrationResult<ScaffoldedChangeSet> {
    create_change_set_at(config, name, Utc::now())
}

/// Same as `create_change_set` with an explicit timestamp
pub fn create_change_set_at(
    config: &MigrationConfig,
    name: &str,
    now: DateTime<Utc>,
) -> MigrationResult<ScaffoldedChangeSet> {
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(MigrationError::Scaffold(format!(
            "'{}' does not contain any letters or digits",
            name
        )));
    }

    let change_set_name = format!("{}_{}", now.format("%Y%m%d%H%M%S"), slug);
    let file_name = format!("{}.{}", change_set_name, CHANGE_SET_EXTENSION);
    let up_path = config.dir_for(Direction::Up).join(&file_name);
    let down_path = config.dir_for(Direction::Down).join(&file_name);

    // Refuse before writing anything so a clash never leaves half a pair
    for path in [&up_path, &down_path] {
        if path.exists() {
            return Err(MigrationError::Scaffold(format!(
                "{} already exists",
                path.display()
            )));
        }
    }

    for (direction, path) in [(Direction::Up, &up_path), (Direction::Down, &down_path)] {
        let dir = config.dir_for(direction);
        fs::create_dir_all(dir).map_err(|e| {
            MigrationError::Scaffold(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        fs::write(path, template(&change_set_name, name, direction, now)).map_err(|e| {
            MigrationError::Scaffold(format!("Failed to write {}: {}", path.display(), e))
        })?;
    }

    tracing::info!(change_set = %change_set_name, "Created change-set pair");

    Ok(ScaffoldedChangeSet {
        name: change_set_name,
        up_path,
        down_path,
    })
}

/// Lowercase ASCII alphanumerics separated by single underscores
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}

fn template(change_set_name: &str, name: &str, direction: Direction, now: DateTime<Utc>) -> String {
    let hint = match direction {
        Direction::Up => "-- Add your schema changes here",
        Direction::Down => "-- Undo the matching up change-set here",
    };
    format!(
        "-- Change-set: {}\n\
         -- Description: {}\n\
         -- Direction: {}\n\
         -- Created: {}\n\n\
         {}\n",
        change_set_name,
        name,
        direction,
        now.format("%Y-%m-%d %H:%M:%S UTC"),
        hint
    )
}
