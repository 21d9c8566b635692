//! # Structured Logging
//!
//! `tracing` subscriber setup with per-environment presets. The engine only
//! emits events; installing a subscriber is left to the binary that embeds
//! it.

use serde_json::{json, Value};
use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Environment;

/// Levels accepted by `LOG_LEVEL`
pub const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Logging configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn")
    pub level: String,
    /// Emit one JSON object per event instead of text
    pub json_format: bool,
    /// ANSI colors in text output
    pub use_colors: bool,
    /// Include file and line number information
    pub include_location: bool,
    /// Directive string overriding `level`, e.g. "elif_migrate=debug,sqlx=warn"
    pub env_filter: Option<String>,
    /// Fields attached to the initialization event
    pub global_fields: serde_json::Map<String, Value>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl LoggingConfig {
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
            use_colors: true,
            include_location: true,
            env_filter: Some("elif_migrate=debug,sqlx=warn".to_string()),
            global_fields: env_field("development"),
        }
    }

    pub fn staging() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            use_colors: true,
            include_location: false,
            env_filter: None,
            global_fields: env_field("staging"),
        }
    }

    pub fn production() -> Self {
        Self {
            level: "warn".to_string(),
            json_format: false,
            use_colors: false,
            include_location: false,
            env_filter: None,
            global_fields: env_field("production"),
        }
    }

    /// Minimal output for test runs
    pub fn test() -> Self {
        Self {
            level: "error".to_string(),
            json_format: false,
            use_colors: false,
            include_location: false,
            env_filter: Some("elif_migrate=error".to_string()),
            global_fields: env_field("test"),
        }
    }

    /// Preset matching `environment`
    pub fn for_environment(environment: &Environment) -> Self {
        match environment {
            Environment::Development => Self::development(),
            Environment::Staging => Self::staging(),
            Environment::Production => Self::production(),
        }
    }

    /// Replace the level; an explicit level also drops the preset's filter directives
    pub fn with_level<S: Into<String>>(mut self, level: S) -> Self {
        self.level = level.into();
        self.env_filter = None;
        self
    }

    pub fn with_colors(mut self, use_colors: bool) -> Self {
        self.use_colors = use_colors;
        self
    }

    pub fn with_json_format(mut self, json_format: bool) -> Self {
        self.json_format = json_format;
        self
    }

    /// Set environment filter
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Add a field to the initialization event
    pub fn with_global_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.global_fields.insert(key.into(), value.into());
        self
    }

    /// Whether `level` is one of `VALID_LEVELS`
    pub fn has_valid_level(&self) -> bool {
        VALID_LEVELS.contains(&self.level.as_str())
    }
}

fn env_field(env: &str) -> serde_json::Map<String, Value> {
    let mut fields = serde_json::Map::new();
    fields.insert("env".to_string(), json!(env));
    fields
}

/// Install a global subscriber for `config`.
///
/// `RUST_LOG` takes precedence over the configured level. Fails instead of
/// panicking when a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let directives = config.env_filter.as_deref().unwrap_or(&config.level);
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(directives))?;

    // stdout is reserved for command output
    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                Layer::new()
                    .with_writer(io::stderr)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .json(),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                Layer::new()
                    .with_writer(io::stderr)
                    .with_ansi(config.use_colors)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()?;
    }

    let init_fields = json!({
        "level": config.level,
        "json_format": config.json_format,
        "fields": config.global_fields,
    });
    tracing::debug!(target: "elif_migrate::logging", "Logging initialized {}", init_fields);

    Ok(())
}
