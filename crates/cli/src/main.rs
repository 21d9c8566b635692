mod commands;

use anyhow::Result;
use clap::{ArgGroup, Parser};
use elif_migrate::{init_logging, MigratorConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use commands::migrate::{self, Output};

#[derive(Parser, Debug)]
#[command(name = "elif-migrate")]
#[command(version, about = "Apply and revert versioned SQL change-sets")]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["up", "down", "status", "create"])
))]
struct Cli {
    /// Apply every Up change-set that is not active
    #[arg(long)]
    up: bool,

    /// Run the Down change-sets, closing their ledger entries
    #[arg(long)]
    down: bool,

    /// Show which change-sets are applied
    #[arg(long)]
    status: bool,

    /// Create an empty up/down change-set pair
    #[arg(long, value_name = "NAME")]
    create: Option<String>,

    /// Env file to read instead of ./env.<APP_ENV>
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Action {
    Up,
    Down,
    Status,
    Create(String),
}

impl Cli {
    fn action(&self) -> Action {
        if self.up {
            Action::Up
        } else if self.down {
            Action::Down
        } else if let Some(name) = &self.create {
            Action::Create(name.clone())
        } else {
            Action::Status
        }
    }

    fn output(&self) -> Output {
        if self.json {
            Output::Json
        } else {
            Output::Text
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_file = match &cli.env_file {
        Some(path) => path.clone(),
        None => MigratorConfig::environment_from_env()?.env_file(),
    };
    let config = MigratorConfig::from_env_file(&env_file)?;
    init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))?;

    // Logging is not up while the env file is read
    if config.env_file.is_none() {
        tracing::warn!(
            path = %env_file.display(),
            "No env file found, using environment variables and defaults"
        );
    }
    tracing::debug!(environment = %config.environment, "Configuration loaded");

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current change-set");
            signal_token.cancel();
        }
    });

    match cli.action() {
        Action::Up => migrate::up(&config, token, cli.output()).await,
        Action::Down => migrate::down(&config, token, cli.output()).await,
        Action::Status => migrate::status(&config, cli.output()).await,
        Action::Create(name) => migrate::create(&config, &name),
    }
}
