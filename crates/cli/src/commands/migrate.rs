use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use elif_migrate::{
    create_change_set, DatabasePool, Direction, MigrationEngine, MigratorConfig, PostgresBackend,
    RunError, RunReport, StatusReport,
};

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    Text,
    Json,
}

pub async fn up(config: &MigratorConfig, token: CancellationToken, output: Output) -> Result<()> {
    let pool = connect(config).await?;
    let engine =
        MigrationEngine::new(pool.clone(), config.migrations.clone()).with_cancellation(token);

    let result = engine.apply().await;
    pool.close().await.ok();
    print_run(result, output)
}

pub async fn down(config: &MigratorConfig, token: CancellationToken, output: Output) -> Result<()> {
    let pool = connect(config).await?;
    let engine =
        MigrationEngine::new(pool.clone(), config.migrations.clone()).with_cancellation(token);

    let result = engine.revert().await;
    pool.close().await.ok();
    print_run(result, output)
}

pub async fn status(config: &MigratorConfig, output: Output) -> Result<()> {
    let pool = connect(config).await?;
    let engine = MigrationEngine::new(pool.clone(), config.migrations.clone());

    let report = engine.status().await;
    pool.close().await.ok();
    print_status(&report?, output)
}

pub fn create(config: &MigratorConfig, name: &str) -> Result<()> {
    let created = create_change_set(&config.migrations, name)?;

    println!("Created change-set: {}", created.name);
    println!("   up:   {}", created.up_path.display());
    println!("   down: {}", created.down_path.display());
    Ok(())
}

async fn connect(config: &MigratorConfig) -> Result<Arc<dyn DatabasePool>> {
    let url = config.database.connection_url()?;
    let redacted = config.database.redacted_url();
    tracing::debug!(database = %redacted, "Connecting");

    PostgresBackend::new()
        .create_pool(&url, config.database.pool_config())
        .await
        .with_context(|| format!("Failed to connect to {}", redacted))
}

fn print_run(result: Result<RunReport, RunError>, output: Output) -> Result<()> {
    match result {
        Ok(report) => {
            match output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                Output::Text => {
                    let verb = past_tense(&report);
                    if report.is_noop() {
                        println!("Nothing to do ({} change-set(s) skipped)", report.skipped.len());
                    } else {
                        for name in &report.completed {
                            println!("   {} {}", verb, name);
                        }
                        println!(
                            "{} {} change-set(s) in {:.2}s",
                            capitalize(verb),
                            report.completed_count(),
                            report.elapsed.as_secs_f64()
                        );
                    }
                }
            }
            Ok(())
        }
        Err(err) => {
            if !err.completed.is_empty() {
                eprintln!("Committed before the failure:");
                for name in &err.completed {
                    eprintln!("   {}", name);
                }
            }
            Err(err.into())
        }
    }
}

fn print_status(report: &StatusReport, output: Output) -> Result<()> {
    if output == Output::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if report.change_sets.is_empty() {
        println!("No change-sets found");
    } else {
        let width = report
            .change_sets
            .iter()
            .map(|status| status.name.len())
            .max()
            .unwrap_or(0)
            .max("Change-set".len());

        println!("{:<width$}  {:<8}  Applied at", "Change-set", "Status", width = width);
        for status in &report.change_sets {
            let state = if status.active { "applied" } else { "pending" };
            let applied_at = status
                .applied_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{:<width$}  {:<8}  {}", status.name, state, applied_at, width = width);
        }
        println!("{} pending", report.pending().count());
    }

    if !report.orphaned.is_empty() {
        println!("Applied but missing on disk:");
        for name in &report.orphaned {
            println!("   {}", name);
        }
    }
    Ok(())
}

fn past_tense(report: &RunReport) -> &'static str {
    match report.direction {
        Direction::Up => "applied",
        Direction::Down => "reverted",
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
