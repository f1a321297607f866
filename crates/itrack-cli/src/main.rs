use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use itrack_storage::PgStore;
use itrack_sync::{LogReminderSender, SyncConfig};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "itrack-cli")]
#[command(about = "AI/ML internship tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once and print the run summary.
    Sync,
    /// Ingest a curated CSV file through the same pipeline.
    ImportCsv { path: PathBuf },
    /// Apply database migrations (requires DATABASE_URL).
    Migrate,
    /// Serve the REST API.
    Serve {
        /// Also run the cron scheduler in this process.
        #[arg(long)]
        with_scheduler: bool,
    },
    /// Run the cron scheduler until ctrl-c.
    Schedule,
    /// Send deadline reminders once.
    Remind,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let store = itrack_storage::open_store_from_env().await?;
            let summary = itrack_sync::run_sync_once_from_env(store).await?;
            print_json(&summary)?;
        }
        Commands::ImportCsv { path } => {
            let store = itrack_storage::open_store_from_env().await?;
            let pipeline = itrack_sync::pipeline_from_env(store)?;
            let summary = pipeline
                .import_csv(&path)
                .await
                .with_context(|| format!("importing {}", path.display()))?;
            print_json(&summary)?;
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set to migrate")?;
            let store = PgStore::connect(&url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve { with_scheduler } => {
            let store = itrack_storage::open_store_from_env().await?;
            let pipeline = Arc::new(itrack_sync::pipeline_from_env(Arc::clone(&store))?);
            if with_scheduler {
                let scheduled = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    if let Err(err) =
                        itrack_sync::run_scheduler_until_shutdown(scheduled, Arc::new(LogReminderSender))
                            .await
                    {
                        tracing::error!(error = %err, "scheduler stopped");
                    }
                });
            }
            itrack_web::serve_from_env(store, Some(pipeline)).await?;
        }
        Commands::Schedule => {
            let store = itrack_storage::open_store_from_env().await?;
            let pipeline = Arc::new(itrack_sync::pipeline_from_env(store)?);
            itrack_sync::run_scheduler_until_shutdown(pipeline, Arc::new(LogReminderSender)).await?;
        }
        Commands::Remind => {
            let store = itrack_storage::open_store_from_env().await?;
            let config = SyncConfig::from_env();
            let summary = itrack_sync::send_deadline_reminders(
                store.as_ref(),
                &LogReminderSender,
                config.reminder_days_before,
                Utc::now(),
            )
            .await?;
            print_json(&summary)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
