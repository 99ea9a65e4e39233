use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cps_core::SyncScope;
use cps_crm::{CrmClient, CrmConfig};
use cps_store::Store;
use cps_sync::{SyncConfig, SyncEngine};

#[derive(Debug, Parser)]
#[command(name = "cps-cli")]
#[command(about = "Candidate pipeline sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync against the remote CRM and exit.
    Sync {
        /// Sync scope: candidates, interviews, or both.
        #[arg(long, default_value = "both")]
        scope: String,
    },
    /// Create the database file and schema, then exit.
    Migrate,
    /// Run the HTTP control surface (and the scheduler, if enabled).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync { scope } => {
            let scope = SyncScope::parse(&scope)
                .ok_or_else(|| anyhow::anyhow!("unknown scope: {scope}"))?;
            let store = open_store().await?;
            let client = CrmClient::from_config(&CrmConfig::from_env())?;
            let engine = SyncEngine::new(Arc::new(client), store);
            let run = engine.run(scope).await?;
            println!(
                "sync {}: run_id={} fetched={} created={} updated={} errors={}",
                run.outcome,
                run.run_id,
                run.records_fetched,
                run.records_created,
                run.records_updated,
                run.errors.len()
            );
            for error in &run.errors {
                eprintln!("  {error}");
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            open_store().await?;
            println!("database ready at {}", config.database_path.display());
        }
        Commands::Serve => {
            cps_web::serve_from_env().await?;
        }
    }

    Ok(())
}

async fn open_store() -> Result<Store> {
    let config = SyncConfig::from_env();
    if let Some(dir) = config.database_path.parent() {
        std::fs::create_dir_all(dir).context("creating database directory")?;
    }
    Store::open(&config.database_path)
        .await
        .with_context(|| format!("opening {}", config.database_path.display()))
}
