use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use inegi_client::{CatalogClient, InMemorySnapshotStore};
use inegi_store::StateStore;
use inegi_sync::SyncConfig;
use inegi_web::AppState;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "inegi-cli")]
#[command(about = "INEGI state catalog sync service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (default).
    Serve,
    /// Fetch the catalog once and reconcile it into the store.
    Sync {
        /// Fall back to the last-good snapshot if INEGI is down.
        #[arg(long)]
        resynchronize: bool,
    },
    /// Remove duplicate rows per entity code, keeping the lowest id.
    Deduplicate,
    /// Empty the state table and reset its id sequence.
    Clear,
    /// Create the schema and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = StateStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let snapshot = Arc::new(InMemorySnapshotStore::new());
            let client = CatalogClient::new(config.client_config(), snapshot)
                .context("building catalog client")?;
            let state = AppState::new(store, Arc::new(client));
            inegi_web::serve(state, inegi_web::port_from_env()).await?;
        }
        Commands::Sync { resynchronize } => {
            let snapshot = Arc::new(InMemorySnapshotStore::new());
            let client = CatalogClient::new(config.client_config(), snapshot)
                .context("building catalog client")?;
            let outcome = inegi_sync::run_sync(&client, &store, resynchronize).await?;
            println!(
                "sync complete: run_id={} insertados={} actualizados={} sin_cambios={} total={}",
                outcome.run_id,
                outcome.counts.inserted,
                outcome.counts.updated,
                outcome.counts.unchanged,
                outcome.total_received
            );
        }
        Commands::Deduplicate => {
            let report = store.deduplicate().await?;
            println!(
                "deduplicate complete: claves_duplicadas={} filas_eliminadas={} total_final={}",
                report.duplicated_keys, report.deleted_rows, report.final_total
            );
        }
        Commands::Clear => {
            store.clear().await?;
            println!("tabla inegi_states vaciada");
        }
        Commands::Migrate => {
            store.migrate().await?;
            println!("schema ready at {}", config.database_url);
        }
    }

    Ok(())
}
