use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fleet_sync::{BatchCoordinator, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "fleet-cli")]
#[command(about = "Vehicle listing snapshot reconciliation")]
struct Cli {
    /// Variant definitions to use instead of the built-in set.
    #[arg(long, global = true)]
    variants_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (default).
    Serve,
    /// Reconcile one snapshot file against the catalog.
    Reconcile {
        #[arg(long)]
        variant: String,
        file: PathBuf,
        /// Print the emitted listings as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Empty the change set of every listing of a variant.
    ClearChanges {
        #[arg(long)]
        variant: String,
    },
    /// Delete every listing of a variant.
    Purge {
        #[arg(long)]
        variant: String,
        #[arg(long)]
        yes: bool,
    },
    /// List configured variants.
    Variants,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Maintenance commands refuse to run against the in-memory store.
fn require_database(config: &SyncConfig, action: &str) -> Result<()> {
    if config.database_url.is_none() {
        bail!("DATABASE_URL must be set to {action}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if cli.variants_file.is_some() {
        config.variants_file = cli.variants_file.clone();
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            fleet_web::serve(config, fleet_web::WebConfig::from_env()).await?;
        }
        Commands::Reconcile {
            variant,
            file,
            json,
        } => {
            let coordinator = BatchCoordinator::from_config(&config, false).await?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .with_context(|| format!("{} is not a file path", file.display()))?;
            let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let report = coordinator
                .run_bytes(&variant, &file_name, &bytes)
                .await
                .with_context(|| format!("reconciling {}", file.display()))?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report.listings).context("serializing listings")?
                );
            } else {
                println!(
                    "reconcile complete: run_id={} rows={} created={} updated={} unchanged={} retired={} skipped={} failed={}",
                    report.run_id,
                    report.rows_processed,
                    report.counts.created,
                    report.counts.updated,
                    report.counts.unchanged,
                    report.counts.retired,
                    report.counts.skipped,
                    report.counts.failed
                );
            }
        }
        Commands::Migrate => {
            require_database(&config, "run migrations")?;
            config.open_store(true).await?;
            info!("migrations complete");
        }
        Commands::ClearChanges { variant } => {
            require_database(&config, "clear change sets")?;
            let coordinator = BatchCoordinator::from_config(&config, false).await?;
            let rows = coordinator.clear_change_sets(&variant).await?;
            println!("cleared change sets: variant={variant} rows={rows}");
        }
        Commands::Purge { variant, yes } => {
            if !yes {
                bail!("refusing to delete all `{variant}` listings without --yes");
            }
            require_database(&config, "purge listings")?;
            let coordinator = BatchCoordinator::from_config(&config, false).await?;
            let rows = coordinator.delete_all(&variant).await?;
            println!("deleted listings: variant={variant} rows={rows}");
        }
        Commands::Variants => {
            let variants = config.load_variants()?;
            for variant in variants.iter() {
                println!(
                    "{}\tkey={}\tprice={}\ttracked={}",
                    variant.name(),
                    fleet_core::column_label(variant.key_column()),
                    variant.price_field(),
                    variant.tracked_fields().join(",")
                );
            }
        }
    }

    Ok(())
}
