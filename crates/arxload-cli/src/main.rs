use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use arxload_core::SyncMode;
use arxload_db::PgTaxonomyStore;
use arxload_sync::{
    build_resolver, seed_taxonomy, MemoryConnector, ScheduleAdapter, SyncConfig, SyncJob,
    SyncOrchestrator, SCHEDULER_ENABLED_VAR,
};
use arxload_web::AppState;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "arxload")]
#[command(about = "arXiv metadata loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and exit non-zero if it fails.
    Sync {
        /// `acquire` or `mirror`; defaults to SYNC_MODE, then APP_ENV.
        #[arg(long)]
        mode: Option<SyncMode>,
        /// Load into in-process stores instead of MongoDB/PostgreSQL.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run syncs on SYNC_CRON until interrupted.
    Schedule,
    /// Serve the HTTP job trigger, plus the cron schedule when enabled.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply taxonomy database migrations.
    Migrate,
    /// Apply the curated category tree.
    SeedTaxonomy {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        mode: None,
        dry_run: false,
    }) {
        Commands::Sync { mode, dry_run } => {
            let mode = mode.unwrap_or(config.mode);
            let orchestrator = if dry_run {
                let resolver = build_resolver(&config)?;
                SyncOrchestrator::new(config, resolver, Arc::new(MemoryConnector::default()))
            } else {
                SyncOrchestrator::from_config(config)?
            };
            let summary = orchestrator.run(mode).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            return Ok(if summary.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Commands::Schedule => {
            let mode = config.mode;
            let cron = config.sync_cron.clone();
            let job = Arc::new(SyncJob::new(SyncOrchestrator::from_config(config)?));
            let mut scheduler = ScheduleAdapter::new(job, cron, mode).start().await?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.web_port);
            let mode = config.mode;
            let cron = config.sync_cron.clone();
            let scheduler_enabled = config.scheduler_enabled;
            let job = Arc::new(SyncJob::new(SyncOrchestrator::from_config(config)?));
            let _scheduler = if scheduler_enabled {
                Some(
                    ScheduleAdapter::new(Arc::clone(&job), cron, mode)
                        .start()
                        .await?,
                )
            } else {
                warn!(
                    variable = SCHEDULER_ENABLED_VAR,
                    "scheduler is off; runs start only over http"
                );
                None
            };
            arxload_web::serve(AppState::new(job), port).await?;
        }
        Commands::Migrate => {
            let store = PgTaxonomyStore::connect(database_url(&config)?).await?;
            store.migrate().await?;
            println!("taxonomy migrations applied");
        }
        Commands::SeedTaxonomy { path } => {
            let path = path.unwrap_or_else(|| config.taxonomy_seed_path.clone());
            let store = PgTaxonomyStore::connect(database_url(&config)?).await?;
            store.migrate().await?;
            let report = seed_taxonomy(&store, &path).await?;
            println!(
                "taxonomy seeded: created={} updated={} names={}",
                report.created, report.updated, report.names_written
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn database_url(config: &SyncConfig) -> Result<&str> {
    config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")
}
