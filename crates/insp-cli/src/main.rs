use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use insp_core::SyncWindow;
use insp_storage::{DynStore, PgInspectionStore};
use insp_sync::{SyncConfig, SyncPipeline, SyncScheduler};
use insp_web::{AppState, AuthConfig, AuthGate, WebConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "insp-cli")]
#[command(about = "Restaurant inspection sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API and the daily scheduled sync.
    Serve,
    /// Run one sync and print its summary.
    Sync {
        /// Day to reconcile (defaults to yesterday).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    Migrate,
    /// Issue a bearer token signed with INSP_JWT_SECRET.
    Token {
        #[arg(long, default_value = "insp-client")]
        subject: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await?,
        Commands::Sync { date } => {
            let config = SyncConfig::from_env()?;
            let store = connect(&config).await?;
            let pipeline = SyncPipeline::from_config(&config, store)?;
            let summary = match date {
                Some(day) => pipeline.run_sync(SyncWindow::for_day(day)).await?,
                None => pipeline.run_default().await?,
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            PgInspectionStore::connect(&config.database_url, config.db_max_connections)
                .await?
                .migrate()
                .await?;
            info!("migrations applied");
        }
        Commands::Token { subject } => {
            let gate = AuthGate::new(AuthConfig::from_env()?);
            println!("{}", gate.issue_token(&subject)?);
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<DynStore> {
    let store = PgInspectionStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to DATABASE_URL")?;
    store.migrate().await?;
    Ok(Arc::new(store))
}

async fn serve() -> Result<()> {
    let sync_config = SyncConfig::from_env()?;
    let web_config = WebConfig::from_env()?;
    if web_config.auth.is_disabled() {
        warn!("authorization gate disabled; mutating routes are open");
    }

    let store = connect(&sync_config).await?;
    let pipeline = Arc::new(SyncPipeline::from_config(&sync_config, store.clone())?);

    let mut scheduler = if sync_config.scheduler_enabled {
        let mut scheduler = SyncScheduler::for_pipeline(&sync_config.sync_cron, pipeline.clone()).await?;
        scheduler.start().await?;
        let next = scheduler.next_tick().await?;
        info!(cron = scheduler.cron(), next_run = ?next, "next scheduled sync");
        Some(scheduler)
    } else {
        info!("sync scheduler disabled");
        None
    };

    let state = AppState::new(store, pipeline, AuthGate::new(web_config.auth));
    let served = insp_web::serve(web_config.port, insp_web::app(state), async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    })
    .await;

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.stop().await?;
    }
    served
}
