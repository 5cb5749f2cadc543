use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zentao_core::SyncPolicy;
use zentao_sources::LiveAcquirerFactory;
use zentao_storage::{MemoryStore, PgStore, Store};
use zentao_sync::{ConnectionRegistry, SyncConfig, SUBTASKS};

#[derive(Debug, Parser)]
#[command(name = "zentao-cli")]
#[command(about = "Zentao sync connector command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every unit once for one connection (and optionally one project).
    Sync {
        #[arg(long)]
        connection_id: u64,
        #[arg(long)]
        project_id: Option<i64>,
        #[arg(long)]
        scope_config_id: Option<u64>,
        /// Re-process stored raw data without contacting Zentao.
        #[arg(long)]
        skip_collectors: bool,
        /// Use an in-memory store instead of Postgres.
        #[arg(long)]
        memory: bool,
    },
    Migrate,
    /// Store the connections, scope configs and projects of a registry file.
    Seed {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print the unit registry.
    Subtasks,
    /// Run the registry on the configured cron until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_store(config: &SyncConfig, memory: bool) -> Result<Arc<dyn Store>> {
    if memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PgStore::connect(&config.database_url, 5)
        .await
        .context("connecting to the database")?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Subtasks) {
        Commands::Sync {
            connection_id,
            project_id,
            scope_config_id,
            skip_collectors,
            memory,
        } => {
            let store = open_store(&config, memory).await?;
            let registry = ConnectionRegistry::load(&config.registry_path).await?;
            registry.seed(store.as_ref()).await?;

            let options = json!({
                "connectionId": connection_id,
                "projectId": project_id,
                "scopeConfigId": scope_config_id,
            });
            let report = zentao_sync::run_sync_once(
                options,
                SyncPolicy { skip_collectors },
                store,
                &LiveAcquirerFactory,
                &config,
                cancel_on_ctrl_c(),
            )
            .await?;
            let path = zentao_sync::write_report(&config.reports_dir(), &report).await?;
            println!(
                "sync complete: run_id={} success={} units={} failed={} report={}",
                report.run_id,
                report.is_success(),
                report.units.len(),
                report.failed_units().len(),
                path.display()
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, 1)
                .await
                .context("connecting to the database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Seed { file } => {
            let path = file.unwrap_or_else(|| config.registry_path.clone());
            let store = open_store(&config, false).await?;
            let registry = ConnectionRegistry::load(&path).await?;
            registry.seed(store.as_ref()).await?;
            println!(
                "seeded {} connections, {} scope configs, {} projects from {}",
                registry.connections.len(),
                registry.scope_configs.len(),
                registry.projects.len(),
                path.display()
            );
        }
        Commands::Subtasks => {
            for meta in SUBTASKS {
                let domain = format!("{:?}", meta.domain);
                println!(
                    "{:<28} {:<8} {:<7} {}",
                    meta.name,
                    meta.kind.to_string(),
                    domain,
                    meta.dependencies.join(",")
                );
            }
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let store = open_store(&config, false).await?;
            let cancel = cancel_on_ctrl_c();
            let sched = zentao_sync::build_scheduler(
                config,
                store,
                Arc::new(LiveAcquirerFactory),
                cancel.clone(),
            )
            .await?;
            let Some(mut sched) = sched else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started");
            cancel.cancelled().await;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
