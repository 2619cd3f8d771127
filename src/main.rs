//! Hermes engine binary
//!
//! Loads a production document, deploys and starts it, replays the WAL,
//! serves the admin API, and stops cleanly on SIGINT/SIGTERM. The hidden
//! `worker` subcommand is the child side of the multi-process execution
//! strategy.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use hermes::config::{ConfigRepository, FileConfigRepository};
use hermes::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use hermes::domain::ProjectId;
use hermes::engine::{EngineSettings, ProductionEngine};
use hermes::store::{MessageStore, SqliteMessageStore};
use hermes::wal::Wal;

#[derive(Parser)]
#[command(name = "hermes", version, about = "Healthcare message integration engine")]
struct Args {
    /// Directory containing production documents (<project>.json).
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Production to deploy and start at boot.
    #[arg(long)]
    project: Option<String>,

    /// Data directory (WAL and message store).
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Admin API bind address.
    #[arg(long, default_value = "127.0.0.1:8420")]
    admin_addr: SocketAddr,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,

    /// Trace row retention in days.
    #[arg(long, default_value_t = 30)]
    retention_days: u32,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Internal: process-strategy worker. Not for interactive use.
    #[command(hide = true)]
    Worker {
        /// Item document the worker hosts.
        #[arg(long)]
        item: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::Worker { item }) = &args.command {
        // Child side of the multi-process strategy: quiet logs on stderr,
        // frames on stdin/stdout.
        hermes::observability::init_logging(false);
        hermes::ipc::run_worker(item)
            .await
            .context("process worker failed")?;
        return Ok(());
    }

    hermes::observability::init_logging(args.json_logs);
    info!("starting hermes engine");

    let wal = Arc::new(Wal::open(args.data_dir.join("wal")).context("open WAL")?);

    let db_path = DatabasePath::parse(args.data_dir.join("trace.db"))
        .context("message store path")?;
    let connection = DatabaseConnection::initialize(DatabaseConfig::new(db_path))
        .await
        .context("message store init")?;
    let store: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::new(connection));

    let settings = EngineSettings {
        retention_days: args.retention_days,
        ..EngineSettings::default()
    };
    let engine = ProductionEngine::new(Arc::clone(&wal), store, settings);

    if let Some(project) = &args.project {
        let repository = FileConfigRepository::new(&args.config_dir);
        let document = repository
            .load(project)
            .with_context(|| format!("load production {project}"))?;
        let project_id = ProjectId::try_new(project.clone())
            .map_err(|e| anyhow::anyhow!("project id: {e}"))?;

        engine
            .deploy(project_id.clone(), document)
            .await
            .context("deploy")?;
        engine.start(&project_id).await.context("start")?;

        let replayed = engine.recover().await.context("wal replay")?;
        if replayed > 0 {
            info!(replayed, "recovered in-flight messages from WAL");
        }
    }

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(hermes::admin::serve(
        args.admin_addr,
        Arc::clone(&engine),
        shutdown.clone(),
    ));

    wait_for_signal().await;
    info!("shutdown signal received");

    shutdown.cancel();
    engine.shutdown(Duration::from_secs(15)).await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "admin server failed"),
        Err(e) => error!(error = %e, "admin server task panicked"),
    }

    info!("hermes engine stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
