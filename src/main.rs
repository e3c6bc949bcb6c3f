use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{collections::BTreeSet, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use services::{
    clock::{Clock, SystemClock},
    export_service::ExportPipeline,
    job_queue::JobQueue,
    kv_store::{KvStore, apply_schema},
    replication::ReplicationWorker,
    scheduler::{BackupScheduler, SchedulerTracker},
    status_registry::StatusRegistry,
    transfer::SftpTransport,
};
use state::{AppState, BackupSummary};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting kv-backup with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database URL `{}`", db_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    apply_schema(&db).await?;
    if migrate {
        tracing::info!("Database schema applied.");
        return Ok(());
    }

    // --- Initialize core services ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(KvStore::new(db.clone()));
    let statuses = Arc::new(StatusRegistry::new());
    let jobs = Arc::new(JobQueue::new(clock.clone()));
    let tracker = Arc::new(SchedulerTracker::new());
    let shutdown = CancellationToken::new();

    for name in &cfg.buckets {
        let bucket = store
            .ensure_bucket(name)
            .await
            .with_context(|| format!("creating bucket `{}`", name))?;
        statuses.register(&bucket);
    }

    let mut summary = BackupSummary {
        enabled: false,
        replication_enabled: false,
        hours: BTreeSet::new(),
        grace: chrono::TimeDelta::hours(config::DEFAULT_GRACE_HOURS),
        backup_dir: None,
    };

    let mut tasks = Vec::new();
    match &cfg.backup {
        None => tracing::warn!("NOBACKUP is set, backups are disabled"),
        Some(backup) => {
            for bucket in store.list_buckets().await? {
                statuses.register(&bucket);
            }

            let target = backup.replication.target();
            let pipeline = Arc::new(ExportPipeline::new(
                store.clone(),
                statuses.clone(),
                target.is_some().then(|| jobs.clone()),
                clock.clone(),
                backup.export_settings(),
            ));
            let scheduler = Arc::new(BackupScheduler::new(
                pipeline,
                backup.hours.clone(),
                tracker.clone(),
                clock.clone(),
            ));
            tasks.push(tokio::spawn(scheduler.run(backup.tick, shutdown.clone())));

            match target {
                Some(target) => {
                    tracing::info!(
                        host = %target.host,
                        port = target.port,
                        directory = %target.directory,
                        "replication enabled"
                    );
                    let worker = Arc::new(ReplicationWorker::new(
                        jobs.clone(),
                        statuses.clone(),
                        Arc::new(SftpTransport::new(target)),
                        clock.clone(),
                        backup.remote_naming(),
                    ));
                    tasks.push(tokio::spawn(
                        worker.run(backup.replication.tick, shutdown.clone()),
                    ));
                }
                None => tracing::info!("replication disabled"),
            }

            summary = BackupSummary {
                enabled: true,
                replication_enabled: backup.replication.is_enabled(),
                hours: backup.hours.clone(),
                grace: backup.grace,
                backup_dir: Some(backup.backup_dir.clone()),
            };
        }
    }

    let state = AppState {
        db,
        statuses,
        jobs,
        tracker,
        started_at: clock.now(),
        clock,
        backup: summary,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for ctrl-c: {}", err);
            }
            tracing::info!("Shutdown requested");
            token.cancel();
        })
        .await?;

    shutdown.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            tracing::error!("background loop ended abnormally: {}", err);
        }
    }

    Ok(())
}
