//! Shared state handed to every HTTP handler.

use crate::services::{
    clock::Clock, job_queue::JobQueue, scheduler::SchedulerTracker,
    status_registry::StatusRegistry,
};
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::SqlitePool;
use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub statuses: Arc<StatusRegistry>,
    /// Stays empty when replication is disabled.
    pub jobs: Arc<JobQueue>,
    pub tracker: Arc<SchedulerTracker>,
    pub clock: Arc<dyn Clock>,
    pub started_at: DateTime<Utc>,
    pub backup: BackupSummary,
}

/// What the status report says about the pipeline's configuration.
#[derive(Clone, Debug)]
pub struct BackupSummary {
    pub enabled: bool,
    pub replication_enabled: bool,
    pub hours: BTreeSet<u32>,
    pub grace: TimeDelta,
    /// Checked by `/readyz`; `None` when backups are disabled.
    pub backup_dir: Option<PathBuf>,
}
