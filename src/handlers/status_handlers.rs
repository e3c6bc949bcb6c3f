//! Status report over the backup pipeline.
//!
//! - GET /status           -> full report; 200 when healthy, 500 otherwise
//! - GET /status/{bucket}  -> one bucket's row, 404 when unknown

use crate::{
    errors::AppError,
    models::{
        backup_status::{BackupState, BackupStatus},
        bucket::BucketName,
        replication_job::{JobStatus, ReplicationJob},
    },
    services::scheduler::SchedulerState,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub healthy: bool,
    pub now: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub backups_enabled: bool,
    pub replication_enabled: bool,
    pub hours: Vec<u32>,
    pub grace_hours: i64,
    pub scheduler: SchedulerState,
    pub buckets: Vec<BucketReport>,
    pub jobs: Vec<JobReport>,
}

#[derive(Debug, Serialize)]
pub struct BucketReport {
    pub bucket: BucketName,
    #[serde(flatten)]
    pub status: BackupStatus,
    pub duration_secs: Option<i64>,
    pub never_run: bool,
    pub stale: bool,
}

#[derive(Debug, Serialize)]
pub struct JobReport {
    #[serde(flatten)]
    pub job: ReplicationJob,
    pub duration_secs: Option<i64>,
    pub stale: bool,
}

impl BucketReport {
    fn is_healthy(&self) -> bool {
        !self.stale && !self.status.is_error()
    }
}

impl JobReport {
    fn is_healthy(&self) -> bool {
        !self.stale && self.job.message.is_empty()
    }
}

fn bucket_report(
    state: &AppState,
    bucket: BucketName,
    status: BackupStatus,
    now: DateTime<Utc>,
) -> BucketReport {
    BucketReport {
        duration_secs: status.duration(now).map(|d| d.num_seconds()),
        never_run: status.status == BackupState::Idle && status.last_start.is_none(),
        stale: status.is_stale(now, state.backup.grace, state.started_at),
        bucket,
        status,
    }
}

fn job_report(state: &AppState, job: ReplicationJob, now: DateTime<Utc>) -> JobReport {
    let duration_secs = job.last_start.and_then(|start| {
        let end = match job.status {
            JobStatus::Running => Some(now),
            _ => job.last_end.filter(|end| *end >= start),
        };
        end.map(|end| (end - start).num_seconds())
    });
    JobReport {
        duration_secs,
        stale: job.is_stale(now, state.backup.grace),
        job,
    }
}

/// Snapshot every record and derive the overall health flag.
pub fn build_report(state: &AppState, now: DateTime<Utc>) -> StatusReport {
    let (buckets, jobs) = if state.backup.enabled {
        let buckets: Vec<_> = state
            .statuses
            .snapshot()
            .into_iter()
            .map(|(bucket, status)| bucket_report(state, bucket, status, now))
            .collect();
        let jobs: Vec<_> = state
            .jobs
            .snapshot()
            .into_iter()
            .map(|job| job_report(state, job, now))
            .collect();
        (buckets, jobs)
    } else {
        (Vec::new(), Vec::new())
    };

    let healthy =
        buckets.iter().all(BucketReport::is_healthy) && jobs.iter().all(JobReport::is_healthy);

    StatusReport {
        healthy,
        now,
        started_at: state.started_at,
        uptime_secs: (now - state.started_at).num_seconds(),
        backups_enabled: state.backup.enabled,
        replication_enabled: state.backup.replication_enabled,
        hours: state.backup.hours.iter().copied().collect(),
        grace_hours: state.backup.grace.num_hours(),
        scheduler: state.tracker.snapshot(),
        buckets,
        jobs,
    }
}

/// `GET /status`
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let report = build_report(&state, state.clock.now());
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(report))
}

/// `GET /status/{bucket}`
pub async fn bucket_status(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Json<BucketReport>, AppError> {
    let bucket = BucketName::from(bucket);
    let status = state.statuses.get(&bucket).ok_or_else(|| {
        AppError::not_found(format!("no backup status for bucket `{bucket}`"))
    })?;
    let report = bucket_report(&state, bucket, status, state.clock.now());
    Ok(Json(report))
}
