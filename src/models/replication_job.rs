//! Represents the unit of work "ship this exported file to the remote host".

use super::bucket::BucketName;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Error,
}

/// Outstanding transfer for one bucket.
///
/// At most one job exists per bucket. A later export re-arms the existing
/// job instead of queueing a second one.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReplicationJob {
    pub bucket: BucketName,

    /// Local file to send.
    pub source_file: PathBuf,

    pub status: JobStatus,

    /// Failure text of the last attempt; empty after a success.
    pub message: String,

    /// When the last transfer attempt started.
    pub last_start: Option<DateTime<Utc>>,

    /// When the last transfer attempt finished.
    pub last_end: Option<DateTime<Utc>>,

    /// Earliest time the job may be selected.
    pub next_eligible_at: DateTime<Utc>,

    /// When the job was last armed by an export.
    pub queued_at: DateTime<Utc>,

    /// Bumped on every arm, so a transfer that finishes after a newer export
    /// arrived does not mark the newer file as shipped.
    pub generation: u64,
}

impl ReplicationJob {
    pub fn new(bucket: BucketName, source_file: PathBuf, now: DateTime<Utc>) -> Self {
        Self {
            bucket,
            source_file,
            status: JobStatus::Pending,
            message: String::new(),
            last_start: None,
            last_end: None,
            next_eligible_at: now,
            queued_at: now,
            generation: 0,
        }
    }

    /// Pending and Error jobs whose back-off has elapsed may be selected.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Error) && self.next_eligible_at <= now
    }

    /// Record a newer export for this bucket.
    ///
    /// Complete and Error jobs go back to Pending and become eligible at
    /// `now`. Pending jobs keep their place in the queue and Running jobs
    /// keep running; both pick up the new path.
    pub fn rearm(&mut self, source_file: PathBuf, now: DateTime<Utc>) {
        self.source_file = source_file;
        self.generation += 1;
        self.queued_at = now;
        if matches!(self.status, JobStatus::Complete | JobStatus::Error) {
            self.status = JobStatus::Pending;
            self.next_eligible_at = now;
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, grace: TimeDelta) -> bool {
        now - self.last_start.unwrap_or(self.queued_at) > grace
    }
}
