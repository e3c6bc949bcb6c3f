//! Per-bucket record of the most recent export attempt.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a bucket's most recent backup attempt.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    /// Registered but never exported in this process.
    #[default]
    Idle,
    Running,
    /// Export stream finished; the external compressor is running.
    Zipping,
    Completed,
    Failed,
    /// Export succeeded but shipping it off-host failed.
    TransferError,
}

/// Backup status for one bucket.
///
/// Exactly one record exists per bucket; it is overwritten in place on every
/// export attempt and never removed while the bucket exists.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct BackupStatus {
    pub status: BackupState,

    /// When the last attempt started. `None` until the first attempt.
    pub last_start: Option<DateTime<Utc>>,

    /// When the last attempt finished, successfully or not.
    pub last_end: Option<DateTime<Utc>>,

    /// Human-readable failure text; empty on success.
    pub last_message: String,

    /// File produced by the last successful export.
    pub file: Option<PathBuf>,

    /// Size of the uncompressed export stream in bytes.
    pub bytes: Option<u64>,

    /// Hex MD5 of the uncompressed export stream.
    pub digest: Option<String>,
}

impl BackupStatus {
    pub fn is_error(&self) -> bool {
        matches!(self.status, BackupState::Failed | BackupState::TransferError)
    }

    /// A bucket is stale once its last attempt started more than `grace` ago.
    ///
    /// Buckets that never ran are measured from `started_at`, the moment the
    /// process came up, so a fresh boot is not immediately reported unhealthy.
    pub fn is_stale(
        &self,
        now: DateTime<Utc>,
        grace: TimeDelta,
        started_at: DateTime<Utc>,
    ) -> bool {
        let since = self.last_start.unwrap_or(started_at);
        now - since > grace
    }

    /// Duration of the last attempt, or the time elapsed so far while running.
    pub fn duration(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        let start = self.last_start?;
        match self.status {
            BackupState::Running | BackupState::Zipping => Some(now - start),
            _ => self.last_end.map(|end| end - start),
        }
    }
}
