//! StatusRegistry: the authoritative map of per-bucket backup status.
//!
//! The scheduler's export pass is the only writer of a bucket's export state;
//! the replication worker only flips the transfer flag. Readers (the status
//! report) always receive owned snapshots, never references into the map.

use crate::models::{
    backup_status::{BackupState, BackupStatus},
    bucket::BucketName,
};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// What a successful export produced.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportOutput {
    pub path: PathBuf,
    pub bytes: u64,
    pub digest: String,
}

#[derive(Debug, Default)]
pub struct StatusRegistry {
    statuses: RwLock<HashMap<BucketName, BackupStatus>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<BucketName, BackupStatus>> {
        self.statuses.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<BucketName, BackupStatus>> {
        self.statuses.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an Idle record for `bucket` unless one exists.
    pub fn register(&self, bucket: &BucketName) {
        self.write().entry(bucket.clone()).or_default();
    }

    fn update(&self, bucket: &BucketName, apply: impl FnOnce(&mut BackupStatus)) {
        let mut statuses = self.write();
        apply(statuses.entry(bucket.clone()).or_default());
    }

    pub fn mark_running(&self, bucket: &BucketName, now: DateTime<Utc>) {
        self.update(bucket, |status| {
            status.status = BackupState::Running;
            status.last_start = Some(now);
            status.last_message.clear();
        });
    }

    pub fn mark_zipping(&self, bucket: &BucketName) {
        self.update(bucket, |status| {
            status.status = BackupState::Zipping;
            status.last_message = "Zipping file".to_string();
        });
    }

    pub fn mark_completed(&self, bucket: &BucketName, now: DateTime<Utc>, output: &ExportOutput) {
        self.update(bucket, |status| {
            status.status = BackupState::Completed;
            status.last_end = Some(now);
            status.last_message.clear();
            status.file = Some(output.path.clone());
            status.bytes = Some(output.bytes);
            status.digest = Some(output.digest.clone());
        });
    }

    pub fn mark_failed(&self, bucket: &BucketName, now: DateTime<Utc>, message: impl Into<String>) {
        let message = message.into();
        self.update(bucket, |status| {
            status.status = BackupState::Failed;
            status.last_end = Some(now);
            status.last_message = message;
        });
    }

    /// Flag a failed transfer of an already completed export.
    ///
    /// A bucket whose next export already started is left alone; its fresh
    /// attempt owns the record.
    pub fn mark_transfer_error(&self, bucket: &BucketName, message: impl Into<String>) {
        let message = message.into();
        self.update(bucket, |status| {
            if matches!(
                status.status,
                BackupState::Completed | BackupState::TransferError
            ) {
                status.status = BackupState::TransferError;
                status.last_message = message;
            }
        });
    }

    /// Undo [`Self::mark_transfer_error`] once a transfer succeeds.
    pub fn clear_transfer_error(&self, bucket: &BucketName) {
        self.update(bucket, |status| {
            if status.status == BackupState::TransferError {
                status.status = BackupState::Completed;
                status.last_message.clear();
            }
        });
    }

    pub fn get(&self, bucket: &BucketName) -> Option<BackupStatus> {
        self.read().get(bucket).cloned()
    }

    /// Owned copy of every record, sorted by bucket name.
    pub fn snapshot(&self) -> Vec<(BucketName, BackupStatus)> {
        let mut rows: Vec<_> = self
            .read()
            .iter()
            .map(|(name, status)| (name.clone(), status.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 2, minute, 0).unwrap()
    }

    fn output() -> ExportOutput {
        ExportOutput {
            path: "/backups/alpha.bak".into(),
            bytes: 42,
            digest: "abc".into(),
        }
    }

    #[test]
    fn register_does_not_overwrite() {
        let registry = StatusRegistry::new();
        let bucket = BucketName::from("alpha");
        registry.register(&bucket);
        registry.mark_running(&bucket, at(0));
        registry.register(&bucket);
        assert_eq!(registry.get(&bucket).unwrap().status, BackupState::Running);
    }

    #[test]
    fn attempt_lifecycle_overwrites_in_place() {
        let registry = StatusRegistry::new();
        let bucket = BucketName::from("alpha");

        registry.mark_running(&bucket, at(0));
        registry.mark_failed(&bucket, at(1), "disk full");
        let failed = registry.get(&bucket).unwrap();
        assert_eq!(failed.status, BackupState::Failed);
        assert_eq!(failed.last_message, "disk full");

        registry.mark_running(&bucket, at(2));
        assert!(registry.get(&bucket).unwrap().last_message.is_empty());
        registry.mark_completed(&bucket, at(3), &output());

        let done = registry.get(&bucket).unwrap();
        assert_eq!(done.status, BackupState::Completed);
        assert_eq!(done.last_start, Some(at(2)));
        assert_eq!(done.last_end, Some(at(3)));
        assert_eq!(done.bytes, Some(42));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn transfer_error_only_applies_to_completed_exports() {
        let registry = StatusRegistry::new();
        let bucket = BucketName::from("alpha");

        registry.mark_running(&bucket, at(0));
        registry.mark_transfer_error(&bucket, "connection refused");
        assert_eq!(registry.get(&bucket).unwrap().status, BackupState::Running);

        registry.mark_completed(&bucket, at(1), &output());
        registry.mark_transfer_error(&bucket, "connection refused");
        let flagged = registry.get(&bucket).unwrap();
        assert_eq!(flagged.status, BackupState::TransferError);
        assert!(flagged.is_error());

        registry.clear_transfer_error(&bucket);
        let cleared = registry.get(&bucket).unwrap();
        assert_eq!(cleared.status, BackupState::Completed);
        assert!(cleared.last_message.is_empty());
    }

    #[test]
    fn snapshot_is_sorted() {
        let registry = StatusRegistry::new();
        for name in ["gamma", "alpha", "beta"] {
            registry.register(&BucketName::from(name));
        }
        let names: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|(name, _)| name.to_string())
            .collect();
        assert_eq!(names, ["alpha", "beta", "gamma"]);
    }
}
