//! Test doubles shared by the service tests.

use super::{
    clock::ManualClock,
    export_service::ExportSource,
    kv_store::{ExportStats, StorageError, StorageResult},
    transfer::{TransferError, Transport},
};
use crate::models::bucket::BucketName;
use chrono::{TimeZone, Utc};
use std::{
    collections::{BTreeMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Manual clock at 2026-03-01 `hour`:00 UTC.
pub fn test_clock(hour: u32) -> Arc<ManualClock> {
    Arc::new(ManualClock::at(
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap(),
    ))
}

/// In-memory export source with per-bucket failure injection.
#[derive(Default)]
pub struct FakeSource {
    payloads: Mutex<BTreeMap<BucketName, Vec<u8>>>,
    failing: Mutex<HashSet<BucketName>>,
    panicking: Mutex<HashSet<BucketName>>,
    exported: Mutex<Vec<BucketName>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(self, name: &str, payload: &[u8]) -> Self {
        self.payloads
            .lock()
            .unwrap()
            .insert(name.into(), payload.to_vec());
        self
    }

    /// A bucket whose export writes a few bytes and then errors.
    pub fn with_failing_bucket(self, name: &str) -> Self {
        self.fail_bucket(name);
        self
    }

    /// A bucket whose export panics.
    pub fn with_panicking_bucket(self, name: &str) -> Self {
        self.payloads
            .lock()
            .unwrap()
            .insert(name.into(), Vec::new());
        self.panicking.lock().unwrap().insert(name.into());
        self
    }

    pub fn fail_bucket(&self, name: &str) {
        self.payloads
            .lock()
            .unwrap()
            .entry(name.into())
            .or_default();
        self.failing.lock().unwrap().insert(name.into());
    }

    pub fn add_bucket(&self, name: &str, payload: &[u8]) {
        self.payloads
            .lock()
            .unwrap()
            .insert(name.into(), payload.to_vec());
    }

    /// Buckets whose export was attempted, in call order.
    pub fn exported(&self) -> Vec<BucketName> {
        self.exported.lock().unwrap().clone()
    }
}

impl ExportSource for FakeSource {
    async fn list_buckets(&self) -> StorageResult<Vec<BucketName>> {
        Ok(self.payloads.lock().unwrap().keys().cloned().collect())
    }

    async fn export<W>(
        &self,
        bucket: &BucketName,
        writer: &mut W,
        _concurrency: usize,
    ) -> StorageResult<ExportStats>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.exported.lock().unwrap().push(bucket.clone());
        if self.panicking.lock().unwrap().contains(bucket) {
            panic!("storage engine crashed exporting {bucket}");
        }
        if self.failing.lock().unwrap().contains(bucket) {
            writer.write_all(b"partial").await?;
            return Err(StorageError::Io(io::Error::other("value log truncated")));
        }

        let payload = self
            .payloads
            .lock()
            .unwrap()
            .get(bucket)
            .cloned()
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok(ExportStats {
            entries: 1,
            bytes: payload.len() as u64,
        })
    }
}

/// Transport that records every send and fails on demand.
#[derive(Default)]
pub struct FakeTransport {
    failing: Mutex<bool>,
    panicking: Mutex<bool>,
    sent: Mutex<Vec<(PathBuf, String)>>,
    shipped: Mutex<Vec<Vec<u8>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn set_panicking(&self, panicking: bool) {
        *self.panicking.lock().unwrap() = panicking;
    }

    pub fn sent(&self) -> Vec<(PathBuf, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// File contents as read at send time, in send order.
    pub fn shipped(&self) -> Vec<Vec<u8>> {
        self.shipped.lock().unwrap().clone()
    }
}

impl Transport for FakeTransport {
    async fn send(&self, local: &Path, remote_name: &str) -> Result<(), TransferError> {
        if *self.panicking.lock().unwrap() {
            panic!("ssh client crashed");
        }
        if *self.failing.lock().unwrap() {
            return Err(TransferError::Io {
                op: "write",
                path: remote_name.to_string(),
                source: io::Error::other("connection reset by peer"),
            });
        }
        // Missing files are fine here; several tests queue made-up paths.
        if let Ok(contents) = tokio::fs::read(local).await {
            self.shipped.lock().unwrap().push(contents);
        }
        self.sent
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote_name.to_string()));
        Ok(())
    }
}
