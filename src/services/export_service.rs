//! ExportPipeline: turns one bucket into a backup file on local disk.
//!
//! An export marks the bucket Running, streams a consistent snapshot from the
//! storage engine into `<backup_dir>/<bucket>[_DD][_HH].bak.partial`, renames
//! it over the final name once synced, optionally compresses it, and only
//! then marks the bucket Completed and hands the file to the replication
//! queue. Any failure marks the bucket Failed, removes the partial file and
//! leaves the previous export in place, so a job still pointing at that path
//! never ships a partial export. Failures are not retried here; the next
//! scheduled pass is the retry.

use super::{
    clock::Clock,
    compress::{CompressError, Compressor},
    job_queue::JobQueue,
    kv_store::{ExportStats, KvStore, StorageError, StorageResult},
    naming::{SuffixPolicy, backup_file_name},
    status_registry::{ExportOutput, StatusRegistry},
};
use crate::models::bucket::BucketName;
use md5::Context;
use std::{
    ffi::OsString,
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Instant,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
};
use tracing::{info, warn};

/// The storage engine as seen by the export pipeline.
pub trait ExportSource: Send + Sync + 'static {
    /// Buckets that currently exist.
    fn list_buckets(&self) -> impl Future<Output = StorageResult<Vec<BucketName>>> + Send;

    /// Stream a consistent snapshot of `bucket` into `writer`.
    fn export<W>(
        &self,
        bucket: &BucketName,
        writer: &mut W,
        concurrency: usize,
    ) -> impl Future<Output = StorageResult<ExportStats>> + Send
    where
        W: AsyncWrite + Unpin + Send;
}

impl ExportSource for KvStore {
    async fn list_buckets(&self) -> StorageResult<Vec<BucketName>> {
        KvStore::list_buckets(self).await
    }

    async fn export<W>(
        &self,
        bucket: &BucketName,
        writer: &mut W,
        concurrency: usize,
    ) -> StorageResult<ExportStats>
    where
        W: AsyncWrite + Unpin + Send,
    {
        KvStore::export(self, bucket, writer, concurrency).await
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("error creating backup file {}: {source}", path.display())]
    Create { path: PathBuf, source: io::Error },
    #[error("error creating backup: {0}")]
    Stream(#[from] StorageError),
    #[error("error closing backup file {}: {source}", path.display())]
    Close { path: PathBuf, source: io::Error },
    #[error("error moving backup into place at {}: {source}", path.display())]
    Finalize { path: PathBuf, source: io::Error },
    #[error("error compressing backup: {0}")]
    Compress(#[from] CompressError),
}

#[derive(Clone, Debug)]
pub struct ExportSettings {
    /// Directory that receives the backup files. Must exist.
    pub backup_dir: PathBuf,
    pub suffix: SuffixPolicy,
    /// Concurrency hint handed to the storage engine.
    pub concurrency: usize,
    /// Set when finished files are compressed.
    pub compressor: Option<Compressor>,
}

pub struct ExportPipeline<S> {
    source: Arc<S>,
    statuses: Arc<StatusRegistry>,
    /// `None` when replication is disabled.
    jobs: Option<Arc<JobQueue>>,
    clock: Arc<dyn Clock>,
    settings: ExportSettings,
}

impl<S: ExportSource> ExportPipeline<S> {
    pub fn new(
        source: Arc<S>,
        statuses: Arc<StatusRegistry>,
        jobs: Option<Arc<JobQueue>>,
        clock: Arc<dyn Clock>,
        settings: ExportSettings,
    ) -> Self {
        Self {
            source,
            statuses,
            jobs,
            clock,
            settings,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn statuses(&self) -> &StatusRegistry {
        &self.statuses
    }

    /// Export one bucket, recording the outcome in the status registry.
    pub async fn export_bucket(&self, bucket: &BucketName) {
        let started = Instant::now();
        self.statuses.mark_running(bucket, self.clock.now());

        match self.produce(bucket).await {
            Ok(output) => {
                info!(
                    bucket = %bucket,
                    file = %output.path.display(),
                    bytes = output.bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "backup completed"
                );
                self.statuses
                    .mark_completed(bucket, self.clock.now(), &output);
                if let Some(jobs) = &self.jobs {
                    jobs.add_job(bucket, output.path);
                }
            }
            Err(err) => {
                warn!(bucket = %bucket, "backup failed: {err}");
                self.statuses
                    .mark_failed(bucket, self.clock.now(), err.to_string());
            }
        }
    }

    async fn produce(&self, bucket: &BucketName) -> Result<ExportOutput, ExportError> {
        let name = backup_file_name(bucket, self.settings.suffix, self.clock.local_now());
        let path = self.settings.backup_dir.join(name);

        // The previous export at `path` may still be queued for transfer, so
        // it is only replaced once the new stream is complete on disk.
        let partial = partial_path(&path);
        let (bytes, digest) = match self.stream_to(bucket, &partial).await {
            Ok(written) => written,
            Err(err) => {
                discard(&partial).await;
                return Err(err);
            }
        };
        if let Err(source) = fs::rename(&partial, &path).await {
            discard(&partial).await;
            return Err(ExportError::Finalize { path, source });
        }

        let path = match &self.settings.compressor {
            Some(compressor) => {
                self.statuses.mark_zipping(bucket);
                compressor.compress(&path).await?
            }
            None => path,
        };

        Ok(ExportOutput {
            path,
            bytes,
            digest,
        })
    }

    /// Stream the bucket into `target` and sync it. Returns size and digest.
    async fn stream_to(
        &self,
        bucket: &BucketName,
        target: &Path,
    ) -> Result<(u64, String), ExportError> {
        let file = File::create(target)
            .await
            .map_err(|source| ExportError::Create {
                path: target.to_path_buf(),
                source,
            })?;
        let mut writer = DigestWriter::new(BufWriter::new(file));
        self.source
            .export(bucket, &mut writer, self.settings.concurrency)
            .await?;

        let close = |source| ExportError::Close {
            path: target.to_path_buf(),
            source,
        };
        writer.flush().await.map_err(close)?;
        let (buffered, bytes, digest) = writer.finish();
        buffered.into_inner().sync_all().await.map_err(close)?;
        Ok((bytes, digest))
    }
}

/// `<path>.partial`, the sibling an export is streamed into.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".partial");
    PathBuf::from(name)
}

async fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove partial export {}: {}", path.display(), err);
        }
    }
}

/// Counts and hashes everything written through it.
struct DigestWriter<W> {
    inner: W,
    digest: Context,
    bytes: u64,
}

impl<W> DigestWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            digest: Context::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (W, u64, String) {
        (self.inner, self.bytes, format!("{:x}", self.digest.compute()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DigestWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.digest.consume(&buf[..n]);
                this.bytes += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
