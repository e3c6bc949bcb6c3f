//! src/services/kv_store.rs
//!
//! KvStore: the key-value storage engine the backup pipeline protects.
//! Buckets and their entries live in SQLite; an export runs inside a single
//! read transaction so the produced stream is a consistent point-in-time
//! snapshot of one bucket.
//!
//! Export stream layout:
//!
//! ```text
//! MAGIC (8 bytes)
//! repeated: key_len u32 BE | key | value_len u64 BE | value
//! END_MARKER u32 BE | entry_count u64 BE
//! ```

use crate::models::bucket::BucketName;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use futures::{TryStreamExt, future::try_join};
use sqlx::SqlitePool;
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::debug;

pub const EXPORT_MAGIC: &[u8; 8] = b"KVBKUP01";
pub const EXPORT_END_MARKER: u32 = u32::MAX;

/// Encoded entries are handed to the writer in batches of roughly this size.
const EXPORT_BATCH_BYTES: usize = 256 * 1024;

const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const RESERVED_BUCKET_NAMES: [&str; 4] = ["status", "metrics", "admin", "api"];

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("key of {0} bytes is too large to export")]
    KeyTooLarge(usize),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Totals for one export stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Clone)]
pub struct KvStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl KvStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Register a bucket. Existing buckets are left untouched.
    pub async fn ensure_bucket(&self, name: &str) -> StorageResult<BucketName> {
        validate_bucket_name(name)?;
        sqlx::query(
            "INSERT INTO buckets (name, created_at) VALUES (?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(BucketName::from(name))
    }

    /// Insert or replace one entry.
    #[cfg(test)]
    pub async fn put(&self, bucket: &BucketName, key: &[u8], value: &[u8]) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO entries (bucket, key, value, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(bucket, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
        )
        .bind(bucket.as_str())
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Every bucket currently known to the store, ordered by name.
    pub async fn list_buckets(&self) -> StorageResult<Vec<BucketName>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM buckets ORDER BY name")
            .fetch_all(&*self.db)
            .await?;
        Ok(names.into_iter().map(BucketName::from).collect())
    }

    /// Stream a consistent snapshot of `bucket` into `writer`.
    ///
    /// Rows are read inside one transaction and encoded into batches; at most
    /// `concurrency` encoded batches wait for the writer at any time, which
    /// bounds memory use on large buckets. The writer is flushed but not
    /// closed.
    pub async fn export<W>(
        &self,
        bucket: &BucketName,
        writer: &mut W,
        concurrency: usize,
    ) -> StorageResult<ExportStats>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut tx = self.db.begin().await?;
        let known: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buckets WHERE name = ?")
            .bind(bucket.as_str())
            .fetch_one(&mut *tx)
            .await?;
        if known == 0 {
            return Err(StorageError::BucketNotFound(bucket.to_string()));
        }

        let (batches, mut pending) = mpsc::channel::<Bytes>(concurrency.max(1));

        let produce = async move {
            let mut entries: u64 = 0;
            let mut batch = BytesMut::with_capacity(EXPORT_BATCH_BYTES);
            batch.put_slice(EXPORT_MAGIC);
            {
                let mut rows = sqlx::query_as::<_, (Vec<u8>, Vec<u8>)>(
                    "SELECT key, value FROM entries WHERE bucket = ? ORDER BY key",
                )
                .bind(bucket.as_str())
                .fetch(&mut *tx);

                while let Some((key, value)) = rows.try_next().await? {
                    let key_len = u32::try_from(key.len())
                        .map_err(|_| StorageError::KeyTooLarge(key.len()))?;
                    batch.put_u32(key_len);
                    batch.put_slice(&key);
                    batch.put_u64(value.len() as u64);
                    batch.put_slice(&value);
                    entries += 1;

                    if batch.len() >= EXPORT_BATCH_BYTES
                        && batches.send(batch.split().freeze()).await.is_err()
                    {
                        // Writer side stopped; its error is reported by `consume`.
                        return Ok(entries);
                    }
                }
            }
            batch.put_u32(EXPORT_END_MARKER);
            batch.put_u64(entries);
            let _ = batches.send(batch.freeze()).await;
            tx.rollback().await?;
            Ok::<u64, StorageError>(entries)
        };

        let consume = async {
            let mut bytes: u64 = 0;
            while let Some(chunk) = pending.recv().await {
                writer.write_all(&chunk).await?;
                bytes += chunk.len() as u64;
            }
            writer.flush().await?;
            Ok::<u64, StorageError>(bytes)
        };

        let (entries, bytes) = try_join(produce, consume).await?;
        debug!(bucket = %bucket, entries, bytes, "export stream finished");
        Ok(ExportStats { entries, bytes })
    }
}

/// Create the schema if it does not exist yet.
///
/// The statements are idempotent, so this runs on every start.
pub async fn apply_schema(db: &SqlitePool) -> StorageResult<()> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    debug!("Running {} schema statements", statements.len());
    for stmt in statements {
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}

/// Validate a bucket name.
///
/// Bucket names become backup filenames on local disk and on the remote
/// host, so they are restricted to:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens, underscores
/// - no leading dot or hyphen, no `..`
/// - none of the names reserved by the HTTP surface
pub fn validate_bucket_name(name: &str) -> StorageResult<()> {
    let invalid = |reason: &str| StorageError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.trim() != name {
        return Err(invalid("cannot begin or end with whitespace"));
    }
    if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-' | '_'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, hyphens, and underscores",
        ));
    }
    if name.starts_with('.') || name.starts_with('-') || name.contains("..") {
        return Err(invalid("must not start with a dot or hyphen or contain `..`"));
    }
    if RESERVED_BUCKET_NAMES.contains(&name) {
        return Err(invalid("name is reserved"));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_store() -> KvStore {
    let db = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    apply_schema(&db).await.unwrap();
    KvStore::new(Arc::new(db))
}
