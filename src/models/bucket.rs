//! Represents a logical bucket, an independently backed-up partition of the store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a bucket in the key-value store.
///
/// Bucket names are owned by the storage engine and are read-only to the
/// backup pipeline. They double as the stem of every backup filename, which
/// is why [`crate::services::kv_store::validate_bucket_name`] keeps them free
/// of path separators.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BucketName(String);

impl BucketName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BucketName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BucketName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for BucketName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
