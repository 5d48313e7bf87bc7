//! Storage backend contract
//!
//! The orchestration layer consumes this trait and never talks to an SDK
//! directly. Implementations report failures as [`Error::Backend`] tagged
//! with the service's error code so the retry layer can classify them.
//!
//! [`Error::Backend`]: crate::Error::Backend

use std::sync::Arc;

use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Progress callback handed to the backend
///
/// Invoked with the cumulative number of bytes moved so far, possibly from a
/// backend-internal thread. Returning `false` requests cancellation; the
/// backend must stop at the next opportunity and fail with
/// [`Error::Cancelled`](crate::Error::Cancelled).
pub type ProgressFn = Arc<dyn Fn(u64) -> bool + Send + Sync>;

/// Source stream for uploads
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Destination stream for downloads
pub type ObjectWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Address of an object in the remote store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// A bucket owned by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<Timestamp>,
}

/// One object entry from a listing page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

impl ObjectSummary {
    /// Create a summary with only key and size
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified: None,
            etag: None,
            storage_class: None,
        }
    }
}

/// A common prefix ("directory") from a delimited listing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectorySummary {
    pub prefix: String,
}

/// A single page returned by `list_objects`
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub objects: Vec<ObjectSummary>,
    pub prefixes: Vec<DirectorySummary>,
    pub continuation_token: Option<String>,
    pub is_truncated: bool,
}

/// Parameters for one `list_objects` call
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub bucket: String,
    pub prefix: String,
    /// Group keys into common prefixes at this delimiter; `None` lists recursively
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub max_keys: Option<i32>,
}

/// Metadata returned by `head_object`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Extra arguments for `put_object`
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
}

/// Per-key outcome of a multi-object delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub key: String,
    /// `None` when the key was deleted, otherwise the backend error (code, message)
    pub error: Option<(String, String)>,
}

impl DeleteOutcome {
    pub fn deleted(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            error: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.error.is_none()
    }
}

/// Capability surface of an object-storage backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Every bucket visible to the credentials, across all service pages
    async fn list_buckets(&self) -> Result<Vec<BucketSummary>>;

    /// Fetch one page of a listing
    async fn list_objects(&self, request: ListRequest) -> Result<ListingPage>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta>;

    /// Stream an object into `dest`, reporting cumulative bytes to `progress`
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        dest: ObjectWriter,
        progress: ProgressFn,
    ) -> Result<()>;

    /// Upload `size` bytes from `src`, reporting cumulative bytes to `progress`
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        src: ObjectReader,
        size: u64,
        progress: ProgressFn,
        options: PutOptions,
    ) -> Result<()>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Delete up to 1000 keys in one call, returning one outcome per key
    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<Vec<DeleteOutcome>>;

    async fn copy_object(&self, src: &ObjectRef, dest: &ObjectRef) -> Result<()>;

    async fn presign_url(&self, bucket: &str, key: &str, expiry_secs: u64) -> Result<String>;

    /// Whether a failed or cancelled upload leaves no partial object behind
    ///
    /// When `false`, the transfer layer removes the partial object itself.
    fn supports_atomic_upload(&self) -> bool {
        true
    }
}
