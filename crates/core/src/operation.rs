//! Operation records and lifecycle events
//!
//! An [`Operation`] is the registry's view of one submitted unit of work. Its
//! state only moves forward along
//! `Queued -> Active -> {Completed, Failed, Cancelling -> Cancelled}`.

use std::path::PathBuf;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::error::ErrorDetail;
use crate::listing::Listing;
use crate::progress::AggregateProgress;
use crate::traits::{BucketSummary, ObjectRef};

/// Registry-assigned operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ListBuckets,
    List,
    Upload,
    Download,
    Delete,
    UploadDir,
    DownloadDir,
    DeleteDir,
    Copy,
    Presign,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::ListBuckets => "list_buckets",
            OperationKind::List => "list",
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::Delete => "delete",
            OperationKind::UploadDir => "upload_dir",
            OperationKind::DownloadDir => "download_dir",
            OperationKind::DeleteDir => "delete_dir",
            OperationKind::Copy => "copy",
            OperationKind::Presign => "presign",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Queued,
    Active,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal forward transition
    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Queued, Active)
                | (Queued, Cancelling)
                | (Queued, Cancelled)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Cancelling)
                | (Cancelling, Cancelled)
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationState::Queued => "queued",
            OperationState::Active => "active",
            OperationState::Cancelling => "cancelling",
            OperationState::Completed => "completed",
            OperationState::Failed => "failed",
            OperationState::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Work accepted by `WorkerManager::submit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    ListBuckets,
    List {
        bucket: String,
        prefix: String,
        /// `None` lists every key below the prefix
        delimiter: Option<String>,
    },
    Upload {
        local: PathBuf,
        bucket: String,
        key: String,
    },
    Download {
        bucket: String,
        key: String,
        local: PathBuf,
    },
    Delete {
        bucket: String,
        key: String,
    },
    UploadDir {
        local: PathBuf,
        bucket: String,
        prefix: String,
    },
    DownloadDir {
        bucket: String,
        prefix: String,
        local: PathBuf,
    },
    DeleteDir {
        bucket: String,
        prefix: String,
    },
    Copy {
        source: ObjectRef,
        dest: ObjectRef,
    },
    Presign {
        bucket: String,
        key: String,
        expiry_secs: u64,
    },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::ListBuckets => OperationKind::ListBuckets,
            OperationRequest::List { .. } => OperationKind::List,
            OperationRequest::Upload { .. } => OperationKind::Upload,
            OperationRequest::Download { .. } => OperationKind::Download,
            OperationRequest::Delete { .. } => OperationKind::Delete,
            OperationRequest::UploadDir { .. } => OperationKind::UploadDir,
            OperationRequest::DownloadDir { .. } => OperationKind::DownloadDir,
            OperationRequest::DeleteDir { .. } => OperationKind::DeleteDir,
            OperationRequest::Copy { .. } => OperationKind::Copy,
            OperationRequest::Presign { .. } => OperationKind::Presign,
        }
    }

    /// Short human-readable summary, e.g. `bucket/key -> ./file`
    pub fn description(&self) -> String {
        match self {
            OperationRequest::ListBuckets => "buckets".to_string(),
            OperationRequest::List { bucket, prefix, .. } => format!("{bucket}/{prefix}"),
            OperationRequest::Upload { local, bucket, key } => {
                format!("{} -> {bucket}/{key}", local.display())
            }
            OperationRequest::Download { bucket, key, local } => {
                format!("{bucket}/{key} -> {}", local.display())
            }
            OperationRequest::Delete { bucket, key } => format!("{bucket}/{key}"),
            OperationRequest::UploadDir {
                local,
                bucket,
                prefix,
            } => format!("{}/ -> {bucket}/{prefix}", local.display()),
            OperationRequest::DownloadDir {
                bucket,
                prefix,
                local,
            } => format!("{bucket}/{prefix} -> {}/", local.display()),
            OperationRequest::DeleteDir { bucket, prefix } => format!("{bucket}/{prefix}"),
            OperationRequest::Copy { source, dest } => format!("{source} -> {dest}"),
            OperationRequest::Presign { bucket, key, .. } => format!("{bucket}/{key}"),
        }
    }
}

/// Result payload of a completed operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationOutput {
    Buckets { buckets: Vec<BucketSummary> },
    Listing(Listing),
    Bytes { bytes: u64 },
    Aggregate(AggregateProgress),
    Url { url: String },
    None,
}

/// Snapshot of one operation as tracked by the registry
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub state: OperationState,
    pub description: String,
    /// Percentage, held at 99 or below until the operation completes
    pub progress: u8,
    /// Latest status line, e.g. the file currently in flight
    pub status: String,
    pub bytes_total: u64,
    pub bytes_transferred: u64,
    pub bytes_per_sec: u64,
    pub submitted_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OperationOutput>,
}

impl Operation {
    pub fn new(id: OperationId, request: &OperationRequest) -> Self {
        Self {
            id,
            kind: request.kind(),
            state: OperationState::Queued,
            description: request.description(),
            progress: 0,
            status: "Queued".to_string(),
            bytes_total: 0,
            bytes_transferred: 0,
            bytes_per_sec: 0,
            submitted_at: Timestamp::now(),
            start_time: None,
            end_time: None,
            error: None,
            output: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Notifications published by the worker manager
#[derive(Debug, Clone)]
pub enum OperationEvent {
    /// The operation left the queue and holds a worker slot
    Started { id: OperationId, kind: OperationKind },
    Progress {
        id: OperationId,
        percent: u8,
        status: String,
        bytes_transferred: u64,
        bytes_total: u64,
        bytes_per_sec: u64,
    },
    /// A backend call failed transiently and is about to be retried
    Retrying {
        id: OperationId,
        operation: String,
        retry: u32,
        delay_ms: u64,
        code: String,
    },
    /// Terminal state reached; published exactly once per operation
    Settled {
        id: OperationId,
        state: OperationState,
        output: Option<OperationOutput>,
        error: Option<ErrorDetail>,
    },
    /// The settled operation was evicted from the registry
    Removed { id: OperationId },
}

impl OperationEvent {
    pub fn id(&self) -> OperationId {
        match self {
            OperationEvent::Started { id, .. }
            | OperationEvent::Progress { id, .. }
            | OperationEvent::Retrying { id, .. }
            | OperationEvent::Settled { id, .. }
            | OperationEvent::Removed { id } => *id,
        }
    }
}
