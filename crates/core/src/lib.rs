//! sx-core: transfer orchestration for S3-compatible object storage
//!
//! This crate holds everything between a caller and a storage SDK:
//! - Retry with error classification and deterministic backoff
//! - Paginated listing
//! - Single-object and directory transfers with clamped progress
//! - A bounded worker pool with an operation registry and cooperative cancellation
//! - Configuration management
//!
//! It does not depend on any SDK. Backends implement [`StorageBackend`];
//! [`MemoryBackend`] is a complete in-process implementation.

pub mod config;
pub mod directory;
pub mod error;
pub mod listing;
pub mod manager;
pub mod memory;
pub mod operation;
pub mod progress;
pub mod retry;
pub mod traits;
pub mod transfer;

pub use config::{BackendConfig, Config, ConfigManager};
pub use directory::{DirectoryObserver, DirectoryTransfer};
pub use error::{ClassifiedError, Error, ErrorClass, ErrorDetail, Result};
pub use listing::{Listing, PaginatedLister};
pub use manager::{OperationRegistry, WorkerManager};
pub use memory::MemoryBackend;
pub use operation::{
    Operation, OperationEvent, OperationId, OperationKind, OperationOutput, OperationRequest,
    OperationState,
};
pub use progress::{AggregateProgress, ProgressThrottle, TransferProgress};
pub use retry::{RetryBuilder, RetryExecutor, RetryNotice, RetryPolicy};
pub use traits::{
    BucketSummary, DeleteOutcome, DirectorySummary, ListRequest, ListingPage, ObjectMeta, ObjectReader,
    ObjectRef, ObjectSummary, ObjectWriter, ProgressFn, PutOptions, StorageBackend,
};
pub use transfer::{ObjectTransfer, TransferObserver};
