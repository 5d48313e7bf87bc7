//! Operation registry and bounded worker pool
//!
//! [`WorkerManager`] admits submitted operations into a fixed number of
//! worker slots. Each admitted operation runs on one task for its whole
//! lifetime, including the per-file transfers of a directory operation, so
//! total concurrency is bounded by the pool size rather than by file count.
//!
//! The [`OperationRegistry`] map is the only state shared between workers.
//! Progress, retry and terminal notifications fan out on a broadcast channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use jiff::Timestamp;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Config;
use crate::directory::{DirectoryObserver, DirectoryTransfer};
use crate::error::{Error, Result};
use crate::listing::PaginatedLister;
use crate::operation::{
    Operation, OperationEvent, OperationId, OperationOutput, OperationRequest, OperationState,
};
use crate::progress::{AggregateProgress, MAX_IN_FLIGHT_PERCENT, ProgressThrottle, TransferProgress};
use crate::retry::{RetryExecutor, RetryNotice, RetryPolicy};
use crate::traits::StorageBackend;
use crate::transfer::{ObjectTransfer, TransferObserver};

const EVENT_CAPACITY: usize = 1024;

type SettledSender = Arc<watch::Sender<Option<Operation>>>;

struct Entry {
    op: Operation,
    cancel: CancellationToken,
    settled: SettledSender,
}

/// Synchronized map of operations by id
#[derive(Default)]
pub struct OperationRegistry {
    entries: Mutex<HashMap<OperationId, Entry>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, op: Operation, cancel: CancellationToken) {
        let (settled, _) = watch::channel(None);
        self.entries.lock().insert(
            op.id,
            Entry {
                op,
                cancel,
                settled: Arc::new(settled),
            },
        );
    }

    pub fn get(&self, id: OperationId) -> Option<Operation> {
        self.entries.lock().get(&id).map(|e| e.op.clone())
    }

    /// Snapshots of all tracked operations in submission order
    pub fn list(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self.entries.lock().values().map(|e| e.op.clone()).collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    /// Operations holding a worker slot
    pub fn active_count(&self) -> usize {
        self.count(|s| matches!(s, OperationState::Active | OperationState::Cancelling))
    }

    pub fn queued_count(&self) -> usize {
        self.count(|s| s == OperationState::Queued)
    }

    fn count(&self, pred: impl Fn(OperationState) -> bool) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| pred(e.op.state))
            .count()
    }

    /// Move a queued operation into its worker slot
    fn activate(&self, id: OperationId) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return false;
        };
        if !entry.op.state.can_transition_to(OperationState::Active) {
            return false;
        }
        entry.op.state = OperationState::Active;
        entry.op.start_time = Some(Timestamp::now());
        entry.op.status = "Running".to_string();
        true
    }

    /// Flag an operation for cancellation and trip its token
    ///
    /// Returns `false` for unknown, terminal or already cancelling operations.
    fn request_cancel(&self, id: OperationId) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return false;
        };
        if !entry.op.state.can_transition_to(OperationState::Cancelling) {
            return false;
        }
        entry.op.state = OperationState::Cancelling;
        entry.op.status = "Cancelling".to_string();
        entry.cancel.cancel();
        true
    }

    /// Apply `f` to a live operation; terminal records are frozen
    fn update(&self, id: OperationId, f: impl FnOnce(&mut Operation)) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if !entry.op.is_terminal() => {
                f(&mut entry.op);
                true
            }
            _ => false,
        }
    }

    /// Record the terminal state of an operation
    ///
    /// Returns `None` if the operation is unknown or already settled. An
    /// operation that was cancelling always settles as cancelled.
    fn settle(
        &self,
        id: OperationId,
        outcome: Result<OperationOutput>,
    ) -> Option<(Operation, SettledSender)> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id)?;
        let op = &mut entry.op;
        if op.is_terminal() {
            return None;
        }

        let cancelling = op.state == OperationState::Cancelling;
        match outcome {
            _ if cancelling => {
                op.state = OperationState::Cancelled;
            }
            Ok(output) => {
                op.state = OperationState::Completed;
                op.progress = 100;
                op.bytes_transferred = op.bytes_total;
                op.output = Some(output);
            }
            Err(e) if e.is_cancelled() => {
                op.state = OperationState::Cancelled;
            }
            Err(e) => {
                op.state = OperationState::Failed;
                op.error = Some(e.detail());
            }
        }
        op.status = match &op.error {
            Some(detail) => format!("Failed: {detail}"),
            None => op.state.to_string(),
        };
        op.end_time = Some(Timestamp::now());

        Some((op.clone(), entry.settled.clone()))
    }

    /// Drop a settled operation; live operations are never removed
    pub fn remove(&self, id: OperationId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&id) {
            Some(entry) if entry.op.is_terminal() => {
                entries.remove(&id);
                true
            }
            _ => false,
        }
    }

    fn live_ids(&self) -> Vec<OperationId> {
        let mut ids: Vec<OperationId> = self
            .entries
            .lock()
            .values()
            .filter(|e| !e.op.is_terminal())
            .map(|e| e.op.id)
            .collect();
        ids.sort();
        ids
    }

    fn waiter(&self, id: OperationId) -> Option<watch::Receiver<Option<Operation>>> {
        self.entries.lock().get(&id).map(|e| e.settled.subscribe())
    }
}

/// Runs submitted operations on a bounded pool of worker slots
#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn StorageBackend>,
    policy: Arc<RetryPolicy>,
    registry: Arc<OperationRegistry>,
    slots: Arc<Semaphore>,
    events: broadcast::Sender<OperationEvent>,
    next_id: AtomicU64,
    page_size: i32,
    max_pages: usize,
    delete_batch: usize,
    retry_deadline: Option<Duration>,
    ttl: Option<Duration>,
    progress_interval: Duration,
}

impl WorkerManager {
    /// Create a manager over `backend`; the configuration is validated first
    pub fn new(config: &Config, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::debug!(
            max_concurrent = config.max_concurrent_operations,
            max_retries = config.max_retries,
            ttl_secs = config.completed_operation_ttl,
            "Worker manager ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                policy: Arc::new(config.retry_policy()),
                registry: Arc::new(OperationRegistry::new()),
                slots: Arc::new(Semaphore::new(config.max_concurrent_operations)),
                events,
                next_id: AtomicU64::new(1),
                page_size: config.page_size,
                max_pages: config.max_pages,
                delete_batch: config.effective_delete_batch(),
                retry_deadline: config.retry_deadline(),
                ttl: config.completed_ttl(),
                progress_interval: config.progress_interval(),
            }),
        })
    }

    /// Queue an operation and return its id
    ///
    /// The operation starts as soon as a worker slot is free.
    pub fn submit(&self, request: OperationRequest) -> OperationId {
        let id = OperationId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        let op = Operation::new(id, &request);
        tracing::debug!(operation_id = %id, kind = %op.kind, description = %op.description, "Operation queued");
        self.inner.registry.insert(op, cancel.clone());

        let span = tracing::info_span!("operation", id = %id, kind = %request.kind());
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.drive(id, request, cancel).await }.instrument(span));
        id
    }

    /// Request cooperative cancellation
    ///
    /// Returns `false` when the operation is unknown, already cancelling or
    /// already settled; a settled operation keeps its state.
    pub fn cancel(&self, id: OperationId) -> bool {
        let requested = self.inner.registry.request_cancel(id);
        if requested {
            tracing::info!(operation_id = %id, "Cancellation requested");
        }
        requested
    }

    /// Cancel every live operation, returning how many were flagged
    pub fn cancel_all(&self) -> usize {
        self.inner
            .registry
            .live_ids()
            .into_iter()
            .filter(|id| self.cancel(*id))
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry.active_count()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.registry.queued_count()
    }

    pub fn get(&self, id: OperationId) -> Option<Operation> {
        self.inner.registry.get(id)
    }

    pub fn list(&self) -> Vec<Operation> {
        self.inner.registry.list()
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.inner.registry
    }

    /// Remove a settled operation before its TTL expires
    pub fn remove(&self, id: OperationId) -> bool {
        let removed = self.inner.registry.remove(id);
        if removed {
            let _ = self.inner.events.send(OperationEvent::Removed { id });
        }
        removed
    }

    /// Wait for an operation to settle and return its final snapshot
    ///
    /// Returns `None` for ids the registry does not know.
    pub async fn wait(&self, id: OperationId) -> Option<Operation> {
        let mut rx = self.inner.registry.waiter(id)?;
        let settled = rx.wait_for(|op| op.is_some()).await.ok()?;
        (*settled).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    async fn drive(
        self: Arc<Self>,
        id: OperationId,
        request: OperationRequest,
        cancel: CancellationToken,
    ) {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.slots.clone().acquire_owned() => permit.ok(),
        };
        // Cancelled while queued: settle without taking a slot
        let Some(_permit) = permit else {
            self.finish(id, Err(Error::Cancelled));
            return;
        };
        if !self.registry.activate(id) {
            self.finish(id, Err(Error::Cancelled));
            return;
        }

        let _ = self.events.send(OperationEvent::Started {
            id,
            kind: request.kind(),
        });
        tracing::info!(description = %request.description(), "Operation started");

        let outcome = self.execute(id, &request, &cancel).await;
        self.finish(id, outcome);
    }

    async fn execute(
        &self,
        id: OperationId,
        request: &OperationRequest,
        cancel: &CancellationToken,
    ) -> Result<OperationOutput> {
        let reporter = Arc::new(ProgressReporter::new(
            id,
            self.registry.clone(),
            self.events.clone(),
            self.progress_interval,
        ));
        let retry = self.retry_executor(id);
        let transfer = ObjectTransfer::new(self.backend.clone(), retry.clone());

        match request {
            OperationRequest::ListBuckets => {
                reporter.status("Listing buckets");
                let buckets = self.lister(retry).list_buckets(cancel).await?;
                Ok(OperationOutput::Buckets { buckets })
            }
            OperationRequest::List {
                bucket,
                prefix,
                delimiter,
            } => {
                reporter.status("Listing");
                let lister = self.lister(retry);
                let listing = match delimiter {
                    Some(d) => lister.list(bucket, prefix, d, cancel).await?,
                    None => lister.list_recursive(bucket, prefix, cancel).await?,
                };
                Ok(OperationOutput::Listing(listing))
            }
            OperationRequest::Upload { local, bucket, key } => {
                let observer = reporter.transfer_observer("Uploading");
                let bytes = transfer.upload(local, bucket, key, cancel, observer).await?;
                Ok(OperationOutput::Bytes { bytes })
            }
            OperationRequest::Download { bucket, key, local } => {
                let observer = reporter.transfer_observer("Downloading");
                let bytes = transfer
                    .download(bucket, key, local, cancel, observer)
                    .await?;
                Ok(OperationOutput::Bytes { bytes })
            }
            OperationRequest::Delete { bucket, key } => {
                transfer.delete(bucket, key, cancel).await?;
                Ok(OperationOutput::None)
            }
            OperationRequest::UploadDir {
                local,
                bucket,
                prefix,
            } => {
                let agg = self
                    .directory(transfer, retry)
                    .upload_directory(local, bucket, prefix, cancel, reporter.directory_observer())
                    .await?;
                Ok(OperationOutput::Aggregate(agg))
            }
            OperationRequest::DownloadDir {
                bucket,
                prefix,
                local,
            } => {
                let agg = self
                    .directory(transfer, retry)
                    .download_directory(bucket, prefix, local, cancel, reporter.directory_observer())
                    .await?;
                Ok(OperationOutput::Aggregate(agg))
            }
            OperationRequest::DeleteDir { bucket, prefix } => {
                let agg = self
                    .directory(transfer, retry)
                    .delete_directory(bucket, prefix, cancel, reporter.directory_observer())
                    .await?;
                Ok(OperationOutput::Aggregate(agg))
            }
            OperationRequest::Copy { source, dest } => {
                let observer = reporter.transfer_observer("Copying");
                let bytes = transfer.copy(source, dest, cancel, observer).await?;
                Ok(OperationOutput::Bytes { bytes })
            }
            OperationRequest::Presign {
                bucket,
                key,
                expiry_secs,
            } => {
                let url = transfer.presign(bucket, key, *expiry_secs, cancel).await?;
                Ok(OperationOutput::Url { url })
            }
        }
    }

    fn finish(&self, id: OperationId, outcome: Result<OperationOutput>) {
        if let Err(e) = &outcome
            && !e.is_cancelled()
        {
            tracing::warn!(error = %e, "Operation failed");
        }

        let Some((op, settled)) = self.registry.settle(id, outcome) else {
            return;
        };
        tracing::info!(state = %op.state, "Operation settled");

        let _ = self.events.send(OperationEvent::Settled {
            id,
            state: op.state,
            output: op.output.clone(),
            error: op.error.clone(),
        });
        settled.send_replace(Some(op));

        if let Some(ttl) = self.ttl {
            let registry = self.registry.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if registry.remove(id) {
                    tracing::debug!(operation_id = %id, "Evicted settled operation");
                    let _ = events.send(OperationEvent::Removed { id });
                }
            });
        }
    }

    fn retry_executor(&self, id: OperationId) -> RetryExecutor {
        let registry = self.registry.clone();
        let events = self.events.clone();
        let deadline = self.retry_deadline.map(|d| Instant::now() + d);

        RetryExecutor::new(self.policy.clone())
            .with_deadline(deadline)
            .with_observer(Arc::new(move |notice: &RetryNotice| {
                registry.update(id, |op| {
                    op.status = format!(
                        "Retrying {} after {} (retry {})",
                        notice.operation, notice.code, notice.retry
                    );
                });
                let _ = events.send(OperationEvent::Retrying {
                    id,
                    operation: notice.operation.clone(),
                    retry: notice.retry,
                    delay_ms: notice.delay.as_millis() as u64,
                    code: notice.code.clone(),
                });
            }))
    }

    fn lister(&self, retry: RetryExecutor) -> PaginatedLister {
        PaginatedLister::new(self.backend.clone(), retry, self.page_size, self.max_pages)
    }

    fn directory(&self, transfer: ObjectTransfer, retry: RetryExecutor) -> DirectoryTransfer {
        DirectoryTransfer::new(transfer, self.lister(retry), self.delete_batch)
    }
}

/// Publishes throttled progress for one operation
struct ProgressReporter {
    id: OperationId,
    registry: Arc<OperationRegistry>,
    events: broadcast::Sender<OperationEvent>,
    throttle: Mutex<ProgressThrottle>,
}

impl ProgressReporter {
    fn new(
        id: OperationId,
        registry: Arc<OperationRegistry>,
        events: broadcast::Sender<OperationEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            id,
            registry,
            events,
            throttle: Mutex::new(ProgressThrottle::new(interval)),
        }
    }

    fn status(&self, status: &str) {
        self.registry.update(self.id, |op| op.status = status.to_string());
    }

    fn report(&self, percent: u8, transferred: u64, total: u64, status: &str) {
        // 100 is reserved for the settled record
        let percent = percent.min(MAX_IN_FLIGHT_PERCENT);
        let (percent, bytes_per_sec) = {
            let mut throttle = self.throttle.lock();
            let Some(percent) = throttle.admit(percent) else {
                return;
            };
            (percent, throttle.throughput(transferred))
        };
        let transferred = transferred.min(total);

        let live = self.registry.update(self.id, |op| {
            op.progress = percent;
            op.bytes_total = total;
            op.bytes_transferred = transferred;
            op.bytes_per_sec = bytes_per_sec;
            op.status = status.to_string();
        });
        if !live {
            return;
        }

        let _ = self.events.send(OperationEvent::Progress {
            id: self.id,
            percent,
            status: status.to_string(),
            bytes_transferred: transferred,
            bytes_total: total,
            bytes_per_sec,
        });
    }

    fn transfer_observer(self: &Arc<Self>, verb: &'static str) -> TransferObserver {
        let reporter = self.clone();
        Arc::new(move |p: TransferProgress| {
            reporter.report(p.percent, p.transferred, p.total, verb);
            true
        })
    }

    fn directory_observer(self: &Arc<Self>) -> DirectoryObserver {
        let reporter = self.clone();
        Arc::new(move |agg: &AggregateProgress, item: &str| {
            let status = if item.is_empty() {
                format!("{} file(s) to process", agg.total_files)
            } else {
                format!(
                    "{item} ({}/{} done)",
                    agg.completed_files, agg.total_files
                )
            };
            reporter.report(agg.percent(), agg.transferred_bytes, agg.total_bytes, &status);
        })
    }
}
