//! Single object transfers
//!
//! Upload, download, delete, copy and presign of one object. Backend progress
//! callbacks are translated into clamped [`TransferProgress`] updates; the
//! observer's return value and the cancellation token are both checked inside
//! the callback so a transfer stops at the backend's next chunk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::progress::TransferProgress;
use crate::retry::RetryExecutor;
use crate::traits::{ObjectRef, ProgressFn, PutOptions, StorageBackend};

/// Longest presigned URL lifetime accepted by S3 (7 days)
pub const MAX_PRESIGN_EXPIRY_SECS: u64 = 604_800;

/// Receives progress of one transfer; returning `false` requests cancellation
pub type TransferObserver = Arc<dyn Fn(TransferProgress) -> bool + Send + Sync>;

/// Observer that ignores updates
pub fn silent() -> TransferObserver {
    Arc::new(|_| true)
}

/// Either side of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    Remote(ObjectRef),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Local(path) => write!(f, "{}", path.display()),
            Endpoint::Remote(obj) => write!(f, "{obj}"),
        }
    }
}

/// One file's worth of work
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub source: Endpoint,
    pub dest: Endpoint,
    /// Size known from a prior scan, if any
    pub size: Option<u64>,
    pub cancel: CancellationToken,
}

/// Performs single-object operations through a [`RetryExecutor`]
#[derive(Clone)]
pub struct ObjectTransfer {
    backend: Arc<dyn StorageBackend>,
    retry: RetryExecutor,
}

impl ObjectTransfer {
    pub fn new(backend: Arc<dyn StorageBackend>, retry: RetryExecutor) -> Self {
        Self { backend, retry }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Run a task by dispatching on its endpoints
    pub async fn run(&self, task: &TransferTask, observer: TransferObserver) -> Result<u64> {
        match (&task.source, &task.dest) {
            (Endpoint::Local(path), Endpoint::Remote(obj)) => {
                self.upload(path, &obj.bucket, &obj.key, &task.cancel, observer)
                    .await
            }
            (Endpoint::Remote(obj), Endpoint::Local(path)) => {
                self.download(&obj.bucket, &obj.key, path, &task.cancel, observer)
                    .await
            }
            (Endpoint::Remote(src), Endpoint::Remote(dest)) => {
                self.copy(src, dest, &task.cancel, observer).await
            }
            (Endpoint::Local(_), Endpoint::Local(_)) => Err(Error::InvalidPath(
                "local to local transfers are not supported".into(),
            )),
        }
    }

    /// Upload a local file, returning the number of bytes sent
    pub async fn upload(
        &self,
        local: &Path,
        bucket: &str,
        key: &str,
        cancel: &CancellationToken,
        observer: TransferObserver,
    ) -> Result<u64> {
        let meta = tokio::fs::metadata(local).await?;
        if !meta.is_file() {
            return Err(Error::InvalidPath(format!(
                "{} is not a regular file",
                local.display()
            )));
        }
        let total = meta.len();
        let path_str = local.display().to_string();
        let details = [("bucket", bucket), ("key", key), ("path", path_str.as_str())];

        if !observer(TransferProgress::in_flight(0, total)) || cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let options = PutOptions {
            content_type: mime_guess::from_path(local)
                .first()
                .map(|m| m.essence_str().to_string()),
        };

        tracing::debug!(bucket, key, size = total, path = %local.display(), "Uploading");
        let high_water = Arc::new(AtomicU64::new(0));
        let written = Arc::new(AtomicBool::new(false));
        let result = self
            .retry
            .execute("upload", &details, cancel, || {
                let backend = self.backend.clone();
                let progress = track_writes(
                    backend_progress(total, high_water.clone(), cancel.clone(), observer.clone()),
                    written.clone(),
                );
                let options = options.clone();
                async move {
                    let file = tokio::fs::File::open(local).await?;
                    backend
                        .put_object(bucket, key, Box::new(file), total, progress, options)
                        .await
                }
            })
            .await;

        if let Err(e) = result {
            // An attempt that never sent a byte left any existing object intact
            if !self.backend.supports_atomic_upload() && written.load(Ordering::Relaxed) {
                self.remove_partial_object(bucket, key).await;
            }
            return Err(e);
        }

        observer(TransferProgress::complete(total));
        Ok(total)
    }

    /// Download an object to a local file, returning the number of bytes received
    ///
    /// On failure or cancellation the local file is removed.
    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        local: &Path,
        cancel: &CancellationToken,
        observer: TransferObserver,
    ) -> Result<u64> {
        let path_str = local.display().to_string();
        let details = [("bucket", bucket), ("key", key), ("path", path_str.as_str())];

        let meta = self
            .retry
            .execute("head_object", &details, cancel, || {
                self.backend.head_object(bucket, key)
            })
            .await?;
        let total = meta.size;

        if !observer(TransferProgress::in_flight(0, total)) || cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(parent) = local.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::debug!(bucket, key, size = total, path = %local.display(), "Downloading");
        let high_water = Arc::new(AtomicU64::new(0));
        let result = self
            .retry
            .execute("download", &details, cancel, || {
                let backend = self.backend.clone();
                let progress =
                    backend_progress(total, high_water.clone(), cancel.clone(), observer.clone());
                async move {
                    // Each attempt starts from an empty file
                    let file = tokio::fs::File::create(local).await?;
                    backend
                        .get_object(bucket, key, Box::new(file), progress)
                        .await
                }
            })
            .await;

        let result = match result {
            Ok(()) => verify_size(local, total).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            remove_partial_file(local).await;
            return Err(e);
        }

        observer(TransferProgress::complete(total));
        Ok(total)
    }

    /// Store a zero-byte directory marker at `key`
    pub async fn put_marker(&self, bucket: &str, key: &str, cancel: &CancellationToken) -> Result<()> {
        let details = [("bucket", bucket), ("key", key)];
        self.retry
            .execute("put_marker", &details, cancel, || {
                self.backend.put_object(
                    bucket,
                    key,
                    Box::new(tokio::io::empty()),
                    0,
                    Arc::new(|_: u64| true),
                    PutOptions::default(),
                )
            })
            .await
    }

    pub async fn delete(&self, bucket: &str, key: &str, cancel: &CancellationToken) -> Result<()> {
        let details = [("bucket", bucket), ("key", key)];
        self.retry
            .execute("delete_object", &details, cancel, || {
                self.backend.delete_object(bucket, key)
            })
            .await
    }

    /// Server-side copy, returning the size of the copied object
    pub async fn copy(
        &self,
        src: &ObjectRef,
        dest: &ObjectRef,
        cancel: &CancellationToken,
        observer: TransferObserver,
    ) -> Result<u64> {
        let src_str = src.to_string();
        let dest_str = dest.to_string();
        let details = [("source", src_str.as_str()), ("dest", dest_str.as_str())];

        let meta = self
            .retry
            .execute("head_object", &details, cancel, || {
                self.backend.head_object(&src.bucket, &src.key)
            })
            .await?;

        if !observer(TransferProgress::in_flight(0, meta.size)) {
            return Err(Error::Cancelled);
        }

        self.retry
            .execute("copy_object", &details, cancel, || {
                self.backend.copy_object(src, dest)
            })
            .await?;

        observer(TransferProgress::complete(meta.size));
        Ok(meta.size)
    }

    /// Create a time-limited download URL
    pub async fn presign(
        &self,
        bucket: &str,
        key: &str,
        expiry_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if expiry_secs == 0 || expiry_secs > MAX_PRESIGN_EXPIRY_SECS {
            return Err(Error::backend(
                "InvalidArgument",
                format!("Expiry must be between 1 and {MAX_PRESIGN_EXPIRY_SECS} seconds"),
            ));
        }
        let details = [("bucket", bucket), ("key", key)];
        self.retry
            .execute("presign", &details, cancel, || {
                self.backend.presign_url(bucket, key, expiry_secs)
            })
            .await
    }

    async fn remove_partial_object(&self, bucket: &str, key: &str) {
        // The operation token may already be cancelled; cleanup runs regardless
        let cleanup = CancellationToken::new();
        let details = [("bucket", bucket), ("key", key)];
        match self
            .retry
            .execute("delete_partial_object", &details, &cleanup, || {
                self.backend.delete_object(bucket, key)
            })
            .await
        {
            Ok(()) => tracing::debug!(bucket, key, "Removed partial object"),
            Err(e) => tracing::warn!(bucket, key, error = %e, "Failed to remove partial object"),
        }
    }
}

/// Adapt an observer into the byte-count callback handed to the backend
///
/// `high_water` is shared by every retry attempt of one transfer so a restarted
/// attempt never reports fewer bytes than an earlier one did.
fn backend_progress(
    total: u64,
    high_water: Arc<AtomicU64>,
    cancel: CancellationToken,
    observer: TransferObserver,
) -> ProgressFn {
    Arc::new(move |bytes| {
        if cancel.is_cancelled() {
            return false;
        }
        // Zero-byte objects only report start and completion
        if total == 0 {
            return true;
        }
        let done = high_water.fetch_max(bytes, Ordering::Relaxed).max(bytes);
        observer(TransferProgress::in_flight(done, total)) && !cancel.is_cancelled()
    })
}

/// Record in `written` whether the backend has started sending bytes
fn track_writes(progress: ProgressFn, written: Arc<AtomicBool>) -> ProgressFn {
    Arc::new(move |bytes| {
        if bytes > 0 {
            written.store(true, Ordering::Relaxed);
        }
        progress(bytes)
    })
}

async fn verify_size(local: &Path, expected: u64) -> Result<()> {
    let actual = tokio::fs::metadata(local).await?.len();
    if actual != expected {
        return Err(Error::backend(
            "IncompleteBody",
            format!("Received {actual} of {expected} bytes"),
        ));
    }
    Ok(())
}

async fn remove_partial_file(local: &Path) {
    match tokio::fs::remove_file(local).await {
        Ok(()) => tracing::debug!(path = %local.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %local.display(), error = %e, "Failed to remove partial file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fault, MemoryBackend};
    use crate::retry::RetryBuilder;
    use crate::traits::MockStorageBackend;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn executor() -> RetryExecutor {
        RetryExecutor::new(Arc::new(
            RetryBuilder::new()
                .max_retries(3)
                .base_delay(Duration::from_millis(1))
                .build(),
        ))
    }

    fn transfer(backend: Arc<MemoryBackend>) -> ObjectTransfer {
        ObjectTransfer::new(backend, executor())
    }

    fn recorder() -> (TransferObserver, Arc<Mutex<Vec<TransferProgress>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let observer: TransferObserver = Arc::new(move |p| {
            sink.lock().push(p);
            true
        });
        (observer, events)
    }

    fn assert_well_formed(events: &[TransferProgress]) {
        let percents: Vec<u8> = events.iter().map(|p| p.percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        let (last, rest) = percents.split_last().unwrap();
        assert_eq!(*last, 100);
        assert!(rest.iter().all(|p| *p <= 99));
    }

    #[tokio::test]
    async fn test_upload_reports_clamped_progress() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("report.json");
        std::fs::write(&local, vec![7u8; 10_000]).unwrap();
        let backend = Arc::new(MemoryBackend::new().with_chunk_size(1000));
        let (observer, events) = recorder();

        let sent = transfer(backend.clone())
            .upload(&local, "b", "r/report.json", &CancellationToken::new(), observer)
            .await
            .unwrap();

        assert_eq!(sent, 10_000);
        assert_eq!(backend.object("b", "r/report.json").unwrap().len(), 10_000);
        assert_eq!(
            backend.content_type("b", "r/report.json").as_deref(),
            Some("application/json")
        );
        let events = events.lock();
        assert_well_formed(&events);
        // Backend reached all bytes before the call returned, still held at 99
        assert!(events.iter().any(|p| p.transferred == 10_000 && p.percent == 99));
    }

    #[tokio::test]
    async fn test_download_writes_file() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("nested/out.bin");
        let backend = Arc::new(MemoryBackend::new().with_chunk_size(100));
        backend.insert("b", "data.bin", vec![1u8; 1050]);
        let (observer, events) = recorder();

        let received = transfer(backend)
            .download("b", "data.bin", &local, &CancellationToken::new(), observer)
            .await
            .unwrap();

        assert_eq!(received, 1050);
        assert_eq!(std::fs::read(&local).unwrap(), vec![1u8; 1050]);
        assert_well_formed(&events.lock());
    }

    #[tokio::test]
    async fn test_download_cancel_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("big.bin");
        let backend = Arc::new(MemoryBackend::new().with_chunk_size(100));
        backend.insert("b", "big.bin", vec![9u8; 5000]);

        let observer: TransferObserver = Arc::new(|p| p.transferred < 1000);
        let result = transfer(backend)
            .download("b", "big.bin", &local, &CancellationToken::new(), observer)
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn test_download_token_cancel_mid_stream() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("slow.bin");
        let backend = Arc::new(
            MemoryBackend::new()
                .with_chunk_size(100)
                .with_chunk_delay(Duration::from_millis(5)),
        );
        backend.insert("b", "slow.bin", vec![3u8; 10_000]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let observer: TransferObserver = Arc::new(move |p| {
            if p.transferred >= 500 {
                trigger.cancel();
            }
            true
        });

        let result = transfer(backend)
            .download("b", "slow.bin", &local, &cancel, observer)
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn test_download_fatal_mid_stream_removes_file() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("x.bin");
        let backend = Arc::new(MemoryBackend::new().with_chunk_size(100));
        backend.insert("b", "x.bin", vec![0u8; 1000]);
        backend.fail_next("get_object", Fault::new("AccessDenied").after_bytes(300));

        let err = transfer(backend)
            .download("b", "x.bin", &local, &CancellationToken::new(), silent())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "AccessDenied");
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn test_download_transient_mid_stream_retried() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("x.bin");
        let backend = Arc::new(MemoryBackend::new().with_chunk_size(100));
        backend.insert("b", "x.bin", vec![5u8; 1000]);
        backend.fail_next("get_object", Fault::new("RequestTimeout").after_bytes(300));
        let (observer, events) = recorder();

        transfer(backend.clone())
            .download("b", "x.bin", &local, &CancellationToken::new(), observer)
            .await
            .unwrap();

        assert_eq!(backend.calls("get_object"), 2);
        assert_eq!(std::fs::read(&local).unwrap().len(), 1000);
        let events = events.lock();
        assert_well_formed(&events);
        // The restarted attempt does not rewind the reported byte count
        let bytes: Vec<u64> = events.iter().map(|p| p.transferred).collect();
        assert!(bytes.windows(2).all(|w| w[0] <= w[1]), "{bytes:?}");
    }

    #[tokio::test]
    async fn test_zero_byte_download() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("empty");
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("b", "empty", Vec::new());
        let (observer, events) = recorder();

        transfer(backend)
            .download("b", "empty", &local, &CancellationToken::new(), observer)
            .await
            .unwrap();

        let percents: Vec<u8> = events.lock().iter().map(|p| p.percent).collect();
        assert_eq!(percents, vec![0, 100]);
        assert_eq!(std::fs::metadata(&local).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_zero_byte_upload_honors_cancel() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("empty");
        std::fs::write(&local, b"").unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = transfer(backend.clone())
            .upload(&local, "b", "empty", &cancel, silent())
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(backend.object("b", "empty").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_upload_atomic_backend_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("f.bin");
        std::fs::write(&local, vec![1u8; 4000]).unwrap();
        let backend = Arc::new(MemoryBackend::new().with_chunk_size(500));

        let observer: TransferObserver = Arc::new(|p| p.transferred < 1500);
        let result = transfer(backend.clone())
            .upload(&local, "b", "f.bin", &CancellationToken::new(), observer)
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(backend.object("b", "f.bin").is_none());
        assert_eq!(backend.calls("delete_object"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_upload_non_atomic_backend_cleans_up() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("f.bin");
        std::fs::write(&local, vec![1u8; 4000]).unwrap();
        let backend = Arc::new(
            MemoryBackend::new()
                .with_chunk_size(500)
                .with_atomic_uploads(false),
        );

        let observer: TransferObserver = Arc::new(|p| p.transferred < 1500);
        let result = transfer(backend.clone())
            .upload(&local, "b", "f.bin", &CancellationToken::new(), observer)
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(backend.object("b", "f.bin").is_none());
        assert_eq!(backend.calls("delete_object"), 1);
    }

    #[tokio::test]
    async fn test_rejected_upload_keeps_existing_object() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("f.bin");
        std::fs::write(&local, vec![1u8; 4000]).unwrap();
        let backend = Arc::new(
            MemoryBackend::new()
                .with_chunk_size(500)
                .with_atomic_uploads(false),
        );
        backend.insert("b", "k", "existing data");
        backend.fail_next("put_object", Fault::new("AccessDenied"));

        let err = transfer(backend.clone())
            .upload(&local, "b", "k", &CancellationToken::new(), silent())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "AccessDenied");
        assert_eq!(backend.object("b", "k").unwrap(), b"existing data".to_vec());
        assert_eq!(backend.calls("delete_object"), 0);
    }

    #[tokio::test]
    async fn test_upload_missing_file() {
        let backend = Arc::new(MemoryBackend::new());
        let err = transfer(backend)
            .upload(
                Path::new("/definitely/not/here.txt"),
                "b",
                "k",
                &CancellationToken::new(),
                silent(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NotFound");
    }

    #[tokio::test]
    async fn test_copy_and_delete() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("src", "a.txt", "hello");
        let t = transfer(backend.clone());
        let cancel = CancellationToken::new();

        let size = t
            .copy(
                &ObjectRef::new("src", "a.txt"),
                &ObjectRef::new("dst", "b.txt"),
                &cancel,
                silent(),
            )
            .await
            .unwrap();
        assert_eq!(size, 5);
        assert_eq!(backend.object("dst", "b.txt").unwrap(), b"hello");

        t.delete("src", "a.txt", &cancel).await.unwrap();
        assert!(backend.object("src", "a.txt").is_none());
    }

    #[tokio::test]
    async fn test_run_dispatches_on_endpoints() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("b", "k", "abc");
        let task = TransferTask {
            source: Endpoint::Remote(ObjectRef::new("b", "k")),
            dest: Endpoint::Local(dir.path().join("k")),
            size: Some(3),
            cancel: CancellationToken::new(),
        };

        let bytes = transfer(backend).run(&task, silent()).await.unwrap();
        assert_eq!(bytes, 3);
        assert_eq!(std::fs::read(dir.path().join("k")).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_presign_expiry_bounds() {
        let backend = Arc::new(MemoryBackend::new());
        let t = transfer(backend);
        let cancel = CancellationToken::new();

        let url = t.presign("b", "k", 3600, &cancel).await.unwrap();
        assert!(url.contains("expires=3600"));
        assert!(t.presign("b", "k", 0, &cancel).await.is_err());
        assert!(
            t.presign("b", "k", MAX_PRESIGN_EXPIRY_SECS + 1, &cancel)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_missing_object_never_streams() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("missing.txt");
        let mut mock = MockStorageBackend::new();
        mock.expect_head_object()
            .times(1)
            .returning(|_, _| Err(Error::backend("NoSuchKey", "missing")));
        mock.expect_get_object().never();

        let t = ObjectTransfer::new(Arc::new(mock), executor());
        let err = t
            .download("b", "missing.txt", &local, &CancellationToken::new(), silent())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "NoSuchKey");
        assert!(!local.exists());
    }
}
