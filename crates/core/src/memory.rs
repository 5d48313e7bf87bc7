//! In-memory storage backend
//!
//! A complete [`StorageBackend`] over a process-local map, with hooks to inject
//! failures, throttle data transfer and gate downloads. Used to exercise the
//! engine without a network.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::traits::{
    BucketSummary, DeleteOutcome, DirectorySummary, ListRequest, ListingPage, ObjectMeta, ObjectReader,
    ObjectRef, ObjectSummary, ObjectWriter, ProgressFn, PutOptions, StorageBackend,
};

const DEFAULT_CHUNK: usize = 64 * 1024;
const DEFAULT_MAX_KEYS: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: Option<String>,
    last_modified: Timestamp,
}

/// A scripted failure for one backend call
#[derive(Debug, Clone)]
pub struct Fault {
    pub code: String,
    pub message: String,
    /// For data transfers: fail after this many bytes have moved
    pub after_bytes: Option<u64>,
}

impl Fault {
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            message: format!("injected {code}"),
            code,
            after_bytes: None,
        }
    }

    pub fn after_bytes(mut self, bytes: u64) -> Self {
        self.after_bytes = Some(bytes);
        self
    }

    fn into_error(self) -> Error {
        Error::backend(self.code, self.message)
    }
}

#[derive(Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    faults: HashMap<&'static str, VecDeque<Fault>>,
    calls: HashMap<&'static str, usize>,
    delete_batches: Vec<usize>,
    denied_keys: HashSet<String>,
}

enum Entry {
    Object(ObjectSummary),
    Prefix(String),
}

impl Entry {
    fn name(&self) -> &str {
        match self {
            Entry::Object(o) => &o.key,
            Entry::Prefix(p) => p,
        }
    }
}

/// Process-local object store
pub struct MemoryBackend {
    state: Mutex<State>,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    atomic_uploads: bool,
    get_gate: Option<Arc<Semaphore>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            chunk_size: DEFAULT_CHUNK,
            chunk_delay: None,
            atomic_uploads: true,
            get_gate: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Move data in chunks of `size` bytes, one progress callback per chunk
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Sleep between chunks
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// When `false`, interrupted uploads leave the bytes received so far stored
    pub fn with_atomic_uploads(mut self, atomic: bool) -> Self {
        self.atomic_uploads = atomic;
        self
    }

    /// Make every `get_object` wait for a permit from `gate` before sending data
    ///
    /// While waiting the progress callback is polled, so cancellation is still
    /// observed.
    pub fn with_get_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.get_gate = Some(gate);
        self
    }

    /// Store an object directly
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(
                key.to_string(),
                StoredObject {
                    data: data.into(),
                    content_type: None,
                    last_modified: Timestamp::now(),
                },
            );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.data.clone())
    }

    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .and_then(|o| o.content_type.clone())
    }

    /// All keys in `bucket`, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue a failure for the next call of `operation`
    ///
    /// Operation names match the trait methods (`get_object`, `delete_objects`, ...).
    pub fn fail_next(&self, operation: &'static str, fault: Fault) {
        self.state
            .lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(fault);
    }

    /// Let the next `n` calls of `operation` succeed before `fault` fires
    pub fn fail_after_calls(&self, operation: &'static str, n: usize, fault: Fault) {
        let mut state = self.state.lock();
        let queue = state.faults.entry(operation).or_default();
        for _ in 0..n {
            queue.push_back(Fault {
                code: String::new(),
                message: String::new(),
                after_bytes: None,
            });
        }
        queue.push_back(fault);
    }

    /// Report `AccessDenied` for `key` in multi-object deletes
    pub fn deny_delete(&self, key: &str) {
        self.state.lock().denied_keys.insert(key.to_string());
    }

    /// Number of calls made to `operation`
    pub fn calls(&self, operation: &str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Key counts of each multi-object delete call, in order
    pub fn delete_batches(&self) -> Vec<usize> {
        self.state.lock().delete_batches.clone()
    }

    /// Highest number of concurrent `get_object` calls observed
    pub fn max_concurrent_gets(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Record a call and pop its scripted fault, if any
    fn enter(&self, operation: &'static str) -> Option<Fault> {
        let mut state = self.state.lock();
        *state.calls.entry(operation).or_default() += 1;
        let fault = state.faults.get_mut(operation)?.pop_front()?;
        // Placeholders from fail_after_calls let a call through
        (!fault.code.is_empty()).then_some(fault)
    }

    fn not_found(bucket: &str, key: &str) -> Error {
        Error::backend(
            "NoSuchKey",
            format!("The specified key does not exist: {bucket}/{key}"),
        )
    }

    async fn pause(&self) {
        if let Some(delay) = self.chunk_delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn wait_gate(&self, progress: &ProgressFn) -> Result<()> {
        let Some(gate) = &self.get_gate else {
            return Ok(());
        };
        loop {
            tokio::select! {
                permit = gate.acquire() => {
                    permit
                        .map_err(|_| Error::backend("ServiceUnavailable", "gate closed"))?
                        .forget();
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_millis(5)) => {
                    if !progress(0) {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
    }

    async fn stream_out(
        &self,
        data: &[u8],
        dest: &mut ObjectWriter,
        progress: &ProgressFn,
        fault: Option<Fault>,
    ) -> Result<()> {
        let mut sent = 0u64;
        for chunk in data.chunks(self.chunk_size) {
            if let Some(f) = &fault
                && f.after_bytes.is_some_and(|limit| sent >= limit)
            {
                return Err(f.clone().into_error());
            }
            self.pause().await;
            dest.write_all(chunk).await?;
            sent += chunk.len() as u64;
            if !progress(sent) {
                return Err(Error::Cancelled);
            }
        }
        if let Some(f) = fault {
            return Err(f.into_error());
        }
        dest.flush().await?;
        dest.shutdown().await?;
        Ok(())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn list_buckets(&self) -> Result<Vec<BucketSummary>> {
        if let Some(fault) = self.enter("list_buckets") {
            return Err(fault.into_error());
        }
        Ok(self
            .state
            .lock()
            .buckets
            .keys()
            .map(|name| BucketSummary {
                name: name.clone(),
                created: None,
            })
            .collect())
    }

    async fn list_objects(&self, request: ListRequest) -> Result<ListingPage> {
        if let Some(fault) = self.enter("list_objects") {
            return Err(fault.into_error());
        }

        let state = self.state.lock();
        let bucket = state.buckets.get(&request.bucket).ok_or_else(|| {
            Error::backend(
                "NoSuchBucket",
                format!("The specified bucket does not exist: {}", request.bucket),
            )
        })?;

        let mut entries: Vec<Entry> = Vec::new();
        for (key, obj) in bucket.range(request.prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&request.prefix) else {
                break;
            };
            let grouped = request
                .delimiter
                .as_deref()
                .filter(|d| !d.is_empty())
                .and_then(|d| rest.find(d).map(|idx| idx + d.len()));
            match grouped {
                Some(end) => {
                    let prefix = format!("{}{}", request.prefix, &rest[..end]);
                    if !matches!(entries.last(), Some(Entry::Prefix(p)) if *p == prefix) {
                        entries.push(Entry::Prefix(prefix));
                    }
                }
                None => entries.push(Entry::Object(ObjectSummary {
                    key: key.clone(),
                    size: obj.data.len() as u64,
                    last_modified: Some(obj.last_modified),
                    etag: Some(format!("{:016x}", obj.data.len())),
                    storage_class: Some("STANDARD".to_string()),
                })),
            }
        }

        let max_keys = request
            .max_keys
            .filter(|m| *m > 0)
            .map(|m| m as usize)
            .unwrap_or(DEFAULT_MAX_KEYS);
        let start = match &request.continuation_token {
            Some(token) => entries.partition_point(|e| e.name() <= token.as_str()),
            None => 0,
        };
        let remaining = entries.len().saturating_sub(start);
        let is_truncated = remaining > max_keys;

        let mut page = ListingPage {
            is_truncated,
            ..Default::default()
        };
        for entry in entries.into_iter().skip(start).take(max_keys) {
            page.continuation_token = Some(entry.name().to_string());
            match entry {
                Entry::Object(o) => page.objects.push(o),
                Entry::Prefix(p) => page.prefixes.push(DirectorySummary { prefix: p }),
            }
        }
        if !is_truncated {
            page.continuation_token = None;
        }
        Ok(page)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        if let Some(fault) = self.enter("head_object") {
            return Err(fault.into_error());
        }
        let state = self.state.lock();
        let obj = state
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .ok_or_else(|| Self::not_found(bucket, key))?;
        Ok(ObjectMeta {
            size: obj.data.len() as u64,
            content_type: obj.content_type.clone(),
            etag: Some(format!("{:016x}", obj.data.len())),
            last_modified: Some(obj.last_modified),
            storage_class: Some("STANDARD".to_string()),
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        mut dest: ObjectWriter,
        progress: ProgressFn,
    ) -> Result<()> {
        let fault = self.enter("get_object");
        if let Some(f) = &fault
            && f.after_bytes.is_none()
        {
            return Err(f.clone().into_error());
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        self.wait_gate(&progress).await?;

        let data = self
            .object(bucket, key)
            .ok_or_else(|| Self::not_found(bucket, key))?;
        self.stream_out(&data, &mut dest, &progress, fault).await
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut src: ObjectReader,
        size: u64,
        progress: ProgressFn,
        options: PutOptions,
    ) -> Result<()> {
        let fault = self.enter("put_object");
        if let Some(f) = &fault
            && f.after_bytes.is_none()
        {
            return Err(f.clone().into_error());
        }

        let mut received = Vec::with_capacity(size as usize);
        let mut buf = vec![0u8; self.chunk_size];
        let outcome: Result<()> = async {
            loop {
                if let Some(f) = &fault
                    && f.after_bytes.is_some_and(|limit| received.len() as u64 >= limit)
                {
                    return Err(f.clone().into_error());
                }
                let n = src.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                self.pause().await;
                received.extend_from_slice(&buf[..n]);
                if !progress(received.len() as u64) {
                    return Err(Error::Cancelled);
                }
            }
        }
        .await;

        // A non-atomic store only replaces the object once bytes have arrived
        if outcome.is_err() && (self.atomic_uploads || received.is_empty()) {
            return outcome;
        }

        self.state
            .lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(
                key.to_string(),
                StoredObject {
                    data: received,
                    content_type: options.content_type,
                    last_modified: Timestamp::now(),
                },
            );
        outcome
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        if let Some(fault) = self.enter("delete_object") {
            return Err(fault.into_error());
        }
        if let Some(b) = self.state.lock().buckets.get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<Vec<DeleteOutcome>> {
        let fault = self.enter("delete_objects");
        let mut state = self.state.lock();
        state.delete_batches.push(keys.len());
        if let Some(fault) = fault {
            return Err(fault.into_error());
        }

        let denied = state.denied_keys.clone();
        let objects = state.buckets.entry(bucket.to_string()).or_default();
        Ok(keys
            .into_iter()
            .map(|key| {
                if denied.contains(&key) {
                    DeleteOutcome {
                        key,
                        error: Some(("AccessDenied".to_string(), "Access Denied".to_string())),
                    }
                } else {
                    objects.remove(&key);
                    DeleteOutcome::deleted(key)
                }
            })
            .collect())
    }

    async fn copy_object(&self, src: &ObjectRef, dest: &ObjectRef) -> Result<()> {
        if let Some(fault) = self.enter("copy_object") {
            return Err(fault.into_error());
        }
        let mut state = self.state.lock();
        let obj = state
            .buckets
            .get(&src.bucket)
            .and_then(|b| b.get(&src.key))
            .cloned()
            .ok_or_else(|| Self::not_found(&src.bucket, &src.key))?;
        state
            .buckets
            .entry(dest.bucket.clone())
            .or_default()
            .insert(
                dest.key.clone(),
                StoredObject {
                    last_modified: Timestamp::now(),
                    ..obj
                },
            );
        Ok(())
    }

    async fn presign_url(&self, bucket: &str, key: &str, expiry_secs: u64) -> Result<String> {
        if let Some(fault) = self.enter("presign_url") {
            return Err(fault.into_error());
        }
        Ok(format!("memory://{bucket}/{key}?expires={expiry_secs}"))
    }

    fn supports_atomic_upload(&self) -> bool {
        self.atomic_uploads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.insert("b", "docs/a.txt", "a");
        backend.insert("b", "docs/b.txt", "bb");
        backend.insert("b", "docs/sub/c.txt", "ccc");
        backend.insert("b", "docs/sub/d.txt", "dddd");
        backend.insert("b", "other.txt", "o");
        backend
    }

    #[tokio::test]
    async fn test_delimited_listing_groups_prefixes() {
        let backend = seeded();
        let page = backend
            .list_objects(ListRequest {
                bucket: "b".into(),
                prefix: "docs/".into(),
                delimiter: Some("/".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let keys: Vec<_> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["docs/a.txt", "docs/b.txt"]);
        assert_eq!(page.prefixes.len(), 1);
        assert_eq!(page.prefixes[0].prefix, "docs/sub/");
        assert!(!page.is_truncated);
    }

    #[tokio::test]
    async fn test_list_buckets_sorted() {
        let backend = seeded();
        backend.insert("archive", "x", "x");

        let names: Vec<_> = backend
            .list_buckets()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["archive", "b"]);

        backend.fail_next("list_buckets", Fault::new("AccessDenied"));
        assert_eq!(backend.list_buckets().await.unwrap_err().code(), "AccessDenied");
    }

    #[tokio::test]
    async fn test_pagination_tokens() {
        let backend = seeded();
        let first = backend
            .list_objects(ListRequest {
                bucket: "b".into(),
                max_keys: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(first.is_truncated);
        assert_eq!(first.objects.len(), 2);

        let second = backend
            .list_objects(ListRequest {
                bucket: "b".into(),
                max_keys: Some(2),
                continuation_token: first.continuation_token.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.objects[0].key, "docs/sub/c.txt");
    }

    #[tokio::test]
    async fn test_missing_bucket() {
        let backend = MemoryBackend::new();
        let err = backend
            .list_objects(ListRequest {
                bucket: "nope".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NoSuchBucket");
    }

    #[tokio::test]
    async fn test_scripted_faults_fire_in_order() {
        let backend = seeded();
        backend.fail_after_calls("head_object", 1, Fault::new("SlowDown"));

        assert!(backend.head_object("b", "other.txt").await.is_ok());
        let err = backend.head_object("b", "other.txt").await.unwrap_err();
        assert_eq!(err.code(), "SlowDown");
        assert!(backend.head_object("b", "other.txt").await.is_ok());
        assert_eq!(backend.calls("head_object"), 3);
    }
}
