//! Paginated listing
//!
//! Drives cursor-based `list_objects` calls into one merged listing. Pages are
//! fetched strictly one after another so continuation tokens stay ordered.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::retry::RetryExecutor;
use crate::traits::{
    BucketSummary, DirectorySummary, ListRequest, ObjectSummary, StorageBackend,
};

/// Merged result of a (possibly multi-page) listing
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Listing {
    pub bucket: String,
    pub prefix: String,
    /// Objects in backend order, deduplicated by key
    pub objects: Vec<ObjectSummary>,
    /// Common prefixes in first-seen order, deduplicated
    pub prefixes: Vec<DirectorySummary>,
    pub pages: usize,
    /// The page ceiling was hit before the backend ran out of entries
    pub truncated: bool,
}

impl Listing {
    pub fn total_bytes(&self) -> u64 {
        self.objects.iter().map(|o| o.size).sum()
    }
}

/// Lists a prefix page by page under a retry policy
#[derive(Clone)]
pub struct PaginatedLister {
    backend: Arc<dyn StorageBackend>,
    retry: RetryExecutor,
    page_size: i32,
    max_pages: usize,
}

impl PaginatedLister {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        retry: RetryExecutor,
        page_size: i32,
        max_pages: usize,
    ) -> Self {
        Self {
            backend,
            retry,
            page_size,
            max_pages: max_pages.max(1),
        }
    }

    /// List the caller's buckets
    pub async fn list_buckets(&self, cancel: &CancellationToken) -> Result<Vec<BucketSummary>> {
        let buckets = self
            .retry
            .execute("list_buckets", &[], cancel, || self.backend.list_buckets())
            .await?;
        tracing::debug!(buckets = buckets.len(), "Listed buckets");
        Ok(buckets)
    }

    /// List one level under `prefix`, grouping deeper keys at `delimiter`
    ///
    /// The queried prefix itself is never returned, neither as its directory
    /// marker object nor as a common prefix.
    pub async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        cancel: &CancellationToken,
    ) -> Result<Listing> {
        let delimiter = (!delimiter.is_empty()).then(|| delimiter.to_string());
        self.collect(bucket, prefix, delimiter, cancel).await
    }

    /// List every key under `prefix` without grouping
    pub async fn list_recursive(
        &self,
        bucket: &str,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<Listing> {
        self.collect(bucket, prefix, None, cancel).await
    }

    /// Lazily descend into one common prefix of an earlier listing
    pub async fn descend(
        &self,
        parent: &Listing,
        dir: &DirectorySummary,
        delimiter: &str,
        cancel: &CancellationToken,
    ) -> Result<Listing> {
        if !dir.prefix.starts_with(&parent.prefix) {
            return Err(Error::InvalidPath(format!(
                "'{}' is not below '{}'",
                dir.prefix, parent.prefix
            )));
        }
        self.list(&parent.bucket, &dir.prefix, delimiter, cancel)
            .await
    }

    async fn collect(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Listing> {
        let mut listing = Listing {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            ..Default::default()
        };
        let mut seen_keys = HashSet::new();
        let mut seen_prefixes = HashSet::new();
        let mut token: Option<String> = None;
        let details = [("bucket", bucket), ("prefix", prefix)];

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if listing.pages >= self.max_pages {
                tracing::warn!(
                    bucket,
                    prefix,
                    max_pages = self.max_pages,
                    "Listing stopped at page ceiling"
                );
                listing.truncated = true;
                break;
            }

            let request = ListRequest {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                delimiter: delimiter.clone(),
                continuation_token: token.clone(),
                max_keys: Some(self.page_size),
            };
            let page = self
                .retry
                .execute("list_objects", &details, cancel, || {
                    self.backend.list_objects(request.clone())
                })
                .await?;
            listing.pages += 1;

            let is_marker = |key: &str| {
                delimiter
                    .as_deref()
                    .is_some_and(|d| key == prefix && key.ends_with(d))
            };

            for object in page.objects {
                if is_marker(&object.key) {
                    continue;
                }
                if seen_keys.insert(object.key.clone()) {
                    listing.objects.push(object);
                }
            }
            for dir in page.prefixes {
                if dir.prefix == prefix {
                    continue;
                }
                if seen_prefixes.insert(dir.prefix.clone()) {
                    listing.prefixes.push(dir);
                }
            }

            tracing::debug!(
                bucket,
                prefix,
                page = listing.pages,
                objects = listing.objects.len(),
                "Fetched listing page"
            );

            match page.continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }

        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fault, MemoryBackend};
    use crate::retry::RetryBuilder;
    use std::time::Duration;

    fn lister(backend: Arc<MemoryBackend>, page_size: i32, max_pages: usize) -> PaginatedLister {
        let policy = RetryBuilder::new()
            .max_retries(2)
            .base_delay(Duration::from_millis(1))
            .build();
        PaginatedLister::new(
            backend,
            RetryExecutor::new(Arc::new(policy)),
            page_size,
            max_pages,
        )
    }

    #[tokio::test]
    async fn test_multi_page_union_in_order() {
        let backend = Arc::new(MemoryBackend::new());
        for i in 0..25 {
            backend.insert("b", &format!("k{i:03}"), vec![0u8; i]);
        }

        let listing = lister(backend.clone(), 10, 20)
            .list_recursive("b", "", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(listing.pages, 3);
        assert!(!listing.truncated);
        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.clone()).collect();
        let expected: Vec<_> = (0..25).map(|i| format!("k{i:03}")).collect();
        assert_eq!(keys, expected);
        assert_eq!(backend.calls("list_objects"), 3);
    }

    #[tokio::test]
    async fn test_page_ceiling_marks_truncated() {
        let backend = Arc::new(MemoryBackend::new());
        for i in 0..50 {
            backend.insert("b", &format!("k{i:03}"), "x");
        }

        let listing = lister(backend, 10, 2)
            .list_recursive("b", "", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(listing.pages, 2);
        assert_eq!(listing.objects.len(), 20);
        assert!(listing.truncated);
    }

    #[tokio::test]
    async fn test_self_reference_filtered() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("b", "photos/", "");
        backend.insert("b", "photos/a.jpg", "aa");
        backend.insert("b", "photos/2024/b.jpg", "bb");

        let listing = lister(backend, 1000, 20)
            .list("b", "photos/", "/", &CancellationToken::new())
            .await
            .unwrap();

        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["photos/a.jpg"]);
        assert_eq!(
            listing.prefixes,
            vec![DirectorySummary {
                prefix: "photos/2024/".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_descend_into_prefix() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("b", "a/1.txt", "1");
        backend.insert("b", "a/deep/2.txt", "2");
        backend.insert("b", "a/deep/more/3.txt", "3");
        let lister = lister(backend, 1000, 20);
        let cancel = CancellationToken::new();

        let root = lister.list("b", "a/", "/", &cancel).await.unwrap();
        let deep = lister
            .descend(&root, &root.prefixes[0], "/", &cancel)
            .await
            .unwrap();

        assert_eq!(deep.prefix, "a/deep/");
        assert_eq!(deep.objects.len(), 1);
        assert_eq!(deep.objects[0].key, "a/deep/2.txt");
        assert_eq!(deep.prefixes[0].prefix, "a/deep/more/");

        let outside = DirectorySummary {
            prefix: "z/".into(),
        };
        assert!(lister.descend(&root, &outside, "/", &cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_transient_page_failure_retried() {
        let backend = Arc::new(MemoryBackend::new());
        for i in 0..15 {
            backend.insert("b", &format!("k{i:02}"), "x");
        }
        backend.fail_after_calls("list_objects", 1, Fault::new("SlowDown"));

        let listing = lister(backend.clone(), 10, 20)
            .list_recursive("b", "", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(listing.objects.len(), 15);
        assert_eq!(backend.calls("list_objects"), 3);
    }

    #[tokio::test]
    async fn test_list_buckets_retried() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("logs", "k", "x");
        backend.insert("assets", "k", "x");
        backend.fail_next("list_buckets", Fault::new("ServiceUnavailable"));

        let buckets = lister(backend.clone(), 10, 20)
            .list_buckets(&CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<_> = buckets.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["assets", "logs"]);
        assert_eq!(backend.calls("list_buckets"), 2);
    }

    #[tokio::test]
    async fn test_cancelled_listing() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("b", "k", "x");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = lister(backend, 10, 20).list_recursive("b", "", &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
