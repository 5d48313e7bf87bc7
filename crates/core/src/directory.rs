//! Directory transfers
//!
//! A directory operation runs in two phases. The scan walks the local tree or
//! lists the remote prefix once to size the progress denominators. The
//! transfer phase then moves each file in depth-first order through
//! [`ObjectTransfer`], one at a time, on the calling task.
//!
//! The first failing file aborts the operation. Cancellation stops scheduling
//! further files. Files already transferred are left in place in both cases.
//! A remote listing cut short by the page ceiling fails the operation before
//! anything is transferred or deleted.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::listing::{Listing, PaginatedLister};
use crate::progress::{AggregateProgress, TransferProgress};
use crate::transfer::{ObjectTransfer, TransferObserver};

/// Key delimiter used for directory semantics
pub const DELIMITER: &str = "/";

/// Receives aggregate progress together with the item currently in flight
pub type DirectoryObserver = Arc<dyn Fn(&AggregateProgress, &str) + Send + Sync>;

/// One entry produced by a local scan, in depth-first order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEntry {
    File {
        path: PathBuf,
        /// Path relative to the scan root, `/`-separated
        relative: String,
        size: u64,
    },
    /// Directory with no entries of its own
    EmptyDir { relative: String },
}

/// Result of walking a local tree
#[derive(Debug, Clone, Default)]
pub struct LocalScan {
    pub entries: Vec<ScanEntry>,
    pub total_files: usize,
    pub total_bytes: u64,
}

/// Walk `root` depth-first, children sorted by name
///
/// Symlinked directories are skipped to avoid cycles; symlinked files are
/// followed.
pub async fn scan_local(root: &Path, cancel: &CancellationToken) -> Result<LocalScan> {
    let mut scan = LocalScan::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut children = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            children.push(entry);
        }
        children.sort_by_key(|e| e.file_name());

        if children.is_empty() && dir != root {
            scan.entries.push(ScanEntry::EmptyDir {
                relative: relative_key(root, &dir)?,
            });
            continue;
        }

        let mut subdirs = Vec::new();
        for entry in children {
            let path = entry.path();
            let is_link = entry.file_type().await?.is_symlink();
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if is_link => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping dangling symlink");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if meta.is_dir() {
                if is_link {
                    tracing::debug!(path = %path.display(), "Skipping symlinked directory");
                    continue;
                }
                subdirs.push(path);
            } else if meta.is_file() {
                scan.total_files += 1;
                scan.total_bytes += meta.len();
                scan.entries.push(ScanEntry::File {
                    relative: relative_key(root, &path)?,
                    path,
                    size: meta.len(),
                });
            }
        }

        // Reversed so the stack pops them in name order
        stack.extend(subdirs.into_iter().rev());
    }

    Ok(scan)
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| Error::InvalidPath(format!("{} is outside the root", path.display())))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join(DELIMITER))
}

/// Normalize a remote directory prefix to end with the delimiter
pub fn dir_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with(DELIMITER) {
        prefix.to_string()
    } else {
        format!("{prefix}{DELIMITER}")
    }
}

/// Map a key relative to a remote prefix onto a path below `root`
///
/// Rejects keys that would escape `root`.
pub fn local_path_for(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for part in relative.split(DELIMITER).filter(|p| !p.is_empty()) {
        let component = Path::new(part);
        let is_plain = component
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !is_plain || component.components().count() != 1 {
            return Err(Error::InvalidPath(format!(
                "Refusing to map key component '{part}' below {}",
                root.display()
            )));
        }
        path.push(part);
    }
    Ok(path)
}

/// Runs directory-level operations on top of single-object transfers
#[derive(Clone)]
pub struct DirectoryTransfer {
    transfer: ObjectTransfer,
    lister: PaginatedLister,
    delete_batch: usize,
}

impl DirectoryTransfer {
    pub fn new(transfer: ObjectTransfer, lister: PaginatedLister, delete_batch: usize) -> Self {
        Self {
            transfer,
            lister,
            delete_batch: delete_batch.max(1),
        }
    }

    /// Upload the tree under `root` to `bucket/prefix`
    ///
    /// Empty directories become zero-byte directory markers.
    pub async fn upload_directory(
        &self,
        root: &Path,
        bucket: &str,
        prefix: &str,
        cancel: &CancellationToken,
        observer: DirectoryObserver,
    ) -> Result<AggregateProgress> {
        if !tokio::fs::metadata(root).await?.is_dir() {
            return Err(Error::InvalidPath(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        let prefix = dir_prefix(prefix);

        let scan = scan_local(root, cancel).await?;
        tracing::info!(
            root = %root.display(),
            bucket,
            prefix = %prefix,
            files = scan.total_files,
            bytes = scan.total_bytes,
            "Scanned local directory"
        );

        let mut agg = AggregateProgress::new(scan.total_files, scan.total_bytes);
        observer(&agg, "");

        for entry in &scan.entries {
            match entry {
                ScanEntry::EmptyDir { relative } => {
                    let key = format!("{prefix}{relative}{DELIMITER}");
                    self.transfer
                        .put_marker(bucket, &key, cancel)
                        .await
                        .map_err(|e| partial(relative, &agg, e))?;
                }
                ScanEntry::File {
                    path,
                    relative,
                    size,
                } => {
                    if cancel.is_cancelled() {
                        return Err(partial(relative, &agg, Error::Cancelled));
                    }
                    let key = format!("{prefix}{relative}");
                    let file_observer = per_file(&agg, *size, relative, &observer);
                    match self
                        .transfer
                        .upload(path, bucket, &key, cancel, file_observer)
                        .await
                    {
                        Ok(_) => {
                            agg.complete_file(*size);
                            observer(&agg, relative);
                        }
                        Err(e) => {
                            agg.fail_file();
                            observer(&agg, relative);
                            return Err(partial(relative, &agg, e));
                        }
                    }
                }
            }
        }

        Ok(agg)
    }

    /// Download every object under `bucket/prefix` into `root`
    ///
    /// Directory marker objects become local directories.
    pub async fn download_directory(
        &self,
        bucket: &str,
        prefix: &str,
        root: &Path,
        cancel: &CancellationToken,
        observer: DirectoryObserver,
    ) -> Result<AggregateProgress> {
        let prefix = dir_prefix(prefix);
        let listing = self.lister.list_recursive(bucket, &prefix, cancel).await?;
        refuse_truncated(&listing, bucket, &prefix)?;

        let mut files = Vec::new();
        let mut dirs = Vec::new();
        for object in &listing.objects {
            let relative = object.key.strip_prefix(&prefix).unwrap_or(&object.key);
            if relative.is_empty() {
                continue;
            }
            let local = local_path_for(root, relative)?;
            if relative.ends_with(DELIMITER) {
                dirs.push(local);
            } else {
                files.push((object, relative, local));
            }
        }

        let total_bytes = files.iter().map(|(o, _, _)| o.size).sum();
        let mut agg = AggregateProgress::new(files.len(), total_bytes);
        tracing::info!(
            bucket,
            prefix = %prefix,
            root = %root.display(),
            files = files.len(),
            bytes = total_bytes,
            "Listed remote directory"
        );
        observer(&agg, "");

        tokio::fs::create_dir_all(root).await?;
        for dir in &dirs {
            tokio::fs::create_dir_all(dir).await?;
        }

        for (object, relative, local) in files {
            if cancel.is_cancelled() {
                return Err(partial(relative, &agg, Error::Cancelled));
            }
            let file_observer = per_file(&agg, object.size, relative, &observer);
            match self
                .transfer
                .download(bucket, &object.key, &local, cancel, file_observer)
                .await
            {
                Ok(_) => {
                    agg.complete_file(object.size);
                    observer(&agg, relative);
                }
                Err(e) => {
                    agg.fail_file();
                    observer(&agg, relative);
                    return Err(partial(relative, &agg, e));
                }
            }
        }

        Ok(agg)
    }

    /// Delete every object under `bucket/prefix` in batched calls
    ///
    /// The first failed batch, or the first key the backend refuses, aborts the
    /// remaining batches. `completed_files` counts deleted keys.
    pub async fn delete_directory(
        &self,
        bucket: &str,
        prefix: &str,
        cancel: &CancellationToken,
        observer: DirectoryObserver,
    ) -> Result<AggregateProgress> {
        if prefix.is_empty() {
            return Err(Error::InvalidPath(
                "Refusing to delete a whole bucket; give a prefix".into(),
            ));
        }
        let prefix = dir_prefix(prefix);
        let listing = self.lister.list_recursive(bucket, &prefix, cancel).await?;
        refuse_truncated(&listing, bucket, &prefix)?;
        let keys: Vec<String> = listing.objects.into_iter().map(|o| o.key).collect();

        let mut agg = AggregateProgress::new(keys.len(), 0);
        observer(&agg, "");
        let backend = self.transfer.backend();
        let details = [("bucket", bucket), ("prefix", prefix.as_str())];

        for (index, batch) in keys.chunks(self.delete_batch).enumerate() {
            let label = format!("batch {} ({} keys)", index + 1, batch.len());
            if cancel.is_cancelled() {
                return Err(partial(&label, &agg, Error::Cancelled));
            }

            let outcomes = self
                .transfer
                .retry()
                .execute("delete_objects", &details, cancel, || {
                    backend.delete_objects(bucket, batch.to_vec())
                })
                .await
                .map_err(|e| partial(&label, &agg, e))?;

            let mut refused = None;
            for outcome in outcomes {
                match outcome.error {
                    None => agg.complete_file(0),
                    Some((code, message)) => {
                        agg.fail_file();
                        refused.get_or_insert((outcome.key, code, message));
                    }
                }
            }
            observer(&agg, &label);

            if let Some((key, code, message)) = refused {
                return Err(partial(&key, &agg, Error::backend(code, message)));
            }
            tracing::debug!(bucket, batch = index + 1, deleted = agg.completed_files, "Deleted batch");
        }

        Ok(agg)
    }
}

/// Bulk operations never act on an incomplete listing
fn refuse_truncated(listing: &Listing, bucket: &str, prefix: &str) -> Result<()> {
    if !listing.truncated {
        return Ok(());
    }
    tracing::warn!(bucket, prefix, pages = listing.pages, "Listing hit the page ceiling");
    Err(Error::backend(
        "ListingTruncated",
        format!(
            "Listing of {bucket}/{prefix} stopped after {} pages ({} objects); \
             raise max_pages to cover the whole prefix",
            listing.pages,
            listing.objects.len()
        ),
    ))
}

fn partial(item: &str, agg: &AggregateProgress, source: Error) -> Error {
    Error::Partial {
        item: item.to_string(),
        completed: agg.completed_files,
        source: Box::new(source),
    }
}

/// Observer for one file that folds its bytes into the aggregate
fn per_file(
    agg: &AggregateProgress,
    size: u64,
    item: &str,
    observer: &DirectoryObserver,
) -> TransferObserver {
    let base = *agg;
    let item = item.to_string();
    let observer = observer.clone();
    Arc::new(move |p: TransferProgress| {
        observer(&base.with_current(p.transferred.min(size)), &item);
        true
    })
}
