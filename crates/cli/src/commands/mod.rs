//! Command implementations
//!
//! Each command builds an [`OperationRequest`], submits it to the
//! [`WorkerManager`] and renders the settled operation. Remote paths are
//! written `bucket/key`, optionally prefixed with `s3://`.

pub mod completions;
pub mod config;
pub mod cp;
pub mod get;
pub mod ls;
pub mod put;
pub mod rm;
pub mod share;

use std::sync::Arc;

use indicatif::MultiProgress;
use sx_core::{
    Config, ConfigManager, ObjectRef, Operation, OperationRequest, OperationState, WorkerManager,
};
use sx_s3::S3Backend;
use tokio::sync::broadcast::error::RecvError;

use crate::exit_code::ExitCode;
use crate::output::{Formatter, OperationProgress};

/// A `bucket/key` address given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePath {
    pub bucket: String,
    /// Empty when only the bucket was given
    pub key: String,
}

impl RemotePath {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.bucket, &self.key)
    }

    /// Key used as a directory prefix: empty or ending in `/`
    pub fn dir_prefix(&self) -> String {
        if self.key.is_empty() || self.key.ends_with('/') {
            self.key.clone()
        } else {
            format!("{}/", self.key)
        }
    }

    /// Last key segment, used as the default local file name
    pub fn file_name(&self) -> Option<&str> {
        self.key.rsplit('/').next().filter(|name| !name.is_empty())
    }
}

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Parse `bucket`, `bucket/key` or `s3://bucket/key`
pub fn parse_remote(path: &str) -> Result<RemotePath, String> {
    let trimmed = path.strip_prefix("s3://").unwrap_or(path);
    if trimmed.is_empty() {
        return Err("Path cannot be empty".to_string());
    }

    let (bucket, key) = trimmed.split_once('/').unwrap_or((trimmed, ""));
    if bucket.is_empty() {
        return Err(format!("Missing bucket name in '{path}'"));
    }

    Ok(RemotePath {
        bucket: bucket.to_string(),
        key: key.to_string(),
    })
}

/// Parse a remote path that must name an object
pub fn parse_object(path: &str) -> Result<RemotePath, String> {
    let remote = parse_remote(path)?;
    if remote.key.is_empty() || remote.key.ends_with('/') {
        return Err(format!("Object key is required (bucket/key): '{path}'"));
    }
    Ok(remote)
}

/// Load configuration, connect the S3 backend and start a worker manager
pub async fn connect(formatter: &Formatter) -> Result<WorkerManager, ExitCode> {
    let config = load_config(formatter)?;

    let backend = match S3Backend::new(&config.backend).await {
        Ok(backend) => backend,
        Err(e) => {
            formatter.error(&format!("Failed to create S3 client: {e}"));
            return Err(ExitCode::from_error_code(e.code()));
        }
    };

    match WorkerManager::new(&config, Arc::new(backend)) {
        Ok(manager) => Ok(manager),
        Err(e) => {
            formatter.error(&format!("Invalid configuration: {e}"));
            Err(ExitCode::UsageError)
        }
    }
}

pub fn load_config(formatter: &Formatter) -> Result<Config, ExitCode> {
    let manager = match ConfigManager::new() {
        Ok(manager) => manager,
        Err(e) => {
            formatter.error(&format!("Failed to locate configuration: {e}"));
            return Err(ExitCode::GeneralError);
        }
    };

    manager.load().map_err(|e| {
        formatter.error(&format!("Failed to load configuration: {e}"));
        ExitCode::UsageError
    })
}

/// Submit `request` and drive it to a settled state
///
/// Progress events for the operation feed a terminal bar. Ctrl-C requests
/// cooperative cancellation once; the operation then settles as cancelled.
/// Failures are reported through the formatter and returned as exit codes.
pub async fn run_operation(
    manager: &WorkerManager,
    request: OperationRequest,
    formatter: &Formatter,
    group: Option<&MultiProgress>,
) -> Result<Operation, ExitCode> {
    let label = request.description();
    // Subscribe before submitting so the Started event is not missed.
    let mut events = manager.subscribe();
    let id = manager.submit(request);
    let progress = OperationProgress::new(formatter, &label, group);

    let wait = manager.wait(id);
    tokio::pin!(wait);
    let mut interrupted = false;

    let settled = loop {
        tokio::select! {
            biased;
            op = &mut wait => break op,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if manager.cancel(id) {
                    progress.set_message("cancelling");
                }
            }
            event = events.recv() => match event {
                Ok(event) if event.id() == id => progress.apply(&event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(operation_id = %id, skipped, "Progress events dropped");
                }
                // Closed only once the manager is gone; the wait branch settles it.
                Err(RecvError::Closed) => {}
            },
        }
    };
    progress.finish();

    let Some(op) = settled else {
        formatter.error(&format!("{label}: operation record was lost"));
        return Err(ExitCode::GeneralError);
    };

    match op.state {
        OperationState::Completed => Ok(op),
        OperationState::Cancelled => {
            formatter.warning(&format!("{label}: cancelled"));
            Err(ExitCode::Interrupted)
        }
        _ => {
            let code = match &op.error {
                Some(detail) => {
                    formatter.error_detail(&label, detail);
                    ExitCode::from_error_code(&detail.code)
                }
                None => {
                    formatter.error(&format!("{label}: failed"));
                    ExitCode::GeneralError
                }
            };
            Err(code)
        }
    }
}

/// Run several requests concurrently, each with its own progress bar
///
/// Results come back in request order. The worker pool still bounds how many
/// run at once.
pub async fn run_all(
    manager: &WorkerManager,
    requests: Vec<OperationRequest>,
    formatter: &Formatter,
) -> Vec<Result<Operation, ExitCode>> {
    let group = MultiProgress::new();
    let runs = requests
        .into_iter()
        .map(|request| run_operation(manager, request, formatter, Some(&group)));
    futures::future::join_all(runs).await
}

/// Exit code for a batch: success only when every run succeeded
///
/// An interruption wins over other failures so scripts see the Ctrl-C.
pub fn batch_exit_code<T>(results: &[Result<T, ExitCode>]) -> ExitCode {
    let mut code = ExitCode::Success;
    for result in results {
        match result {
            Err(ExitCode::Interrupted) => return ExitCode::Interrupted,
            Err(failure) if code == ExitCode::Success => code = *failure,
            _ => {}
        }
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote() {
        let remote = parse_remote("photos/2024/cat.jpg").unwrap();
        assert_eq!(remote.bucket, "photos");
        assert_eq!(remote.key, "2024/cat.jpg");
        assert_eq!(remote.file_name(), Some("cat.jpg"));

        let bucket_only = parse_remote("s3://photos").unwrap();
        assert_eq!(bucket_only.bucket, "photos");
        assert_eq!(bucket_only.key, "");
        assert_eq!(bucket_only.file_name(), None);
    }

    #[test]
    fn test_parse_remote_errors() {
        assert!(parse_remote("").is_err());
        assert!(parse_remote("s3://").is_err());
        assert!(parse_remote("/key").is_err());
    }

    #[test]
    fn test_parse_object_requires_key() {
        assert!(parse_object("photos").is_err());
        assert!(parse_object("photos/").is_err());
        assert!(parse_object("photos/2024/").is_err());
        assert_eq!(parse_object("photos/a.txt").unwrap().key, "a.txt");
    }

    #[test]
    fn test_batch_exit_code() {
        let ok: Result<(), ExitCode> = Ok(());
        assert_eq!(batch_exit_code(&[ok, Ok(())]), ExitCode::Success);
        assert_eq!(
            batch_exit_code::<()>(&[Ok(()), Err(ExitCode::NotFound), Err(ExitCode::AuthError)]),
            ExitCode::NotFound
        );
        assert_eq!(
            batch_exit_code::<()>(&[Err(ExitCode::NotFound), Err(ExitCode::Interrupted)]),
            ExitCode::Interrupted
        );
    }

    #[test]
    fn test_dir_prefix() {
        assert_eq!(parse_remote("b").unwrap().dir_prefix(), "");
        assert_eq!(parse_remote("b/logs").unwrap().dir_prefix(), "logs/");
        assert_eq!(parse_remote("b/logs/").unwrap().dir_prefix(), "logs/");
    }
}
