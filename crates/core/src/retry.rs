//! Retry mechanism with exponential backoff
//!
//! Classifies backend failures as transient or fatal by error code and retries
//! transient ones with a deterministic backoff. Backoff sleeps are cancellable.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ClassifiedError, Error, ErrorClass, Result, UNKNOWN_CODE};

/// Error codes retried by default: throttling, timeouts, service-side and
/// connection failures
pub const DEFAULT_RETRYABLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "TooManyRequests",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "SlowDown",
    "RequestTimeout",
    "RequestTimeoutException",
    "InternalError",
    "ServiceUnavailable",
    "ConnectionError",
];

/// Immutable retry settings shared by all executors
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub exponential_backoff: bool,
    pub retryable_error_codes: HashSet<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryBuilder::new().build()
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        if !self.exponential_backoff {
            return self.base_delay;
        }
        // baseDelay * 2^(retry-1); the shift is capped to keep the multiplier finite
        let factor = 1u32 << retry.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(factor)
    }

    /// Classify an error against this policy
    pub fn classify(&self, error: &Error) -> ErrorClass {
        if error.is_cancelled() {
            return ErrorClass::Cancelled;
        }
        match error {
            Error::Classified(c) => c.class,
            Error::Backend { code, .. } => {
                if self.retryable_error_codes.contains(code) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            Error::Io(e) => {
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self, error: &Error) -> bool {
        self.classify(error) == ErrorClass::Transient
    }
}

/// Retry policy builder for easy customization
#[derive(Debug, Clone)]
pub struct RetryBuilder {
    max_retries: u32,
    base_delay: Duration,
    exponential_backoff: bool,
    retryable_error_codes: HashSet<String>,
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            exponential_backoff: true,
            retryable_error_codes: DEFAULT_RETRYABLE_CODES
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    pub fn retryable_code(mut self, code: impl Into<String>) -> Self {
        self.retryable_error_codes.insert(code.into());
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            exponential_backoff: self.exponential_backoff,
            retryable_error_codes: self.retryable_error_codes,
        }
    }
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Emitted before each backoff sleep
#[derive(Debug, Clone)]
pub struct RetryNotice {
    pub operation: String,
    /// Retry number about to be attempted (1-based)
    pub retry: u32,
    pub delay: Duration,
    pub code: String,
    pub message: String,
}

pub type RetryObserver = Arc<dyn Fn(&RetryNotice) + Send + Sync>;

/// Runs backend calls under a [`RetryPolicy`]
///
/// Cheap to clone; clones share the policy and observer.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: Arc<RetryPolicy>,
    deadline: Option<Instant>,
    observer: Option<RetryObserver>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("deadline", &self.deadline)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl RetryExecutor {
    pub fn new(policy: Arc<RetryPolicy>) -> Self {
        Self {
            policy,
            deadline: None,
            observer: None,
        }
    }

    /// Stop retrying once the next sleep would end past `deadline`
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Install a callback invoked before each backoff sleep
    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `operation` until it succeeds, fails fatally, is cancelled or
    /// the retry budget is spent
    ///
    /// Failures are returned as [`Error::Classified`] carrying `name`, the
    /// attempt count and `details`. Cancellation is returned as
    /// [`Error::Cancelled`].
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        details: &[(&str, &str)],
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;

            let error = match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            let class = self.policy.classify(&error);
            if class == ErrorClass::Cancelled || cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let retry = attempt;
            if class == ErrorClass::Fatal || retry > self.policy.max_retries {
                return Err(annotate(name, details, attempt, class, error));
            }

            let delay = self.policy.delay_for(retry);
            if let Some(deadline) = self.deadline
                && Instant::now() + delay > deadline
            {
                tracing::warn!(operation = name, attempt, "Retry deadline reached");
                return Err(annotate(name, details, attempt, class, error));
            }

            let notice = RetryNotice {
                operation: name.to_string(),
                retry,
                delay,
                code: error.code().to_string(),
                message: error.message(),
            };
            tracing::debug!(
                operation = name,
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after transient error"
            );
            if let Some(observer) = &self.observer {
                observer(&notice);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn annotate(
    name: &str,
    details: &[(&str, &str)],
    attempts: u32,
    class: ErrorClass,
    error: Error,
) -> Error {
    // Already annotated by an inner executor
    if let Error::Classified(_) = error {
        return error;
    }

    let code = match &error {
        Error::Backend { code, .. } => code.clone(),
        Error::General(_) => UNKNOWN_CODE.to_string(),
        other => other.code().to_string(),
    };

    Error::Classified(Box::new(ClassifiedError {
        operation: name.to_string(),
        code,
        message: error.message(),
        attempts,
        class,
        details: details
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        source: Box::new(error),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> Arc<RetryPolicy> {
        Arc::new(
            RetryBuilder::new()
                .max_retries(max_retries)
                .base_delay(Duration::from_millis(10))
                .build(),
        )
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryBuilder::new()
            .base_delay(Duration::from_millis(100))
            .build();

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1600));
    }

    #[test]
    fn test_constant_delays() {
        let policy = RetryBuilder::new()
            .base_delay(Duration::from_millis(250))
            .exponential_backoff(false)
            .build();

        for retry in 1..=6 {
            assert_eq!(policy.delay_for(retry), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_classification() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.classify(&Error::backend("SlowDown", "reduce rate")),
            ErrorClass::Transient
        );
        assert_eq!(
            policy.classify(&Error::backend("ServiceUnavailable", "503")),
            ErrorClass::Transient
        );
        assert_eq!(
            policy.classify(&Error::backend("AccessDenied", "denied")),
            ErrorClass::Fatal
        );
        assert_eq!(
            policy.classify(&Error::backend("NoSuchKey", "missing")),
            ErrorClass::Fatal
        );
        assert_eq!(policy.classify(&Error::Cancelled), ErrorClass::Cancelled);
        assert_eq!(
            policy.classify(&Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out"
            ))),
            ErrorClass::Transient
        );
        assert_eq!(
            policy.classify(&Error::General("boom".into())),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_retry_builder() {
        let policy = RetryBuilder::new()
            .max_retries(2)
            .base_delay(Duration::from_millis(200))
            .exponential_backoff(false)
            .retryable_code("CustomBusy")
            .build();

        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
        assert!(!policy.exponential_backoff);
        assert!(policy.is_retryable(&Error::backend("CustomBusy", "busy")));
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let executor = RetryExecutor::new(fast_policy(3));
        let cancel = CancellationToken::new();
        let mut calls = 0;

        let result = executor
            .execute("head_object", &[], &cancel, || {
                calls += 1;
                async { Ok::<_, Error>(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let executor = RetryExecutor::new(fast_policy(3));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result = executor
            .execute("get_object", &[], &cancel, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::backend("RequestTimeout", "timeout"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reports_attempts_and_context() {
        let executor = RetryExecutor::new(fast_policy(2));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = executor
            .execute(
                "put_object",
                &[("bucket", "b"), ("key", "k")],
                &cancel,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(Error::backend("SlowDown", "slow down")) }
                },
            )
            .await;

        // max_retries + 1 attempts
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(Error::Classified(c)) => {
                assert_eq!(c.operation, "put_object");
                assert_eq!(c.code, "SlowDown");
                assert_eq!(c.attempts, 3);
                assert_eq!(c.class, ErrorClass::Transient);
                assert_eq!(c.details["key"], "k");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fatal_not_retried() {
        let executor = RetryExecutor::new(fast_policy(5));
        let cancel = CancellationToken::new();
        let mut calls = 0;

        let result: Result<()> = executor
            .execute("delete_object", &[], &cancel, || {
                calls += 1;
                async { Err(Error::backend("AccessDenied", "denied")) }
            })
            .await;

        assert_eq!(calls, 1);
        let err = result.unwrap_err();
        assert_eq!(err.code(), "AccessDenied");
        assert!(!err.is_cancelled());
    }

    #[tokio::test]
    async fn test_unknown_error_wrapped_with_generic_code() {
        let executor = RetryExecutor::new(fast_policy(1));
        let cancel = CancellationToken::new();

        let result: Result<()> = executor
            .execute("copy_object", &[], &cancel, || async {
                Err(Error::General("something odd".into()))
            })
            .await;

        match result {
            Err(Error::Classified(c)) => assert_eq!(c.code, UNKNOWN_CODE),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_each_backoff() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let executor = RetryExecutor::new(fast_policy(3)).with_observer(Arc::new(
            move |notice: &RetryNotice| sink.lock().push((notice.retry, notice.delay)),
        ));
        let cancel = CancellationToken::new();

        let _: Result<()> = executor
            .execute("list_objects", &[], &cancel, || async {
                Err(Error::backend("InternalError", "oops"))
            })
            .await;

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                (1, Duration::from_millis(10)),
                (2, Duration::from_millis(20)),
                (3, Duration::from_millis(40)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let executor = RetryExecutor::new(Arc::new(
            RetryBuilder::new()
                .max_retries(5)
                .base_delay(Duration::from_secs(60))
                .build(),
        ));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result: Result<()> = executor
            .execute("get_object", &[], &cancel, || async {
                Err(Error::backend("ServiceUnavailable", "busy"))
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retries() {
        let executor = RetryExecutor::new(Arc::new(
            RetryBuilder::new()
                .max_retries(10)
                .base_delay(Duration::from_secs(1))
                .build(),
        ))
        .with_deadline(Some(Instant::now() + Duration::from_secs(4)));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = executor
            .execute("list_objects", &[], &cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::backend("Throttling", "throttled")) }
            })
            .await;

        // Sleeps of 1s and 2s fit; the 4s sleep would overrun the deadline
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().code(), "Throttling");
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_call() {
        let executor = RetryExecutor::new(fast_policy(3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut calls = 0;

        let result: Result<()> = executor
            .execute("head_object", &[], &cancel, || {
                calls += 1;
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(calls, 0);
    }
}
