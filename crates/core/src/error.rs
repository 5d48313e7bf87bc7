//! Error types for the transfer core
//!
//! Backend failures arrive as [`Error::Backend`] tagged with a machine-readable
//! code. The retry layer classifies them and annotates them with operation
//! context, producing [`Error::Classified`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Result type alias for sx-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error code used when a failure carries no backend code
pub const UNKNOWN_CODE: &str = "Unknown";

/// How an error should be treated by the orchestration layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Throttling, timeouts, service-side and connection failures
    Transient,
    /// Not found, access denied, invalid argument and everything unknown
    Fatal,
    /// Cooperative cancellation; not a failure
    Cancelled,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Fatal => write!(f, "fatal"),
            ErrorClass::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// An error annotated by the retry layer with its operation context
#[derive(Debug)]
pub struct ClassifiedError {
    /// Operation name (e.g. `download`, `list_objects`)
    pub operation: String,
    /// Backend error code, or [`UNKNOWN_CODE`]
    pub code: String,
    /// Human readable message
    pub message: String,
    /// Number of attempts made before giving up
    pub attempts: u32,
    pub class: ErrorClass,
    /// Bucket/key context
    pub details: BTreeMap<String, String>,
    /// The underlying error
    pub source: Box<Error>,
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed after {} attempt(s): {} ({})",
            self.operation, self.attempts, self.message, self.code
        )
    }
}

/// Error types for transfer operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{message} ({code})")]
    Backend { code: String, message: String },

    #[error("{0}")]
    Classified(Box<ClassifiedError>),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed on {item} after {completed} item(s) completed: {source}")]
    Partial {
        item: String,
        completed: usize,
        source: Box<Error>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("{0}")]
    General(String),
}

impl Error {
    /// Build a backend error from a code and message
    pub fn backend(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Machine-readable code for this error
    pub fn code(&self) -> &str {
        match self {
            Error::Backend { code, .. } => code,
            Error::Classified(c) => &c.code,
            Error::Cancelled => "Cancelled",
            Error::Partial { source, .. } => source.code(),
            Error::NotFound(_) => "NotFound",
            Error::InvalidPath(_) => "InvalidArgument",
            Error::Config(_) => "InvalidConfiguration",
            Error::Io(e) => io_error_code(e),
            Error::TomlParse(_) | Error::TomlSerialize(_) => "InvalidConfiguration",
            Error::General(_) => UNKNOWN_CODE,
        }
    }

    /// Whether this error represents a cancellation, at any wrapping depth
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Classified(c) => c.class == ErrorClass::Cancelled || c.source.is_cancelled(),
            Error::Partial { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Message without the code suffix
    pub fn message(&self) -> String {
        match self {
            Error::Backend { message, .. } => message.clone(),
            Error::Classified(c) => c.message.clone(),
            other => other.to_string(),
        }
    }

    /// Project into the serializable shape carried by terminal events
    pub fn detail(&self) -> ErrorDetail {
        let mut detail = ErrorDetail {
            code: self.code().to_string(),
            message: self.message(),
            operation: None,
            attempts: None,
            details: BTreeMap::new(),
            item: None,
            completed: None,
        };

        match self {
            Error::Classified(c) => {
                detail.operation = Some(c.operation.clone());
                detail.attempts = Some(c.attempts);
                detail.details = c.details.clone();
            }
            Error::Partial {
                item,
                completed,
                source,
            } => {
                let inner = source.detail();
                detail = ErrorDetail {
                    item: Some(item.clone()),
                    completed: Some(*completed),
                    message: self.to_string(),
                    ..inner
                };
            }
            _ => {}
        }

        detail
    }
}

fn io_error_code(e: &std::io::Error) -> &'static str {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => "NotFound",
        ErrorKind::PermissionDenied => "AccessDenied",
        ErrorKind::TimedOut => "RequestTimeout",
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => "ConnectionError",
        _ => UNKNOWN_CODE,
    }
}

/// Serializable error projection for terminal events and JSON output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
    /// Item that failed inside a directory or batch operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    /// Items completed before the failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<usize>,
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display() {
        let err = Error::backend("NoSuchKey", "The specified key does not exist");
        assert_eq!(err.code(), "NoSuchKey");
        assert_eq!(
            err.to_string(),
            "The specified key does not exist (NoSuchKey)"
        );
    }

    #[test]
    fn test_cancelled_seen_through_wrappers() {
        let partial = Error::Partial {
            item: "a/b.txt".to_string(),
            completed: 3,
            source: Box::new(Error::Cancelled),
        };
        assert!(partial.is_cancelled());
        assert!(!Error::NotFound("x".into()).is_cancelled());
    }

    #[test]
    fn test_detail_from_classified() {
        let mut details = BTreeMap::new();
        details.insert("bucket".to_string(), "photos".to_string());
        let err = Error::Classified(Box::new(ClassifiedError {
            operation: "download".to_string(),
            code: "SlowDown".to_string(),
            message: "Please reduce your request rate".to_string(),
            attempts: 6,
            class: ErrorClass::Transient,
            details,
            source: Box::new(Error::backend("SlowDown", "Please reduce your request rate")),
        }));

        let detail = err.detail();
        assert_eq!(detail.code, "SlowDown");
        assert_eq!(detail.operation.as_deref(), Some("download"));
        assert_eq!(detail.attempts, Some(6));
        assert_eq!(detail.details["bucket"], "photos");
    }

    #[test]
    fn test_detail_from_partial_keeps_item_and_count() {
        let err = Error::Partial {
            item: "logs/2.txt".to_string(),
            completed: 1,
            source: Box::new(Error::backend("AccessDenied", "denied")),
        };
        let detail = err.detail();
        assert_eq!(detail.code, "AccessDenied");
        assert_eq!(detail.item.as_deref(), Some("logs/2.txt"));
        assert_eq!(detail.completed, Some(1));
    }

    #[test]
    fn test_io_error_code() {
        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(err.code(), "ConnectionError");
    }
}
