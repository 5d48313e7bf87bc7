//! Process exit codes
//!
//! Scripts rely on these values, so existing codes never change meaning.

/// Exit code returned by every command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    /// Bad arguments, paths or configuration
    UsageError = 2,
    /// Timeouts, throttling and service-side failures
    NetworkError = 3,
    AuthError = 4,
    NotFound = 5,
    Conflict = 6,
    UnsupportedFeature = 7,
    /// Cancelled by the user (Ctrl-C)
    Interrupted = 130,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::GeneralError),
            2 => Some(ExitCode::UsageError),
            3 => Some(ExitCode::NetworkError),
            4 => Some(ExitCode::AuthError),
            5 => Some(ExitCode::NotFound),
            6 => Some(ExitCode::Conflict),
            7 => Some(ExitCode::UnsupportedFeature),
            130 => Some(ExitCode::Interrupted),
            _ => None,
        }
    }

    /// Map a backend or engine error code to an exit code
    pub fn from_error_code(code: &str) -> Self {
        match code {
            "Cancelled" => ExitCode::Interrupted,
            "NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "NotFound" => ExitCode::NotFound,
            "AccessDenied"
            | "InvalidAccessKeyId"
            | "SignatureDoesNotMatch"
            | "ExpiredToken"
            | "InvalidToken" => ExitCode::AuthError,
            "InvalidArgument" | "InvalidConfiguration" | "InvalidBucketName" => {
                ExitCode::UsageError
            }
            "BucketAlreadyExists" | "BucketAlreadyOwnedByYou" | "PreconditionFailed" => {
                ExitCode::Conflict
            }
            "NotImplemented" => ExitCode::UnsupportedFeature,
            "RequestTimeout"
            | "RequestTimeoutException"
            | "ConnectionError"
            | "InternalError"
            | "ServiceUnavailable"
            | "SlowDown"
            | "Throttling"
            | "ThrottlingException"
            | "ThrottledException"
            | "TooManyRequests"
            | "TooManyRequestsException"
            | "RequestLimitExceeded" => ExitCode::NetworkError,
            _ => ExitCode::GeneralError,
        }
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.as_i32() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_known_codes() {
        for code in [
            ExitCode::Success,
            ExitCode::UsageError,
            ExitCode::NotFound,
            ExitCode::Interrupted,
        ] {
            assert_eq!(ExitCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(ExitCode::from_i32(42), None);
    }

    #[test]
    fn test_from_error_code() {
        assert_eq!(ExitCode::from_error_code("NoSuchKey"), ExitCode::NotFound);
        assert_eq!(ExitCode::from_error_code("AccessDenied"), ExitCode::AuthError);
        assert_eq!(ExitCode::from_error_code("SlowDown"), ExitCode::NetworkError);
        assert_eq!(ExitCode::from_error_code("Cancelled"), ExitCode::Interrupted);
        assert_eq!(ExitCode::from_error_code("InvalidArgument"), ExitCode::UsageError);
        assert_eq!(ExitCode::from_error_code("Unknown"), ExitCode::GeneralError);
    }
}
