//! Error types module
//!
//! All failures that cross a crate boundary are unified under [`AppError`].
//! Policy rejections are modelled separately as [`PolicyViolation`] so they can
//! travel inside `std::io::Error` values through stream adapters and be
//! recovered intact at the edge.

use std::io;

use crate::encryption::CipherError;
use crate::repository::StoreError;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like missing objects
    Debug,
    /// Warning level - for policy rejections and client mistakes
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
/// by an outer API layer without matching on message text.
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Machine-readable error code (e.g., "POLICY_MAX_SIZE")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Client-facing message (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

/// Reason a file policy refused a stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("channel is required")]
    ChannelRequired,

    #[error("no policy rule allows {mime} on channel {channel}")]
    NoMatchingRule { channel: String, mime: String },

    #[error("file exceeds max size of {max} bytes")]
    MaxSizeExceeded { max: u64 },

    #[error("extension of file is unknown")]
    UnknownType,

    #[error("actual content type {detected} doesn't match declared {declared}")]
    SuspiciousType { declared: String, detected: String },
}

impl PolicyViolation {
    /// Wrap the violation so it can be returned from an `AsyncRead`.
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, self)
    }

    /// Recover a violation previously wrapped with [`PolicyViolation::into_io`].
    pub fn from_io(err: &io::Error) -> Option<&PolicyViolation> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<PolicyViolation>())
    }

    pub fn code(&self) -> &'static str {
        match self {
            PolicyViolation::ChannelRequired => "POLICY_CHANNEL_REQUIRED",
            PolicyViolation::NoMatchingRule { .. } => "POLICY_FORBIDDEN",
            PolicyViolation::MaxSizeExceeded { .. } => "POLICY_MAX_SIZE",
            PolicyViolation::UnknownType => "POLICY_UNKNOWN_TYPE",
            PolicyViolation::SuspiciousType { .. } => "POLICY_SUSPICIOUS_TYPE",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Forbidden: {0}")]
    Forbidden(#[from] PolicyViolation),

    /// Upload refused by the antivirus scan.
    #[error("Malware detected: {0}")]
    Malware(String),

    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid session state: {0}")]
    InvalidSessionState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl AppError {
    /// True for every policy rejection, whatever the reason.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, AppError::Forbidden(_))
    }

    pub fn policy_violation(&self) -> Option<&PolicyViolation> {
        match self {
            AppError::Forbidden(v) => Some(v),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

/// Stream errors carry policy and codec failures as their inner error; those
/// keep their kind, everything else is a transient backend failure.
impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        if let Some(violation) = PolicyViolation::from_io(&err) {
            return AppError::Forbidden(violation.clone());
        }
        if let Some(cipher) = CipherError::from_io(&err) {
            return AppError::AuthenticationFailure(cipher.to_string());
        }
        match err.kind() {
            io::ErrorKind::NotFound => AppError::NotFound(err.to_string()),
            io::ErrorKind::AlreadyExists => AppError::AlreadyExists(err.to_string()),
            _ => AppError::Backend(format!("IO error: {}", err)),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            StoreError::Conflict(msg) => AppError::AlreadyExists(msg),
            StoreError::Unavailable(msg) => AppError::Backend(msg),
        }
    }
}

impl From<CipherError> for AppError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::KeyFile(msg) => AppError::Config(msg),
            other => AppError::AuthenticationFailure(other.to_string()),
        }
    }
}

impl ErrorMetadata for AppError {
    fn http_status_code(&self) -> u16 {
        match self {
            AppError::NotFound(_) => 404,
            AppError::AlreadyExists(_) => 409,
            AppError::Forbidden(_) | AppError::Malware(_) => 403,
            AppError::AuthenticationFailure(_) => 422,
            AppError::Backend(_) => 503,
            AppError::InvalidSessionState(_) => 409,
            AppError::InvalidInput(_) => 400,
            AppError::Config(_) | AppError::Internal(_) | AppError::InternalWithSource { .. } => {
                500
            }
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::AlreadyExists(_) => "ALREADY_EXISTS",
            AppError::Forbidden(v) => v.code(),
            AppError::Malware(_) => "FILE_MALWARE",
            AppError::AuthenticationFailure(_) => "AUTHENTICATION_FAILURE",
            AppError::Backend(_) => "BACKEND_ERROR",
            AppError::InvalidSessionState(_) => "INVALID_SESSION_STATE",
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Internal(_) | AppError::InternalWithSource { .. } => "INTERNAL_ERROR",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::Backend(_) | AppError::Internal(_) | AppError::InternalWithSource { .. }
        )
    }

    fn client_message(&self) -> String {
        match self {
            AppError::Forbidden(v) => v.to_string(),
            AppError::Malware(_) => "File rejected by antivirus scan".to_string(),
            AppError::NotFound(msg)
            | AppError::AlreadyExists(msg)
            | AppError::InvalidSessionState(msg)
            | AppError::InvalidInput(msg) => msg.clone(),
            AppError::AuthenticationFailure(_) => "Stored data failed integrity check".to_string(),
            AppError::Backend(_) => "Failed to access storage".to_string(),
            AppError::Config(_) | AppError::Internal(_) | AppError::InternalWithSource { .. } => {
                "Internal server error".to_string()
            }
        }
    }

    fn log_level(&self) -> LogLevel {
        match self {
            AppError::NotFound(_) | AppError::AlreadyExists(_) | AppError::InvalidInput(_) => {
                LogLevel::Debug
            }
            AppError::Forbidden(_) | AppError::Malware(_) | AppError::InvalidSessionState(_) => {
                LogLevel::Warn
            }
            _ => LogLevel::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_violation_survives_io_wrapping() {
        let io_err = PolicyViolation::MaxSizeExceeded { max: 10 }.into_io();
        let err = AppError::from(io_err);
        assert!(err.is_forbidden());
        assert_eq!(
            err.policy_violation(),
            Some(&PolicyViolation::MaxSizeExceeded { max: 10 })
        );
        assert_eq!(err.http_status_code(), 403);
        assert_eq!(err.error_code(), "POLICY_MAX_SIZE");
        assert!(!err.is_recoverable());
        assert_eq!(err.log_level(), LogLevel::Warn);
    }

    #[test]
    fn test_nested_policy_violation_is_found_through_other_layers() {
        // An adapter that re-wraps the error keeps the original as its source.
        let inner = PolicyViolation::UnknownType.into_io();
        let outer = io::Error::other(inner);
        let recovered = outer
            .get_ref()
            .and_then(|e| e.downcast_ref::<io::Error>())
            .and_then(PolicyViolation::from_io);
        assert_eq!(recovered, Some(&PolicyViolation::UnknownType));
    }

    #[test]
    fn test_plain_io_error_is_transient_backend_failure() {
        let err = AppError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(err, AppError::Backend(_)));
        assert!(err.is_recoverable());
        assert_eq!(err.http_status_code(), 503);
        assert_eq!(err.client_message(), "Failed to access storage");
    }

    #[test]
    fn test_not_found_io_error() {
        let err = AppError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(err.log_level(), LogLevel::Debug);
    }

    #[test]
    fn test_cipher_failure_maps_to_authentication() {
        let err = AppError::from(CipherError::Authentication { block: 3 }.into_io());
        assert!(matches!(err, AppError::AuthenticationFailure(_)));
        assert_eq!(err.error_code(), "AUTHENTICATION_FAILURE");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_store_error_conversion() {
        assert!(matches!(
            AppError::from(StoreError::NotFound("file 1".into())),
            AppError::NotFound(_)
        ));
        assert!(matches!(
            AppError::from(StoreError::Unavailable("db down".into())),
            AppError::Backend(_)
        ));
    }

    #[test]
    fn test_malware_metadata() {
        let err = AppError::Malware("Eicar-Signature".into());
        assert_eq!(err.http_status_code(), 403);
        assert_eq!(err.error_code(), "FILE_MALWARE");
        assert!(!err.is_recoverable());
        assert!(!err.is_forbidden());
        assert!(!err.client_message().contains("Eicar"));
    }

    #[test]
    fn test_forbidden_client_message_names_reason() {
        let err = AppError::Forbidden(PolicyViolation::SuspiciousType {
            declared: "image/png".into(),
            detected: "application/pdf".into(),
        });
        assert!(err.client_message().contains("application/pdf"));
        assert!(err.client_message().contains("image/png"));
    }
}
