//! Storage errors and the byte stream type shared by every driver.

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use stowage_core::{AppError, CipherError, PolicyViolation, StoreError};
use thiserror::Error;
use tokio::io::AsyncRead;

/// Boxed byte stream passed into and out of backends.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage operation errors
///
/// `Clone` so a single construction result can be handed to every waiter of
/// the backend cache.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(Arc<io::Error>),

    /// The stream being written failed, not the destination.
    #[error("Source stream failed: {0}")]
    Source(Arc<io::Error>),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Repository(#[from] StoreError),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::IoError(Arc::new(err))
    }
}

impl From<CipherError> for StorageError {
    fn from(err: CipherError) -> Self {
        StorageError::ConfigError(err.to_string())
    }
}

impl StorageError {
    pub fn source_failed(err: io::Error) -> Self {
        StorageError::Source(Arc::new(err))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// The policy violation that aborted the source stream, if any.
    pub fn policy_violation(&self) -> Option<&PolicyViolation> {
        match self {
            StorageError::Source(err) => PolicyViolation::from_io(err),
            _ => None,
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => AppError::NotFound(msg),
            StorageError::AlreadyExists(msg) => AppError::AlreadyExists(msg),
            StorageError::InvalidKey(msg) => AppError::InvalidInput(msg),
            StorageError::ConfigError(msg) => AppError::Config(msg),
            StorageError::Repository(e) => AppError::from(e),
            StorageError::Source(e) => {
                if let Some(violation) = PolicyViolation::from_io(&e) {
                    AppError::Forbidden(violation.clone())
                } else if let Some(cipher) = CipherError::from_io(&e) {
                    AppError::AuthenticationFailure(cipher.to_string())
                } else {
                    AppError::Backend(format!("Source stream failed: {}", e))
                }
            }
            other => AppError::Backend(other.to_string()),
        }
    }
}
