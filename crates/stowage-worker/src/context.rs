//! Relay handler trait
//!
//! The upload layer implements [`RelayHandler`]; the queue claims jobs and
//! hands each one to it.

use std::fmt;

use async_trait::async_trait;
use stowage_core::PendingUploadJob;

#[async_trait]
pub trait RelayHandler: Send + Sync {
    /// Move the job's cached bytes to their destination and commit the file.
    async fn relay(&self, job: &PendingUploadJob) -> Result<(), RelayError>;

    /// Release what a job holds once it is dropped for good (the cached copy).
    async fn discard(&self, job: &PendingUploadJob);
}

/// Relay failure, either worth retrying or not.
#[derive(Debug)]
pub struct RelayError {
    inner: anyhow::Error,
    recoverable: bool,
}

impl RelayError {
    /// The job can never succeed (e.g. a policy rejects the content).
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
        }
    }

    /// The job may succeed later (backend or store unavailable).
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability() {
        assert!(!RelayError::permanent(anyhow::anyhow!("forbidden")).is_recoverable());
        assert!(RelayError::transient(anyhow::anyhow!("timeout")).is_recoverable());
        let converted: RelayError = anyhow::anyhow!("unknown").into();
        assert!(converted.is_recoverable());
        assert_eq!(converted.to_string(), "unknown");
    }
}
