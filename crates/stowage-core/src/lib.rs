//! Stowage Core Library
//!
//! Domain models, error kinds, configuration, the block cipher codec used for
//! encryption at rest, and the collaborator store traits shared by every
//! Stowage crate.

pub mod config;
pub mod encryption;
pub mod error;
pub mod models;
pub mod repository;
pub mod storage_types;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

// Re-export commonly used types
pub use config::{Config, ScanMode, ThumbnailScale};
pub use encryption::{BlockCipher, CipherError, DecryptingReader, EncryptingReader};
pub use error::{AppError, ErrorMetadata, LogLevel, PolicyViolation};
pub use models::{
    channel, BackendProfile, FileMetadata, FilePolicy, JobState, MalwareScan, PendingUploadJob,
    ProfileKey, ScanStatus, StoredFile, Thumbnail,
};
pub use repository::{
    BackendProfileStore, MetadataStore, PolicyStore, StoreError, StoreResult,
};
pub use storage_types::DriverKind;
