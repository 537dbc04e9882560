//! Stowage Storage Library
//!
//! Backends persist file bytes for a tenant. A [`Backend`] wraps one of a
//! closed set of drivers (local filesystem, S3-compatible object storage),
//! applies the block cipher when a file is flagged as encrypted, and keeps the
//! bookkeeping used by the backend instance cache.
//!
//! # Object layout
//!
//! Objects are stored as `{rendered path pattern}/{request_id}_{name}`. The
//! rendered directory (local) or full object key (S3) is written back onto the
//! file's properties so reads and removals never re-render the pattern.

pub mod backend;
pub mod cache;
pub mod error;
pub mod factory;
pub(crate) mod io;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-s3")]
pub mod s3;

// Re-export commonly used types
pub use backend::{Backend, Driver};
pub use cache::BackendCache;
pub use error::{ByteReader, StorageError, StorageResult};
pub use factory::backend_from_profile;
#[cfg(feature = "storage-local")]
pub use local::LocalDriver;
#[cfg(feature = "storage-s3")]
pub use s3::{S3Driver, S3Settings};
pub use stowage_core::DriverKind;
