//! Stowage Upload Library
//!
//! The three upload modes (direct, cached with background relay, resumable
//! safe uploads) and byte-range reads, composed from the storage backends and
//! the file policy pipeline. Direct uploads also run the antivirus scan and
//! thumbnail generation.

pub mod context;
pub mod hashing;
pub mod relay;
pub mod safe;
pub mod scan;
pub mod service;
pub mod thumbnail;

pub use context::UploadContext;
pub use hashing::{hashing, Digest, HashingReader};
pub use relay::RelayProcessor;
pub use safe::{SafeUpload, SafeUploadOutcome, SafeUploadRegistry, SessionState};
pub use scan::{MalwareCheck, MalwareScanner, ScanVerdict};
pub use service::{FileRead, UploadService};
pub use thumbnail::{ThumbnailGenerator, Thumbnails};
