//! Test helpers for downstream crates
//!
//! In-memory implementations of the collaborator stores, so storage, policy,
//! worker and upload code can be exercised without a database.

pub mod memory_stores;

pub use memory_stores::{MemoryBackendProfileStore, MemoryMetadataStore, MemoryPolicyStore};
