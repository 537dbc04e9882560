//! Collaborator stores.
//!
//! Relational persistence lives outside this workspace; these traits are the
//! boundary the data plane talks to.

use std::time::Duration;

use async_trait::async_trait;

use crate::models::{BackendProfile, FileMetadata, FilePolicy, PendingUploadJob, ProfileKey, StoredFile};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist a committed file and return its id.
    async fn create_file(&self, file: &FileMetadata, profile_id: Option<i32>) -> StoreResult<i64>;

    async fn get_file_with_backend(&self, tenant_id: i64, id: i64) -> StoreResult<StoredFile>;

    async fn mark_removed(&self, tenant_id: i64, ids: &[i64]) -> StoreResult<()>;

    async fn create_pending_job(
        &self,
        file: &FileMetadata,
        profile_id: Option<i32>,
    ) -> StoreResult<PendingUploadJob>;

    /// Claim up to `limit` jobs for `node_id`.
    ///
    /// Idle jobs are always eligible; active and errored jobs become eligible
    /// again once they have not been touched for `stale_after`. Claimed jobs are
    /// marked active and their attempt counter is incremented.
    async fn claim_pending_jobs(
        &self,
        limit: usize,
        node_id: &str,
        stale_after: Duration,
    ) -> StoreResult<Vec<PendingUploadJob>>;

    /// Move a relayed job into the permanent file table and delete the job row.
    async fn complete_pending_job(
        &self,
        job_id: i64,
        file: &FileMetadata,
        profile_id: Option<i32>,
    ) -> StoreResult<i64>;

    async fn delete_pending_job(&self, id: i64) -> StoreResult<()>;

    async fn mark_pending_job_errored(&self, id: i64, reason: &str) -> StoreResult<()>;

    /// Delete errored jobs untouched for `older_than` and return them.
    async fn sweep_errored_jobs(&self, older_than: Duration) -> StoreResult<Vec<PendingUploadJob>>;
}

#[async_trait]
pub trait BackendProfileStore: Send + Sync {
    async fn get_profile(&self, id: i32) -> StoreResult<BackendProfile>;

    /// The tenant's default enabled profile, if it has one.
    async fn default_profile(&self, tenant_id: i64) -> StoreResult<Option<ProfileKey>>;

    /// Current version of a profile owned by `tenant_id`.
    async fn profile_key(&self, tenant_id: i64, id: i32) -> StoreResult<ProfileKey>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Enabled policies of a tenant in their stored order.
    async fn list_enabled_policies(&self, tenant_id: i64) -> StoreResult<Vec<FilePolicy>>;
}
