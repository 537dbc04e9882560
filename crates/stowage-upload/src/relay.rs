//! Relay of cached uploads to their destination backend.

use std::sync::Arc;

use async_trait::async_trait;
use stowage_core::PendingUploadJob;
use stowage_policy::PolicyError;
use stowage_storage::{Backend, StorageError};
use stowage_worker::{RelayError, RelayHandler};

use crate::context::UploadContext;
use crate::hashing::hashing;
use crate::service::log_write_failure;

/// [`RelayHandler`] moving a job's cached bytes through the policy pipeline
/// into the destination backend.
pub struct RelayProcessor {
    ctx: UploadContext,
}

impl RelayProcessor {
    pub fn new(ctx: UploadContext) -> Self {
        Self { ctx }
    }

    async fn destination(&self, job: &PendingUploadJob) -> Result<Arc<Backend>, StorageError> {
        match job.profile_id {
            Some(id) => self.ctx.backends.for_profile(job.file.tenant_id, id).await,
            None => self.ctx.backends.resolve(None).await,
        }
    }

    async fn remove_cached(&self, job: &PendingUploadJob) {
        match self.ctx.cache.remove(&job.file).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(job.id = job.id, error = %e, "Failed to remove cached copy");
            }
        }
    }
}

fn classify(err: StorageError) -> RelayError {
    if err.policy_violation().is_some() {
        RelayError::permanent(err)
    } else {
        RelayError::transient(err)
    }
}

#[async_trait]
impl RelayHandler for RelayProcessor {
    async fn relay(&self, job: &PendingUploadJob) -> Result<(), RelayError> {
        let tenant_id = job.file.tenant_id;
        let backend = self.destination(job).await.map_err(RelayError::transient)?;

        let cached = match self.ctx.cache.reader(&job.file, 0).await {
            Ok(reader) => reader,
            Err(e) if e.is_not_found() => return Err(RelayError::permanent(e)),
            Err(e) => return Err(RelayError::transient(e)),
        };

        // The job carries where the cache put the bytes; the destination
        // driver records its own location.
        let mut file = job.file.clone();
        file.id = None;
        file.properties.clear();

        let policed = self
            .ctx
            .policies
            .wrap_for_upload(tenant_id, &mut file, cached)
            .await
            .map_err(|e| match e {
                PolicyError::Violation(_) => RelayError::permanent(e),
                PolicyError::Store(_) => RelayError::transient(e),
            })?;
        let (hashed, digest) = hashing(policed);

        let written = match backend.write(Box::pin(hashed), &mut file).await {
            Ok(size) => {
                file.size = size;
                file.sha256 = Some(digest.hex());
                true
            }
            Err(e) if e.is_already_exists() => {
                tracing::debug!(
                    job.id = job.id,
                    backend = %backend.name(),
                    "Relayed object already stored"
                );
                false
            }
            Err(e) => {
                log_write_failure(&file, &e);
                return Err(classify(e));
            }
        };

        let file_id = match self
            .ctx
            .metadata
            .complete_pending_job(job.id, &file, job.profile_id)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                // The cached copy stays for the retry; the uncommitted object goes.
                if written {
                    if let Err(remove) = backend.remove(&file).await {
                        tracing::warn!(
                            job.id = job.id,
                            backend = %backend.name(),
                            error = %remove,
                            "Failed to remove uncommitted relayed object"
                        );
                    }
                }
                return Err(RelayError::transient(e));
            }
        };

        self.remove_cached(job).await;
        tracing::debug!(
            job.id = job.id,
            file_id,
            backend = %backend.name(),
            size_bytes = file.size,
            "Relayed file committed"
        );
        Ok(())
    }

    async fn discard(&self, job: &PendingUploadJob) {
        self.remove_cached(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use stowage_core::config::CacheSettings;
    use stowage_core::models::property;
    use stowage_core::test_helpers::{
        MemoryBackendProfileStore, MemoryMetadataStore, MemoryPolicyStore,
    };
    use stowage_core::{channel, FileMetadata, FilePolicy};
    use stowage_policy::FilePolicyService;
    use stowage_storage::{BackendCache, Driver, LocalDriver};
    use tempfile::TempDir;

    use crate::service::UploadService;

    fn settings() -> CacheSettings {
        CacheSettings {
            policy_ttl: Duration::from_secs(15),
            policy_capacity: 10,
            backend_capacity: 10,
            tenant_backend_ttl: Duration::from_secs(15),
        }
    }

    fn setup() -> (TempDir, MemoryMetadataStore, MemoryPolicyStore, UploadContext) {
        let dir = tempfile::tempdir().unwrap();
        let profiles = MemoryBackendProfileStore::new();
        let metadata = MemoryMetadataStore::new(profiles.clone());
        let policies = MemoryPolicyStore::new();

        let fallback = Backend::new(
            "default",
            Driver::Local(LocalDriver::new(dir.path().join("store"), "$DOMAIN")),
        );
        let cache = Backend::new(
            "cache",
            Driver::Local(LocalDriver::new(dir.path().join("cache"), "$DOMAIN")),
        );
        let ctx = UploadContext::new(
            Arc::new(metadata.clone()),
            Arc::new(FilePolicyService::new(Arc::new(policies.clone()), &settings())),
            Arc::new(
                BackendCache::new(Arc::new(profiles), None, &settings())
                    .with_fallback(Arc::new(fallback)),
            ),
            Arc::new(cache),
            "node-test",
        );
        (dir, metadata, policies, ctx)
    }

    async fn queue(ctx: &UploadContext, request: &str, mime: &str, data: &[u8]) -> PendingUploadJob {
        let file = FileMetadata::new(1, request, "item.bin", mime).with_channel(channel::CHAT);
        UploadService::new(ctx.clone())
            .upload_cached(file, None, Box::pin(Cursor::new(data.to_vec())))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_relay_commits_and_clears_cache() {
        let (dir, metadata, _policies, ctx) = setup();
        let job = queue(&ctx, "r1", "text/plain", b"relayed").await;
        let processor = RelayProcessor::new(ctx);

        processor.relay(&job).await.unwrap();

        assert!(metadata.job(job.id).is_none());
        let rows = metadata.files();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].file.size, 7);
        assert!(rows[0].file.sha256.is_some());
        assert_eq!(rows[0].file.property(property::DIRECTORY), Some("1"));
        assert!(dir.path().join("store/1/r1_item.bin").is_file());
        assert!(!dir.path().join("cache/1/r1_item.bin").exists());
    }

    #[tokio::test]
    async fn test_policy_rejection_is_permanent() {
        let (dir, metadata, policies, ctx) = setup();
        policies.insert(FilePolicy {
            id: 3,
            tenant_id: 1,
            name: "images".to_string(),
            enabled: true,
            channels: vec![channel::CHAT.to_string()],
            mime_types: vec!["image/*".to_string()],
            ..Default::default()
        });
        let job = queue(&ctx, "r2", "text/plain", b"not an image").await;
        let processor = RelayProcessor::new(ctx);

        let err = processor.relay(&job).await.unwrap_err();
        assert!(!err.is_recoverable());
        assert!(metadata.files().is_empty());
        assert!(!dir.path().join("store/1/r2_item.bin").exists());

        processor.discard(&job).await;
        assert!(!dir.path().join("cache/1/r2_item.bin").exists());
    }

    #[tokio::test]
    async fn test_missing_cache_copy_is_permanent() {
        let (dir, _metadata, _policies, ctx) = setup();
        let job = queue(&ctx, "r3", "text/plain", b"gone").await;
        std::fs::remove_file(dir.path().join("cache/1/r3_item.bin")).unwrap();

        let err = RelayProcessor::new(ctx).relay(&job).await.unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_store_failure_is_transient() {
        let (dir, metadata, _policies, ctx) = setup();
        let job = queue(&ctx, "r4", "text/plain", b"bytes").await;
        metadata.set_unavailable(true);

        let err = RelayProcessor::new(ctx).relay(&job).await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(dir.path().join("cache/1/r4_item.bin").is_file());
    }

    #[tokio::test]
    async fn test_uncommitted_object_is_removed() {
        let (dir, metadata, _policies, ctx) = setup();
        let job = queue(&ctx, "r5", "text/plain", b"bytes").await;
        metadata.set_unavailable(true);
        let processor = RelayProcessor::new(ctx);

        processor.relay(&job).await.unwrap_err();
        assert!(!dir.path().join("store/1/r5_item.bin").exists());
        assert!(dir.path().join("cache/1/r5_item.bin").is_file());

        metadata.set_unavailable(false);
        processor.relay(&job).await.unwrap();
        assert!(dir.path().join("store/1/r5_item.bin").is_file());
        assert!(!dir.path().join("cache/1/r5_item.bin").exists());
    }
}
