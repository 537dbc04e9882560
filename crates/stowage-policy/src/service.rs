use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use lru::LruCache;
use stowage_core::config::CacheSettings;
use stowage_core::{channel, AppError, FileMetadata, PolicyStore, PolicyViolation, StoreError};
use stowage_infra::SingleFlight;
use tokio::io::AsyncRead;
use tokio::time::Instant;

use crate::hub::{download_rate, upload_rate, PolicyHub, Resolution};
use crate::reader::PolicyReader;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    #[error(transparent)]
    Violation(#[from] PolicyViolation),

    #[error("policy store: {0}")]
    Store(#[from] StoreError),
}

impl From<PolicyError> for AppError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Violation(v) => AppError::Forbidden(v),
            PolicyError::Store(e) => AppError::from(e),
        }
    }
}

type HubEntry = (Instant, Arc<PolicyHub>);

/// Resolves tenant policies and wraps transfer streams with them.
pub struct FilePolicyService {
    store: Arc<dyn PolicyStore>,
    hubs: Mutex<LruCache<i64, HubEntry>>,
    flights: SingleFlight<i64, Result<Arc<PolicyHub>, PolicyError>>,
    ttl: Duration,
}

impl FilePolicyService {
    pub fn new(store: Arc<dyn PolicyStore>, settings: &CacheSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.policy_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            hubs: Mutex::new(LruCache::new(capacity)),
            flights: SingleFlight::new(),
            ttl: settings.policy_ttl,
        }
    }

    /// The tenant's policy hub, loaded at most once per cache window.
    pub async fn hub(&self, tenant_id: i64) -> Result<Arc<PolicyHub>, PolicyError> {
        {
            let mut hubs = self.hubs.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((loaded_at, hub)) = hubs.get(&tenant_id) {
                if loaded_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(hub));
                }
            }
        }

        let store = Arc::clone(&self.store);
        let (result, shared) = self
            .flights
            .run(tenant_id, move || async move {
                let policies = store.list_enabled_policies(tenant_id).await?;
                let count = policies.len();
                let hub = PolicyHub::new(policies);
                tracing::debug!(tenant_id, policies = count, "Policy hub loaded");
                Ok(Arc::new(hub))
            })
            .await;

        let hub = result?;
        if !shared {
            self.hubs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .put(tenant_id, (Instant::now(), Arc::clone(&hub)));
        }
        Ok(hub)
    }

    pub async fn resolve(&self, tenant_id: i64, file: &FileMetadata) -> Result<Resolution, PolicyError> {
        let hub = self.hub(tenant_id).await?;
        Ok(hub.policy(file.channel.as_deref(), &file.mime_type)?)
    }

    /// Wrap an upload stream with the policy matching `file`.
    ///
    /// The first time a file passes through here the policy id, encryption
    /// flag and retention are recorded on it; later passes (relays) leave
    /// them untouched.
    pub async fn wrap_for_upload<R>(
        &self,
        tenant_id: i64,
        file: &mut FileMetadata,
        src: R,
    ) -> Result<PolicyReader<R>, PolicyError>
    where
        R: AsyncRead + Unpin,
    {
        let resolution = self.resolve(tenant_id, file).await.inspect_err(|e| {
            if let PolicyError::Violation(v) = e {
                tracing::warn!(
                    tenant_id,
                    channel = ?file.channel,
                    mime = %file.mime_type,
                    reason = v.code(),
                    "Upload rejected by policy"
                );
            }
        })?;

        let Some(policy) = resolution.policy() else {
            return Ok(PolicyReader::new(src));
        };

        if file.policy_id.is_none() {
            file.policy_id = Some(policy.id);
            if policy.encrypt && !file.is_channel(channel::MEDIA) {
                file.encrypted = true;
            }
            if policy.retention_days > 0 {
                file.retention_until =
                    Some(Utc::now() + chrono::Duration::days(i64::from(policy.retention_days)));
            }
        }

        let mut reader = PolicyReader::new(src);
        if policy.max_upload_size > 0 {
            reader = reader.with_max_size(policy.max_upload_size);
        }
        if let Some(rate) = upload_rate(policy) {
            reader = reader.with_rate(rate);
        }
        if file.is_channel(channel::MEDIA) {
            reader = reader.with_content_check(file.mime_type.clone());
        }
        Ok(reader)
    }

    /// Wrap a download stream with the download rate of the policy matching
    /// `file`. A file no policy of its channel matches is refused.
    pub async fn wrap_for_download<R>(
        &self,
        tenant_id: i64,
        file: &FileMetadata,
        src: R,
    ) -> Result<PolicyReader<R>, PolicyError>
    where
        R: AsyncRead + Unpin,
    {
        let resolution = self.resolve(tenant_id, file).await.inspect_err(|e| {
            if let PolicyError::Violation(v) = e {
                tracing::warn!(
                    tenant_id,
                    channel = ?file.channel,
                    mime = %file.mime_type,
                    reason = v.code(),
                    "Download rejected by policy"
                );
            }
        })?;

        let reader = PolicyReader::new(src);
        Ok(match resolution.policy().and_then(|p| download_rate(p)) {
            Some(rate) => reader.with_rate(rate),
            None => reader,
        })
    }
}
