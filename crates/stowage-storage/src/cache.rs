//! Process-wide cache of constructed backends.
//!
//! Entries are keyed by profile id and stay valid only while the instance's
//! sync time equals the profile's current `updated_at`. Construction is
//! coalesced per profile version.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lru::LruCache;
use stowage_core::config::CacheSettings;
use stowage_core::{BackendProfileStore, BlockCipher, ProfileKey};
use stowage_infra::SingleFlight;
use tokio::time::Instant;

use crate::factory::backend_from_profile;
use crate::{Backend, StorageError, StorageResult};

type BuildResult = Result<Arc<Backend>, StorageError>;
type DefaultEntry = (Instant, Option<ProfileKey>);

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

pub struct BackendCache {
    profiles: Arc<dyn BackendProfileStore>,
    cipher: Option<BlockCipher>,
    entries: Mutex<LruCache<i32, Arc<Backend>>>,
    flights: SingleFlight<ProfileKey, BuildResult>,
    tenant_defaults: Mutex<LruCache<i64, DefaultEntry>>,
    tenant_flights: SingleFlight<i64, Result<Option<ProfileKey>, StorageError>>,
    tenant_ttl: Duration,
    fallback: Option<Arc<Backend>>,
}

impl BackendCache {
    pub fn new(
        profiles: Arc<dyn BackendProfileStore>,
        cipher: Option<BlockCipher>,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            profiles,
            cipher,
            entries: Mutex::new(LruCache::new(capacity(settings.backend_capacity))),
            flights: SingleFlight::new(),
            tenant_defaults: Mutex::new(LruCache::new(capacity(settings.backend_capacity))),
            tenant_flights: SingleFlight::new(),
            tenant_ttl: settings.tenant_backend_ttl,
            fallback: None,
        }
    }

    /// Backend used for tenants without a default profile.
    pub fn with_fallback(mut self, backend: Arc<Backend>) -> Self {
        self.fallback = Some(backend);
        self
    }

    pub fn fallback(&self) -> Option<&Arc<Backend>> {
        self.fallback.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the cached instance of a profile.
    pub fn invalidate(&self, profile_id: i32) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(&profile_id);
    }

    /// The backend for `key`, rebuilding it when the cached instance is stale.
    pub async fn get(&self, key: ProfileKey) -> StorageResult<Arc<Backend>> {
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(backend) = entries.get(&key.id) {
                if backend.sync_time() == key.updated_at {
                    return Ok(Arc::clone(backend));
                }
            }
        }

        let profiles = Arc::clone(&self.profiles);
        let cipher = self.cipher.clone();
        let (result, shared) = self
            .flights
            .run(key, move || async move {
                let start = std::time::Instant::now();
                let profile = profiles.get_profile(key.id).await?;
                let backend = backend_from_profile(&profile, cipher)?;
                backend.test_connection().await?;
                tracing::info!(
                    profile_id = key.id,
                    backend = %backend.name(),
                    kind = %backend.kind(),
                    sync_time = backend.sync_time(),
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Backend constructed"
                );
                Ok(Arc::new(backend))
            })
            .await;

        let backend = result.inspect_err(|e| {
            tracing::warn!(profile_id = key.id, error = %e, "Backend construction failed");
        })?;
        if !shared {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .put(key.id, Arc::clone(&backend));
        }
        Ok(backend)
    }

    /// The backend referenced by a stored file, or the fallback when the file
    /// has none.
    pub async fn resolve(&self, key: Option<ProfileKey>) -> StorageResult<Arc<Backend>> {
        match key {
            Some(key) => self.get(key).await,
            None => self.fallback_or_err(),
        }
    }

    /// A tenant-owned profile selected explicitly by id.
    pub async fn for_profile(&self, tenant_id: i64, profile_id: i32) -> StorageResult<Arc<Backend>> {
        let key = self.profile_key(tenant_id, profile_id).await?;
        self.get(key).await
    }

    /// Current version of a tenant-owned profile. Fails when the tenant does
    /// not own it.
    pub async fn profile_key(&self, tenant_id: i64, profile_id: i32) -> StorageResult<ProfileKey> {
        Ok(self.profiles.profile_key(tenant_id, profile_id).await?)
    }

    /// The tenant's default backend and its profile id.
    pub async fn for_tenant(&self, tenant_id: i64) -> StorageResult<(Option<i32>, Arc<Backend>)> {
        match self.default_profile(tenant_id).await? {
            Some(key) => Ok((Some(key.id), self.get(key).await?)),
            None => Ok((None, self.fallback_or_err()?)),
        }
    }

    fn fallback_or_err(&self) -> StorageResult<Arc<Backend>> {
        self.fallback.clone().ok_or_else(|| {
            StorageError::ConfigError("no backend profile and no fallback backend".to_string())
        })
    }

    /// The tenant's default profile, cached for the tenant TTL.
    pub async fn default_profile(&self, tenant_id: i64) -> StorageResult<Option<ProfileKey>> {
        {
            let mut defaults = self
                .tenant_defaults
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some((loaded_at, key)) = defaults.get(&tenant_id) {
                if loaded_at.elapsed() < self.tenant_ttl {
                    return Ok(*key);
                }
            }
        }

        let profiles = Arc::clone(&self.profiles);
        let (result, shared) = self
            .tenant_flights
            .run(tenant_id, move || async move {
                profiles
                    .default_profile(tenant_id)
                    .await
                    .map_err(StorageError::from)
            })
            .await;

        let key = result?;
        if !shared {
            self.tenant_defaults
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .put(tenant_id, (Instant::now(), key));
        }
        Ok(key)
    }
}
