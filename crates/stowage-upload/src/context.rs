//! Shared collaborators of the upload flows.

use std::sync::Arc;

use stowage_core::{
    AppError, BackendProfileStore, BlockCipher, Config, MetadataStore, PolicyStore,
};
use stowage_policy::FilePolicyService;
use stowage_storage::{Backend, BackendCache, Driver, LocalDriver};
use stowage_worker::RelayWaker;

use crate::scan::MalwareCheck;
use crate::thumbnail::Thumbnails;

/// Everything an upload needs, owned once per process and cloned cheaply.
#[derive(Clone)]
pub struct UploadContext {
    pub metadata: Arc<dyn MetadataStore>,
    pub policies: Arc<FilePolicyService>,
    pub backends: Arc<BackendCache>,
    /// Local backend holding cached uploads until they are relayed.
    pub cache: Arc<Backend>,
    pub relay: Option<RelayWaker>,
    /// Antivirus scan of chat uploads, off when no scanner is configured.
    pub malware: Option<MalwareCheck>,
    pub thumbnails: Option<Thumbnails>,
    pub node_id: String,
}

impl UploadContext {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        policies: Arc<FilePolicyService>,
        backends: Arc<BackendCache>,
        cache: Arc<Backend>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            metadata,
            policies,
            backends,
            cache,
            relay: None,
            malware: None,
            thumbnails: None,
            node_id: node_id.into(),
        }
    }

    /// Wake this relay pool whenever a cached upload is queued.
    pub fn with_relay(mut self, waker: RelayWaker) -> Self {
        self.relay = Some(waker);
        self
    }

    pub fn with_malware_check(mut self, check: MalwareCheck) -> Self {
        self.malware = Some(check);
        self
    }

    pub fn with_thumbnails(mut self, thumbnails: Thumbnails) -> Self {
        self.thumbnails = Some(thumbnails);
        self
    }

    /// Build the context described by `config` on top of the given stores.
    ///
    /// Loads the encryption key when one is configured and sets up the cache
    /// backend and, if configured, the fallback store.
    pub fn from_config(
        config: &Config,
        metadata: Arc<dyn MetadataStore>,
        profiles: Arc<dyn BackendProfileStore>,
        policies: Arc<dyn PolicyStore>,
    ) -> Result<Self, AppError> {
        let storage = &config.storage;
        let cipher = storage
            .encryption_key_file
            .as_ref()
            .map(BlockCipher::from_key_file)
            .transpose()?;
        if cipher.is_none() {
            tracing::warn!("No encryption key configured, policies requiring encryption will fail");
        }

        let cache = Backend::new(
            "cache",
            Driver::Local(LocalDriver::new(
                &storage.cache_dir,
                storage.cache_path_pattern.clone(),
            )),
        );

        let mut backends = BackendCache::new(profiles, cipher.clone(), &config.cache);
        if let Some(dir) = &storage.default_store_dir {
            let fallback = Backend::new(
                "default",
                Driver::Local(LocalDriver::new(dir, storage.default_store_pattern.clone())),
            )
            .with_cipher(cipher);
            backends = backends.with_fallback(Arc::new(fallback));
        }

        let mut ctx = Self::new(
            metadata,
            Arc::new(FilePolicyService::new(policies, &config.cache)),
            Arc::new(backends),
            Arc::new(cache),
            config.node_id.clone(),
        );

        if let Some(address) = &config.scan.address {
            #[cfg(feature = "clamav")]
            {
                let scanner = crate::scan::ClamavScanner::new(address.clone(), config.scan.timeout);
                ctx = ctx.with_malware_check(MalwareCheck::new(Arc::new(scanner), &config.scan));
            }
            #[cfg(not(feature = "clamav"))]
            tracing::warn!(address = %address, "Built without ClamAV support, scanning disabled");
        }

        #[cfg(feature = "thumbnail")]
        {
            ctx = ctx.with_thumbnails(Thumbnails::new(
                Arc::new(crate::thumbnail::ImageThumbnailer),
                &config.thumbnail,
            ));
        }

        tracing::info!(
            node_id = %config.node_id,
            cache_dir = %storage.cache_dir.display(),
            fallback = storage.default_store_dir.is_some(),
            malware_scan = ?ctx.malware.as_ref().map(MalwareCheck::mode),
            thumbnails = ctx.thumbnails.is_some(),
            "Upload context ready"
        );

        Ok(ctx)
    }

    pub(crate) fn wake_relay(&self) {
        if let Some(waker) = &self.relay {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_core::test_helpers::{
        MemoryBackendProfileStore, MemoryMetadataStore, MemoryPolicyStore,
    };
    use tempfile::tempdir;

    fn config(pairs: &[(&str, String)]) -> Config {
        let pairs = pairs.to_vec();
        Config::from_lookup(move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    fn stores() -> (
        Arc<dyn MetadataStore>,
        Arc<dyn BackendProfileStore>,
        Arc<dyn PolicyStore>,
    ) {
        let profiles = MemoryBackendProfileStore::new();
        (
            Arc::new(MemoryMetadataStore::new(profiles.clone())),
            Arc::new(profiles),
            Arc::new(MemoryPolicyStore::new()),
        )
    }

    #[test]
    fn test_from_config_with_fallback() {
        let dir = tempdir().unwrap();
        let config = config(&[
            ("STOWAGE_CACHE_DIR", dir.path().join("cache").display().to_string()),
            (
                "STOWAGE_DEFAULT_STORE_DIR",
                dir.path().join("store").display().to_string(),
            ),
            ("STOWAGE_NODE_ID", "node-a".to_string()),
        ]);
        let (metadata, profiles, policies) = stores();

        let ctx = UploadContext::from_config(&config, metadata, profiles, policies).unwrap();
        assert_eq!(ctx.node_id, "node-a");
        assert_eq!(ctx.cache.name(), "cache");
        assert_eq!(ctx.backends.fallback().map(|b| b.name()), Some("default"));
        assert!(ctx.relay.is_none());
        assert!(ctx.malware.is_none());
    }

    #[test]
    fn test_from_config_with_clamav() {
        let dir = tempdir().unwrap();
        let config = config(&[
            ("STOWAGE_CACHE_DIR", dir.path().join("cache").display().to_string()),
            ("STOWAGE_CLAMAV_ADDRESS", "127.0.0.1:3310".to_string()),
            ("STOWAGE_CLAMAV_MODE", "aggressive".to_string()),
        ]);
        let (metadata, profiles, policies) = stores();

        let ctx = UploadContext::from_config(&config, metadata, profiles, policies).unwrap();
        let check = ctx.malware.expect("scanner configured");
        assert_eq!(check.mode(), stowage_core::ScanMode::Aggressive);
        assert!(ctx.thumbnails.is_some());
    }

    #[test]
    fn test_from_config_with_missing_key_file_fails() {
        let dir = tempdir().unwrap();
        let config = config(&[(
            "STOWAGE_ENCRYPTION_KEY_FILE",
            dir.path().join("missing.key").display().to_string(),
        )]);
        let (metadata, profiles, policies) = stores();

        let result = UploadContext::from_config(&config, metadata, profiles, policies);
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
