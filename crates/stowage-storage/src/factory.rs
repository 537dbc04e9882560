use stowage_core::{BackendProfile, BlockCipher, DriverKind};

#[cfg(feature = "storage-local")]
use crate::LocalDriver;
#[cfg(feature = "storage-s3")]
use crate::{S3Driver, S3Settings};
use crate::{Backend, Driver, StorageError, StorageResult};

/// Build a backend from a stored profile.
///
/// The instance is stamped with the profile's `updated_at` so the cache can
/// tell when it went stale. Connectivity is not checked here.
pub fn backend_from_profile(
    profile: &BackendProfile,
    cipher: Option<BlockCipher>,
) -> StorageResult<Backend> {
    if profile.disabled {
        return Err(StorageError::ConfigError(format!(
            "backend profile {} is disabled",
            profile.id
        )));
    }

    let path_pattern = profile.property_str("path_pattern").unwrap_or_default();

    let driver = match profile.kind {
        #[cfg(feature = "storage-local")]
        DriverKind::Local => {
            let directory = profile.property_str("directory").ok_or_else(|| {
                StorageError::ConfigError(format!(
                    "backend profile {} has no directory",
                    profile.id
                ))
            })?;
            Driver::Local(LocalDriver::new(directory, path_pattern))
        }

        #[cfg(not(feature = "storage-local"))]
        DriverKind::Local => {
            return Err(StorageError::ConfigError(
                "Local storage backend not available (storage-local feature not enabled)"
                    .to_string(),
            ))
        }

        #[cfg(feature = "storage-s3")]
        DriverKind::S3 => {
            let required = |key: &str| {
                profile.property_str(key).map(str::to_string).ok_or_else(|| {
                    StorageError::ConfigError(format!(
                        "backend profile {} has no {}",
                        profile.id, key
                    ))
                })
            };
            Driver::S3(S3Driver::new(S3Settings {
                bucket: required("bucket")?,
                region: profile.property_str("region").map(str::to_string),
                endpoint: profile.property_str("endpoint").map(str::to_string),
                key_id: required("key_id")?,
                access_key: required("access_key")?,
                path_pattern: path_pattern.to_string(),
                force_path_style: profile.property_bool("force_path_style"),
            })?)
        }

        #[cfg(not(feature = "storage-s3"))]
        DriverKind::S3 => {
            return Err(StorageError::ConfigError(
                "S3 storage backend not available (storage-s3 feature not enabled)".to_string(),
            ))
        }
    };

    Ok(Backend::new(profile.name.clone(), driver)
        .with_sync_time(profile.updated_at)
        .with_expire_day(profile.expire_day)
        .with_cipher(cipher))
}
