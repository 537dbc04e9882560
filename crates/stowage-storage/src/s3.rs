use std::io;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use object_store::{GetOptions, GetRange, ObjectStore, ObjectStoreExt};
use stowage_core::models::property;
use stowage_core::FileMetadata;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

use crate::error::{ByteReader, StorageError, StorageResult};
use crate::io::copy_counted;
use crate::keys::{clean_directory, join_key, object_name, render_pattern};

const AWS_DEFAULT_ENDPOINT: &str = "amazonaws.com";
const DEFAULT_REGION: &str = "us-east-1";
const CONNECTION_CHECK_KEY: &str = ".stowage-connection-check";

/// Connection settings of an S3-compatible backend profile.
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub region: Option<String>,
    /// Provider host, e.g. `amazonaws.com`, `storage.googleapis.com` or `minio:9000`.
    pub endpoint: Option<String>,
    pub key_id: String,
    pub access_key: String,
    pub path_pattern: String,
    pub force_path_style: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedEndpoint {
    /// `None` keeps the provider default (AWS).
    pub url: Option<String>,
    pub virtual_hosted: bool,
    pub allow_http: bool,
}

fn requires_path_style(host: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host);
    host == "storage.googleapis.com" || host.ends_with("selcdn.ru")
}

/// Work out the endpoint URL and addressing style for `settings`.
pub(crate) fn resolve_endpoint(settings: &S3Settings) -> ResolvedEndpoint {
    let endpoint = settings
        .endpoint
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .trim_end_matches('/');

    if endpoint.is_empty() || endpoint == AWS_DEFAULT_ENDPOINT {
        return ResolvedEndpoint {
            url: None,
            virtual_hosted: true,
            allow_http: false,
        };
    }

    let (scheme, host) = match endpoint.split_once("://") {
        Some((scheme, host)) => (scheme, host),
        None => ("https", endpoint),
    };
    let allow_http = scheme == "http";

    if settings.force_path_style || requires_path_style(host) {
        return ResolvedEndpoint {
            url: Some(format!("{}://{}", scheme, host)),
            virtual_hosted: false,
            allow_http,
        };
    }

    let url = match settings.region.as_deref().filter(|r| !r.is_empty()) {
        Some(region) => format!("{}://{}.{}.{}", scheme, settings.bucket, region, host),
        None => format!("{}://{}.{}", scheme, settings.bucket, host),
    };
    ResolvedEndpoint {
        url: Some(url),
        virtual_hosted: true,
        allow_http,
    }
}

/// S3-compatible object storage driver
#[derive(Clone)]
pub struct S3Driver {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    path_pattern: String,
}

impl std::fmt::Debug for S3Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Driver")
            .field("bucket", &self.bucket)
            .field("path_pattern", &self.path_pattern)
            .finish()
    }
}

impl S3Driver {
    pub fn new(settings: S3Settings) -> StorageResult<Self> {
        if settings.bucket.trim().is_empty() {
            return Err(StorageError::ConfigError("S3 bucket is required".to_string()));
        }

        let endpoint = resolve_endpoint(&settings);
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(settings.bucket.clone())
            .with_region(
                settings
                    .region
                    .clone()
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            )
            .with_access_key_id(settings.key_id.clone())
            .with_secret_access_key(settings.access_key.clone())
            .with_virtual_hosted_style_request(endpoint.virtual_hosted);

        if let Some(url) = endpoint.url {
            builder = builder
                .with_endpoint(url)
                .with_allow_http(endpoint.allow_http);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::ConfigError(e.to_string()))?;

        Ok(Self {
            store: Arc::new(store),
            bucket: settings.bucket,
            path_pattern: settings.path_pattern,
        })
    }

    pub async fn test_connection(&self) -> StorageResult<()> {
        match self.store.head(&Path::from(CONNECTION_CHECK_KEY)).await {
            Ok(_) | Err(ObjectStoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(StorageError::ConfigError(format!(
                "S3 bucket {} is not reachable: {}",
                self.bucket, e
            ))),
        }
    }

    fn location(file: &FileMetadata) -> StorageResult<String> {
        match file.property(property::LOCATION) {
            Some(key) if !key.is_empty() => clean_directory(key),
            _ => Err(StorageError::InvalidKey(format!(
                "file {} has no object location",
                file.store_name()
            ))),
        }
    }

    /// Stream `src` as a multipart upload, then ask the bucket for the stored size.
    pub async fn write(&self, mut src: ByteReader, file: &mut FileMetadata) -> StorageResult<u64> {
        let directory = clean_directory(&render_pattern(&self.path_pattern, file, Utc::now()))?;
        let key = join_key(&directory, &object_name(file)?);
        let location = Path::from(key.clone());
        let start = std::time::Instant::now();

        let mut writer = BufWriter::new(Arc::clone(&self.store), location.clone());
        let copied = match copy_counted(&mut src, &mut writer).await {
            Ok(n) => writer.shutdown().await.map(|_| n).map_err(StorageError::from),
            Err(e) => Err(e),
        };
        let copied = match copied {
            Ok(n) => n,
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    tracing::warn!(error = %abort, key = %key, "Failed to abort S3 upload");
                }
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload failed"
                );
                return Err(e);
            }
        };

        let meta = self.store.head(&location).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to stat uploaded object {}: {}", key, e))
        })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = meta.size,
            copied_bytes = copied,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );

        file.set_property(property::LOCATION, key);
        Ok(meta.size)
    }

    pub async fn reader(&self, file: &FileMetadata, offset: u64) -> StorageResult<ByteReader> {
        let key = Self::location(file)?;
        let mut options = GetOptions::default();
        if offset > 0 {
            options.range = Some(GetRange::Offset(offset));
        }

        let result = self
            .store
            .get_opts(&Path::from(key.clone()), options)
            .await
            .map_err(|e| match e {
                ObjectStoreError::NotFound { .. } => StorageError::NotFound(key.clone()),
                other => StorageError::DownloadFailed(other.to_string()),
            })?;

        let stream = result.into_stream().map(|chunk| chunk.map_err(io::Error::other));
        Ok(Box::pin(StreamReader::new(stream)))
    }

    pub async fn remove(&self, file: &FileMetadata) -> StorageResult<()> {
        let key = Self::location(file)?;
        let start = std::time::Instant::now();

        self.store
            .delete(&Path::from(key.clone()))
            .await
            .map_err(|e| match e {
                ObjectStoreError::NotFound { .. } => StorageError::NotFound(key.clone()),
                other => {
                    tracing::error!(
                        error = %other,
                        bucket = %self.bucket,
                        key = %key,
                        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "S3 delete failed"
                    );
                    StorageError::DeleteFailed(other.to_string())
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(endpoint: Option<&str>, region: Option<&str>) -> S3Settings {
        S3Settings {
            bucket: "records".to_string(),
            region: region.map(str::to_string),
            endpoint: endpoint.map(str::to_string),
            key_id: "id".to_string(),
            access_key: "secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_aws_default() {
        for endpoint in [None, Some(""), Some("amazonaws.com")] {
            let resolved = resolve_endpoint(&settings(endpoint, Some("eu-west-1")));
            assert_eq!(resolved.url, None);
            assert!(resolved.virtual_hosted);
        }
    }

    #[test]
    fn test_path_style_providers() {
        let gcs = resolve_endpoint(&settings(Some("storage.googleapis.com"), Some("eu")));
        assert_eq!(gcs.url.as_deref(), Some("https://storage.googleapis.com"));
        assert!(!gcs.virtual_hosted);

        let selectel = resolve_endpoint(&settings(Some("s3.storage.selcdn.ru"), None));
        assert_eq!(selectel.url.as_deref(), Some("https://s3.storage.selcdn.ru"));
        assert!(!selectel.virtual_hosted);

        let mut forced = settings(Some("http://minio:9000"), Some("local"));
        forced.force_path_style = true;
        let minio = resolve_endpoint(&forced);
        assert_eq!(minio.url.as_deref(), Some("http://minio:9000"));
        assert!(minio.allow_http);
        assert!(!minio.virtual_hosted);
    }

    #[test]
    fn test_virtual_hosted_with_and_without_region() {
        let with_region = resolve_endpoint(&settings(Some("digitaloceanspaces.com"), Some("nyc3")));
        assert_eq!(
            with_region.url.as_deref(),
            Some("https://records.nyc3.digitaloceanspaces.com")
        );
        assert!(with_region.virtual_hosted);
        assert!(!with_region.allow_http);

        let without = resolve_endpoint(&settings(Some("example.net/"), None));
        assert_eq!(without.url.as_deref(), Some("https://records.example.net"));
    }

    #[test]
    fn test_missing_bucket_is_rejected() {
        let mut blank = settings(None, None);
        blank.bucket = " ".to_string();
        let err = S3Driver::new(blank).unwrap_err();
        assert!(matches!(err, StorageError::ConfigError(_)));
    }

    #[test]
    fn test_location_must_be_present() {
        let file = FileMetadata::new(1, "r", "a.txt", "text/plain");
        assert!(matches!(
            S3Driver::location(&file),
            Err(StorageError::InvalidKey(_))
        ));
    }
}
