//! Configuration module
//!
//! Settings are read from environment variables (a `.env` file is honoured)
//! with constant defaults, then checked by [`Config::validate`].

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;

// Defaults
const CACHE_DIR: &str = "./data/cache";
const CACHE_PATH_PATTERN: &str = "$DOMAIN/$Y/$M/$D";
const DEFAULT_STORE_PATTERN: &str = "$DOMAIN/$CHANNEL/$Y/$M/$D/$H";
const RELAY_WORKERS: usize = 10;
const RELAY_PAGE_SIZE: usize = 100;
const RELAY_POLL_INTERVAL_MS: u64 = 2000;
const RELAY_RETRY_AFTER_SECS: u64 = 60;
const RELAY_ERRORED_TTL_SECS: u64 = 7 * 24 * 3600;
const RELAY_SWEEP_INTERVAL_SECS: u64 = 3600;
const POLICY_CACHE_TTL_SECS: u64 = 15;
const POLICY_CACHE_CAPACITY: usize = 1000;
const BACKEND_CACHE_CAPACITY: usize = 500;
const TENANT_BACKEND_TTL_SECS: u64 = 15;
const SAFE_UPLOAD_CAPACITY: usize = 4000;
const SAFE_UPLOAD_PIPE_CHUNKS: usize = 16;
const CLAMAV_TIMEOUT_SECS: u64 = 30;
const CLAMAV_MAX_SCAN_BYTES: u64 = 25 * 1024 * 1024;
const THUMBNAIL_DEFAULT_SCALE: &str = "128:-1";
const THUMBNAIL_MAX_SOURCE_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct StorageSettings {
    /// Shared secret for at-rest encryption. Encryption is unavailable when unset.
    pub encryption_key_file: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub cache_path_pattern: String,
    /// Fallback local backend for tenants without a backend profile.
    pub default_store_dir: Option<PathBuf>,
    pub default_store_pattern: String,
}

#[derive(Clone, Debug)]
pub struct RelaySettings {
    pub workers: usize,
    pub page_size: usize,
    pub poll_interval: Duration,
    pub retry_after: Duration,
    pub errored_ttl: Duration,
    pub sweep_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct CacheSettings {
    pub policy_ttl: Duration,
    pub policy_capacity: usize,
    pub backend_capacity: usize,
    pub tenant_backend_ttl: Duration,
}

#[derive(Clone, Debug)]
pub struct SafeUploadSettings {
    pub capacity: usize,
    pub pipe_chunks: usize,
    pub max_sleep: Option<Duration>,
}

/// What the antivirus verdict does to a chat upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// Refuse infected files and files that could not be scanned.
    Aggressive,
    /// Store infected files marked as quarantined.
    Quarantine,
    /// Record the verdict only.
    Skip,
}

#[derive(Clone, Debug)]
pub struct ScanSettings {
    /// `host:port` of a clamd daemon. Scanning is off when unset.
    pub address: Option<String>,
    pub mode: ScanMode,
    pub timeout: Duration,
    /// Larger files are recorded as not scanned.
    pub max_bytes: u64,
}

/// Thumbnail size as `width:height`; `-1` on one side keeps the aspect ratio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThumbnailScale {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ThumbnailScale {
    /// Target dimensions for a `width` x `height` source.
    pub fn fit(&self, width: u32, height: u32) -> (u32, u32) {
        let scaled = |side: u32, num: u32, den: u32| -> u32 {
            let value = (u64::from(side) * u64::from(num) + u64::from(den) / 2) / u64::from(den.max(1));
            u32::try_from(value).unwrap_or(u32::MAX).max(1)
        };
        match (self.width, self.height) {
            (Some(w), Some(h)) => (w, h),
            (Some(w), None) => (w, scaled(height, w, width)),
            (None, Some(h)) => (scaled(width, h, height), h),
            (None, None) => (width.max(1), height.max(1)),
        }
    }
}

impl FromStr for ThumbnailScale {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let side = |part: &str| -> Result<Option<u32>, anyhow::Error> {
            match part.trim() {
                "-1" => Ok(None),
                n => match n.parse::<u32>() {
                    Ok(v) if v > 0 => Ok(Some(v)),
                    _ => bail!("invalid thumbnail side: {}", part),
                },
            }
        };
        let Some((width, height)) = s.split_once(':') else {
            bail!("thumbnail scale must be width:height, got {}", s);
        };
        let scale = ThumbnailScale {
            width: side(width)?,
            height: side(height)?,
        };
        if scale.width.is_none() && scale.height.is_none() {
            bail!("thumbnail scale needs at least one fixed side: {}", s);
        }
        Ok(scale)
    }
}

impl fmt::Display for ThumbnailScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |v: Option<u32>| v.map_or_else(|| "-1".to_string(), |v| v.to_string());
        write!(f, "{}:{}", side(self.width), side(self.height))
    }
}

#[derive(Clone, Debug)]
pub struct ThumbnailSettings {
    /// Generate thumbnails even when the upload did not ask for one.
    pub force_enabled: bool,
    pub default_scale: ThumbnailScale,
    /// Larger images get no thumbnail.
    pub max_source_bytes: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub node_id: String,
    pub log_format: LogFormat,
    pub storage: StorageSettings,
    pub relay: RelaySettings,
    pub cache: CacheSettings,
    pub safe_upload: SafeUploadSettings,
    pub scan: ScanSettings,
    pub thumbnail: ThumbnailSettings,
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn flag(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim),
        Some("1" | "true" | "yes" | "on")
    )
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (e.g. for tests; avoids env mutation).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let node_id = match get("STOWAGE_NODE_ID") {
            Some(id) => id,
            None => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "stowage".to_string()),
        };

        let log_format = match get("STOWAGE_LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => bail!("Invalid STOWAGE_LOG_FORMAT: {}", other),
        };

        let storage = StorageSettings {
            encryption_key_file: get("STOWAGE_ENCRYPTION_KEY_FILE").map(PathBuf::from),
            cache_dir: get("STOWAGE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(CACHE_DIR)),
            cache_path_pattern: get("STOWAGE_CACHE_PATH_PATTERN")
                .unwrap_or_else(|| CACHE_PATH_PATTERN.to_string()),
            default_store_dir: get("STOWAGE_DEFAULT_STORE_DIR").map(PathBuf::from),
            default_store_pattern: get("STOWAGE_DEFAULT_STORE_PATTERN")
                .unwrap_or_else(|| DEFAULT_STORE_PATTERN.to_string()),
        };

        let relay = RelaySettings {
            workers: parse_or(get("STOWAGE_RELAY_WORKERS"), RELAY_WORKERS),
            page_size: parse_or(get("STOWAGE_RELAY_PAGE_SIZE"), RELAY_PAGE_SIZE),
            poll_interval: Duration::from_millis(parse_or(
                get("STOWAGE_RELAY_POLL_INTERVAL_MS"),
                RELAY_POLL_INTERVAL_MS,
            )),
            retry_after: Duration::from_secs(parse_or(
                get("STOWAGE_RELAY_RETRY_AFTER_SECS"),
                RELAY_RETRY_AFTER_SECS,
            )),
            errored_ttl: Duration::from_secs(parse_or(
                get("STOWAGE_RELAY_ERRORED_TTL_SECS"),
                RELAY_ERRORED_TTL_SECS,
            )),
            sweep_interval: Duration::from_secs(parse_or(
                get("STOWAGE_RELAY_SWEEP_INTERVAL_SECS"),
                RELAY_SWEEP_INTERVAL_SECS,
            )),
        };

        let cache = CacheSettings {
            policy_ttl: Duration::from_secs(parse_or(
                get("STOWAGE_POLICY_CACHE_TTL_SECS"),
                POLICY_CACHE_TTL_SECS,
            )),
            policy_capacity: parse_or(get("STOWAGE_POLICY_CACHE_CAPACITY"), POLICY_CACHE_CAPACITY),
            backend_capacity: parse_or(
                get("STOWAGE_BACKEND_CACHE_CAPACITY"),
                BACKEND_CACHE_CAPACITY,
            ),
            tenant_backend_ttl: Duration::from_secs(parse_or(
                get("STOWAGE_TENANT_BACKEND_TTL_SECS"),
                TENANT_BACKEND_TTL_SECS,
            )),
        };

        let safe_upload = SafeUploadSettings {
            capacity: parse_or(get("STOWAGE_SAFE_UPLOAD_CAPACITY"), SAFE_UPLOAD_CAPACITY),
            pipe_chunks: parse_or(get("STOWAGE_SAFE_UPLOAD_PIPE_CHUNKS"), SAFE_UPLOAD_PIPE_CHUNKS),
            max_sleep: get("STOWAGE_SAFE_UPLOAD_MAX_SLEEP_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        };

        let scan = ScanSettings {
            address: get("STOWAGE_CLAMAV_ADDRESS"),
            mode: match get("STOWAGE_CLAMAV_MODE").as_deref() {
                None | Some("quarantine") => ScanMode::Quarantine,
                Some("aggressive") => ScanMode::Aggressive,
                Some("skip") => ScanMode::Skip,
                Some(other) => bail!("Invalid STOWAGE_CLAMAV_MODE: {}", other),
            },
            timeout: Duration::from_secs(parse_or(
                get("STOWAGE_CLAMAV_TIMEOUT_SECS"),
                CLAMAV_TIMEOUT_SECS,
            )),
            max_bytes: parse_or(get("STOWAGE_CLAMAV_MAX_SCAN_BYTES"), CLAMAV_MAX_SCAN_BYTES),
        };

        let thumbnail = ThumbnailSettings {
            force_enabled: flag(get("STOWAGE_THUMBNAIL_FORCE_ENABLED")),
            default_scale: get("STOWAGE_THUMBNAIL_DEFAULT_SCALE")
                .as_deref()
                .unwrap_or(THUMBNAIL_DEFAULT_SCALE)
                .parse()?,
            max_source_bytes: parse_or(
                get("STOWAGE_THUMBNAIL_MAX_SOURCE_BYTES"),
                THUMBNAIL_MAX_SOURCE_BYTES,
            ),
        };

        Ok(Config {
            node_id,
            log_format,
            storage,
            relay,
            cache,
            safe_upload,
            scan,
            thumbnail,
        })
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.relay.workers == 0 {
            bail!("STOWAGE_RELAY_WORKERS must be at least 1");
        }
        if self.relay.page_size == 0 {
            bail!("STOWAGE_RELAY_PAGE_SIZE must be at least 1");
        }
        if self.cache.policy_capacity == 0
            || self.cache.backend_capacity == 0
            || self.safe_upload.capacity == 0
        {
            bail!("cache capacities must be at least 1");
        }
        if self.safe_upload.pipe_chunks == 0 {
            bail!("STOWAGE_SAFE_UPLOAD_PIPE_CHUNKS must be at least 1");
        }
        if self.scan.timeout.is_zero() {
            bail!("STOWAGE_CLAMAV_TIMEOUT_SECS must be at least 1");
        }
        if let Some(path) = &self.storage.encryption_key_file {
            if !path.is_file() {
                bail!(
                    "STOWAGE_ENCRYPTION_KEY_FILE does not point to a file: {}",
                    path.display()
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, anyhow::Error> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("STOWAGE_NODE_ID", "node-1")]).unwrap();
        assert_eq!(config.node_id, "node-1");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.relay.workers, RELAY_WORKERS);
        assert_eq!(config.relay.page_size, 100);
        assert_eq!(config.relay.retry_after, Duration::from_secs(60));
        assert_eq!(config.cache.policy_ttl, Duration::from_secs(15));
        assert_eq!(config.safe_upload.capacity, 4000);
        assert_eq!(config.safe_upload.max_sleep, None);
        assert_eq!(config.storage.cache_path_pattern, CACHE_PATH_PATTERN);
        assert!(config.storage.encryption_key_file.is_none());
        assert_eq!(config.scan.address, None);
        assert_eq!(config.scan.mode, ScanMode::Quarantine);
        assert!(!config.thumbnail.force_enabled);
        assert_eq!(config.thumbnail.default_scale.to_string(), "128:-1");
        config.validate().unwrap();
    }

    #[test]
    fn test_scan_and_thumbnail_settings() {
        let config = config_from(&[
            ("STOWAGE_CLAMAV_ADDRESS", "clamd:3310"),
            ("STOWAGE_CLAMAV_MODE", "aggressive"),
            ("STOWAGE_THUMBNAIL_FORCE_ENABLED", "true"),
            ("STOWAGE_THUMBNAIL_DEFAULT_SCALE", "-1:64"),
        ])
        .unwrap();
        assert_eq!(config.scan.address.as_deref(), Some("clamd:3310"));
        assert_eq!(config.scan.mode, ScanMode::Aggressive);
        assert!(config.thumbnail.force_enabled);
        assert_eq!(
            config.thumbnail.default_scale,
            ThumbnailScale {
                width: None,
                height: Some(64)
            }
        );

        assert!(config_from(&[("STOWAGE_CLAMAV_MODE", "paranoid")]).is_err());
        assert!(config_from(&[("STOWAGE_THUMBNAIL_DEFAULT_SCALE", "-1:-1")]).is_err());
        assert!(config_from(&[("STOWAGE_THUMBNAIL_DEFAULT_SCALE", "128")]).is_err());
    }

    #[test]
    fn test_thumbnail_scale_fit() {
        let scale: ThumbnailScale = "128:-1".parse().unwrap();
        assert_eq!(scale.fit(1024, 768), (128, 96));
        assert_eq!(scale.fit(64, 4096), (128, 8192));
        let tall: ThumbnailScale = "-1:100".parse().unwrap();
        assert_eq!(tall.fit(1000, 200), (500, 100));
        let exact: ThumbnailScale = "32:32".parse().unwrap();
        assert_eq!(exact.fit(10, 1000), (32, 32));
        // Never collapses to zero.
        assert_eq!(scale.fit(10_000, 1), (128, 1));
    }

    #[test]
    fn test_overrides_and_bad_numbers_fall_back() {
        let config = config_from(&[
            ("STOWAGE_RELAY_WORKERS", "3"),
            ("STOWAGE_RELAY_PAGE_SIZE", "not-a-number"),
            ("STOWAGE_SAFE_UPLOAD_MAX_SLEEP_SECS", "30"),
            ("STOWAGE_LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(config.relay.workers, 3);
        assert_eq!(config.relay.page_size, RELAY_PAGE_SIZE);
        assert_eq!(config.safe_upload.max_sleep, Some(Duration::from_secs(30)));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_log_format() {
        assert!(config_from(&[("STOWAGE_LOG_FORMAT", "xml")]).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers_and_missing_key_file() {
        let config = config_from(&[("STOWAGE_RELAY_WORKERS", "0")]).unwrap();
        assert!(config.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.key");
        let config =
            config_from(&[("STOWAGE_ENCRYPTION_KEY_FILE", missing.to_str().unwrap())]).unwrap();
        assert!(config.validate().is_err());
    }
}
