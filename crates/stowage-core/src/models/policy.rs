use serde::{Deserialize, Serialize};

/// A stored file policy row.
///
/// Speeds are stored in KiB/s, zero meaning unlimited. `max_upload_size` is in
/// bytes, zero meaning unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilePolicy {
    pub id: i32,
    pub tenant_id: i64,
    pub name: String,
    pub enabled: bool,
    pub channels: Vec<String>,
    /// Glob patterns (`*`, `?`) matched against the declared MIME type.
    pub mime_types: Vec<String>,
    pub speed_upload: u64,
    pub speed_download: u64,
    pub max_upload_size: u64,
    pub retention_days: u32,
    pub encrypt: bool,
}
