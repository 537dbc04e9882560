use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known channel tags.
pub mod channel {
    pub const CALL: &str = "call";
    pub const CHAT: &str = "chat";
    pub const MAIL: &str = "mail";
    pub const SCREENSHOT: &str = "screenshot";
    /// Tenant-managed assets. Exempt from forced encryption and subject to
    /// content sniffing.
    pub const MEDIA: &str = "media";
}

/// Property keys written by the storage drivers.
pub mod property {
    /// Sub-path under a local backend's root.
    pub const DIRECTORY: &str = "directory";
    /// Object key or URL reported by an object-storage backend.
    pub const LOCATION: &str = "location";
}

/// Metadata of one stored file.
///
/// Mutable while an upload is in flight (the policy stage sets the encryption
/// flag, policy id and retention), then persisted once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Assigned by the metadata store on commit.
    pub id: Option<i64>,
    pub tenant_id: i64,
    /// Identifier of the request or entity that owns the file.
    pub request_id: String,
    pub name: String,
    pub view_name: String,
    pub size: u64,
    pub mime_type: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    pub channel: Option<String>,
    pub sha256: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    pub retention_until: Option<DateTime<Utc>>,
    pub policy_id: Option<i32>,
    pub created_at: Option<DateTime<Utc>>,
    /// Internal user who uploaded the file, `None` for external parties.
    pub uploaded_by: Option<i64>,
    /// Request a thumbnail for image uploads.
    #[serde(default)]
    pub generate_thumbnail: bool,
    pub malware: Option<MalwareScan>,
    pub thumbnail: Option<Thumbnail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanStatus {
    Ok,
    Found,
    Error,
}

/// Antivirus verdict recorded on a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalwareScan {
    pub found: bool,
    pub status: ScanStatus,
    /// Signature name, or the failure message when the scan errored.
    pub description: Option<String>,
    pub scan_date: DateTime<Utc>,
    /// Infected file kept for review instead of being rejected.
    #[serde(default)]
    pub quarantine: bool,
}

/// Preview image stored next to its file in the same backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// `width:height`, `-1` keeps the aspect ratio.
    pub scale: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl FileMetadata {
    pub fn new(
        tenant_id: i64,
        request_id: impl Into<String>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            tenant_id,
            request_id: request_id.into(),
            view_name: name.clone(),
            name,
            mime_type: mime_type.into(),
            ..Default::default()
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Object name used by every backend: `{request_id}_{name}`.
    pub fn store_name(&self) -> String {
        format!("{}_{}", self.request_id, self.name)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: &str, value: impl Into<String>) {
        self.properties.insert(key.to_string(), value.into());
    }

    pub fn is_channel(&self, channel: &str) -> bool {
        self.channel.as_deref() == Some(channel)
    }

    /// Metadata of this file's thumbnail: `thumbnail_{name}.png`, same tenant,
    /// request and channel.
    pub fn thumbnail_file(&self) -> FileMetadata {
        let mut thumb = FileMetadata::new(
            self.tenant_id,
            self.request_id.clone(),
            format!("thumbnail_{}.png", self.name),
            "image/png",
        );
        thumb.channel = self.channel.clone();
        thumb.encrypted = self.encrypted;
        thumb
    }
}
