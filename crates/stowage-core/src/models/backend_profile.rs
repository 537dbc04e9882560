use serde::{Deserialize, Serialize};

use crate::storage_types::DriverKind;

/// Configuration of one storage driver instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendProfile {
    pub id: i32,
    pub tenant_id: i64,
    pub name: String,
    pub kind: DriverKind,
    /// Driver settings: `directory`/`path_pattern` for local,
    /// `bucket`/`region`/`endpoint`/`key_id`/`access_key`/`path_pattern`/
    /// `force_path_style` for object storage.
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Version tag. Cached backend instances are valid only while it is unchanged.
    pub updated_at: i64,
    /// Retention of the backend's own housekeeping, in days. Zero disables it.
    pub expire_day: i32,
    #[serde(default)]
    pub disabled: bool,
}

impl BackendProfile {
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn property_bool(&self, key: &str) -> bool {
        match self.properties.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn key(&self) -> ProfileKey {
        ProfileKey {
            id: self.id,
            updated_at: self.updated_at,
        }
    }
}

/// Profile id plus the update timestamp it must match to be served from cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileKey {
    pub id: i32,
    pub updated_at: i64,
}
