use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use super::{FileMetadata, ProfileKey};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Active,
    Errored,
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobState::Idle => write!(f, "idle"),
            JobState::Active => write!(f, "active"),
            JobState::Errored => write!(f, "errored"),
        }
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobState::Idle),
            "active" => Ok(JobState::Active),
            "errored" => Ok(JobState::Errored),
            _ => Err(anyhow::anyhow!("Invalid job state: {}", s)),
        }
    }
}

/// Bytes already cached locally that still have to reach their destination
/// backend. `file` carries the cache backend's properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUploadJob {
    pub id: i64,
    pub file: FileMetadata,
    /// Destination profile. `None` means the fallback store.
    pub profile_id: Option<i32>,
    pub state: JobState,
    pub attempts: u32,
    pub node_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A committed file together with the backend it was written to.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file: FileMetadata,
    /// `None` when the file lives on the fallback store.
    pub profile: Option<ProfileKey>,
}
