use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Storage driver types
///
/// Selects the driver a backend profile is constructed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Local,
    S3,
}

impl FromStr for DriverKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "file" => Ok(DriverKind::Local),
            "s3" => Ok(DriverKind::S3),
            _ => Err(anyhow::anyhow!("Invalid storage driver: {}", s)),
        }
    }
}

impl Display for DriverKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            DriverKind::Local => write!(f, "local"),
            DriverKind::S3 => write!(f, "s3"),
        }
    }
}
