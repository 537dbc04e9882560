use std::collections::HashMap;
use std::sync::Arc;

use stowage_core::{FilePolicy, PolicyViolation};

use crate::pattern::glob_match;

const KIB: u64 = 1024;

/// Outcome of resolving a (channel, MIME) pair.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The channel has no policies: nothing is enforced.
    AllowAll,
    Policy(Arc<FilePolicy>),
}

impl Resolution {
    pub fn policy(&self) -> Option<&Arc<FilePolicy>> {
        match self {
            Resolution::AllowAll => None,
            Resolution::Policy(policy) => Some(policy),
        }
    }
}

/// Upload rate of a policy in bytes per second, `None` when unlimited.
pub fn upload_rate(policy: &FilePolicy) -> Option<u64> {
    (policy.speed_upload > 0).then(|| policy.speed_upload * KIB)
}

pub fn download_rate(policy: &FilePolicy) -> Option<u64> {
    (policy.speed_download > 0).then(|| policy.speed_download * KIB)
}

/// Channel index over one tenant's enabled policies.
#[derive(Debug, Default)]
pub struct PolicyHub {
    by_channel: HashMap<String, Vec<Arc<FilePolicy>>>,
}

impl PolicyHub {
    /// Index `policies` by channel, keeping their order. Disabled policies and
    /// policies without MIME patterns are skipped.
    pub fn new(policies: Vec<FilePolicy>) -> Self {
        let mut by_channel: HashMap<String, Vec<Arc<FilePolicy>>> = HashMap::new();
        for policy in policies {
            if !policy.enabled || policy.mime_types.is_empty() {
                continue;
            }
            let policy = Arc::new(policy);
            for channel in &policy.channels {
                by_channel
                    .entry(channel.clone())
                    .or_default()
                    .push(Arc::clone(&policy));
            }
        }
        Self { by_channel }
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }

    /// First policy of `channel` with a MIME pattern matching `mime`.
    pub fn policy(&self, channel: Option<&str>, mime: &str) -> Result<Resolution, PolicyViolation> {
        let channel = channel.ok_or(PolicyViolation::ChannelRequired)?;

        let Some(policies) = self.by_channel.get(channel) else {
            return Ok(Resolution::AllowAll);
        };

        policies
            .iter()
            .find(|p| p.mime_types.iter().any(|pattern| glob_match(pattern, mime)))
            .map(|p| Resolution::Policy(Arc::clone(p)))
            .ok_or_else(|| PolicyViolation::NoMatchingRule {
                channel: channel.to_string(),
                mime: mime.to_string(),
            })
    }
}
