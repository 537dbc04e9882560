//! Antivirus scanning of chat uploads.
//!
//! The head of the policed stream is buffered (up to the configured limit),
//! handed to a [`MalwareScanner`] and then replayed in front of the rest of
//! the stream, so the bytes written are exactly the bytes read.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use stowage_core::config::ScanSettings;
use stowage_core::{channel, AppError, FileMetadata, MalwareScan, ScanMode, ScanStatus};
use stowage_storage::ByteReader;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    /// Signature name.
    Infected(String),
    Error(String),
}

#[async_trait]
pub trait MalwareScanner: Send + Sync {
    async fn scan(&self, data: Bytes) -> ScanVerdict;
}

/// A scanner plus what its verdicts mean for the upload.
#[derive(Clone)]
pub struct MalwareCheck {
    scanner: Arc<dyn MalwareScanner>,
    mode: ScanMode,
    max_bytes: u64,
}

impl MalwareCheck {
    pub fn new(scanner: Arc<dyn MalwareScanner>, settings: &ScanSettings) -> Self {
        Self {
            scanner,
            mode: settings.mode,
            max_bytes: settings.max_bytes,
        }
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Only chat attachments are scanned.
    pub fn applies_to(&self, file: &FileMetadata) -> bool {
        file.is_channel(channel::CHAT)
    }

    /// Scan the head of `src`, record the verdict on `file` and return a
    /// reader yielding the whole stream again.
    pub async fn check(
        &self,
        file: &mut FileMetadata,
        mut src: ByteReader,
    ) -> Result<ByteReader, AppError> {
        let mut head = Vec::new();
        (&mut src)
            .take(self.max_bytes.saturating_add(1))
            .read_to_end(&mut head)
            .await?;
        let head = Bytes::from(head);

        let verdict = if head.len() as u64 > self.max_bytes {
            ScanVerdict::Error(format!("file exceeds scan limit of {} bytes", self.max_bytes))
        } else {
            self.scanner.scan(head.clone()).await
        };
        apply_verdict(self.mode, verdict, file)?;

        Ok(Box::pin(Cursor::new(head).chain(src)))
    }
}

/// Record `verdict` on `file`, or refuse the upload.
///
/// Aggressive mode refuses infected and unscanned files. Quarantine mode
/// keeps infected files flagged. An infected file from an internal user is
/// refused in every mode.
pub fn apply_verdict(
    mode: ScanMode,
    verdict: ScanVerdict,
    file: &mut FileMetadata,
) -> Result<(), AppError> {
    let (status, description) = match verdict {
        ScanVerdict::Clean => (ScanStatus::Ok, None),
        ScanVerdict::Infected(signature) => (ScanStatus::Found, Some(signature)),
        ScanVerdict::Error(message) => (ScanStatus::Error, Some(message)),
    };
    let mut scan = MalwareScan {
        found: status == ScanStatus::Found,
        status,
        description,
        scan_date: Utc::now(),
        quarantine: false,
    };
    let signature = scan
        .description
        .clone()
        .unwrap_or_else(|| "unknown".to_string());

    match mode {
        ScanMode::Aggressive if scan.found || scan.status == ScanStatus::Error => {
            tracing::warn!(
                tenant_id = file.tenant_id,
                name = %file.name,
                status = ?scan.status,
                description = %signature,
                "Upload refused by antivirus scan"
            );
            return Err(AppError::Malware(signature));
        }
        ScanMode::Quarantine if scan.found => scan.quarantine = true,
        _ => {}
    }

    if scan.found {
        tracing::warn!(
            tenant_id = file.tenant_id,
            name = %file.name,
            signature = %signature,
            quarantine = scan.quarantine,
            "Virus detected on upload"
        );
        if file.uploaded_by.is_some() {
            return Err(AppError::Malware(signature));
        }
    } else if scan.status == ScanStatus::Error {
        tracing::warn!(
            tenant_id = file.tenant_id,
            name = %file.name,
            error = %signature,
            "Antivirus scan failed, storing unscanned"
        );
    }

    file.malware = Some(scan);
    Ok(())
}

#[cfg(feature = "clamav")]
pub use clamav::ClamavScanner;

#[cfg(feature = "clamav")]
mod clamav {
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use bytes::Bytes;
    use clamav_client::{clean, Tcp};

    use super::{MalwareScanner, ScanVerdict};

    /// Scanner backed by a clamd daemon reached over TCP.
    #[derive(Clone)]
    pub struct ClamavScanner {
        address: String,
        timeout: Duration,
    }

    impl ClamavScanner {
        pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
            Self {
                address: address.into(),
                timeout,
            }
        }
    }

    /// Interpret a clamd `INSTREAM` reply such as `stream: Eicar-Signature FOUND`.
    pub(super) fn verdict_from_response(response: &[u8]) -> ScanVerdict {
        match clean(response) {
            Ok(true) => ScanVerdict::Clean,
            Ok(false) => {
                let text = String::from_utf8_lossy(response);
                let text = text.trim_end_matches('\0').trim();
                match text.strip_suffix("FOUND") {
                    Some(rest) => {
                        let signature = rest
                            .rsplit(':')
                            .next()
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .unwrap_or("unknown");
                        ScanVerdict::Infected(signature.to_string())
                    }
                    None => ScanVerdict::Error(text.to_string()),
                }
            }
            Err(e) => ScanVerdict::Error(format!("Failed to parse ClamAV response: {}", e)),
        }
    }

    #[async_trait]
    impl MalwareScanner for ClamavScanner {
        async fn scan(&self, data: Bytes) -> ScanVerdict {
            let start = Instant::now();
            let address = self.address.clone();
            tracing::debug!(address = %address, size_bytes = data.len(), "Starting ClamAV scan");

            // The sync client keeps the future Send.
            let result = tokio::time::timeout(
                self.timeout,
                tokio::task::spawn_blocking(move || {
                    let connection = Tcp {
                        host_address: address.as_str(),
                    };
                    clamav_client::scan_buffer(&data, connection, None)
                }),
            )
            .await;

            let verdict = match result {
                Ok(Ok(Ok(response))) => verdict_from_response(&response),
                Ok(Ok(Err(e))) => ScanVerdict::Error(format!("ClamAV scan error: {}", e)),
                Ok(Err(e)) => ScanVerdict::Error(format!("ClamAV scan task join error: {}", e)),
                Err(_) => ScanVerdict::Error(format!(
                    "ClamAV scan timeout (exceeded {} seconds)",
                    self.timeout.as_secs()
                )),
            };

            match &verdict {
                ScanVerdict::Clean => tracing::info!(
                    duration_ms = start.elapsed().as_millis(),
                    "File scan completed: clean"
                ),
                ScanVerdict::Infected(virus) => tracing::warn!(
                    duration_ms = start.elapsed().as_millis(),
                    virus = %virus,
                    "File scan detected virus"
                ),
                ScanVerdict::Error(error) => {
                    tracing::error!(error = %error, "ClamAV scan failed")
                }
            }
            verdict
        }
    }
}
