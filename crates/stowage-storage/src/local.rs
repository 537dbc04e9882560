use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use chrono::Utc;
use stowage_core::models::property;
use stowage_core::FileMetadata;
use tokio::fs;
use tokio::io::AsyncSeekExt;

use crate::error::{ByteReader, StorageError, StorageResult};
use crate::io::copy_counted;
use crate::keys::{clean_directory, object_name, render_pattern};

/// Local filesystem driver
///
/// Files land in `{root}/{rendered path pattern}/{request_id}_{name}`.
#[derive(Debug, Clone)]
pub struct LocalDriver {
    root: PathBuf,
    path_pattern: String,
}

/// Deletes a partially written file unless disarmed. Covers both failed
/// copies and writes whose future is dropped mid-way.
struct PartialFile {
    path: Option<PathBuf>,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file");
                }
            }
        }
    }
}

impl LocalDriver {
    /// # Arguments
    /// * `root` - Root directory for file storage (e.g., "/var/lib/stowage/files")
    /// * `path_pattern` - Template for the sub-directory of each file (see [`crate::keys`])
    pub fn new(root: impl Into<PathBuf>, path_pattern: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            path_pattern: path_pattern.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn test_connection(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                self.root.display(),
                e
            ))
        })?;
        let meta = fs::metadata(&self.root).await?;
        if !meta.is_dir() {
            return Err(StorageError::ConfigError(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    fn object_path(&self, directory: &str, file: &FileMetadata) -> StorageResult<PathBuf> {
        let directory = clean_directory(directory)?;
        let mut path = self.root.clone();
        if !directory.is_empty() {
            path.push(directory);
        }
        path.push(object_name(file)?);
        Ok(path)
    }

    /// Write `src` and record the sub-directory on the file's properties.
    ///
    /// An existing non-empty destination is left untouched and reported as
    /// [`StorageError::AlreadyExists`]; the directory property is still set.
    pub async fn write(&self, mut src: ByteReader, file: &mut FileMetadata) -> StorageResult<u64> {
        let directory = clean_directory(&render_pattern(&self.path_pattern, file, Utc::now()))?;
        let path = self.object_path(&directory, file)?;

        if let Ok(existing) = fs::metadata(&path).await {
            if existing.len() > 0 {
                file.set_property(property::DIRECTORY, directory);
                return Err(StorageError::AlreadyExists(path.display().to_string()));
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::UploadFailed(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut out = fs::File::create(&path).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to create file {}: {}", path.display(), e))
        })?;
        let mut partial = PartialFile::new(path.clone());

        let written = copy_counted(&mut src, &mut out).await?;
        out.sync_all().await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to sync file {}: {}", path.display(), e))
        })?;
        partial.disarm();

        file.set_property(property::DIRECTORY, directory);
        Ok(written)
    }

    /// Open the stored bytes, positioned at `offset`.
    pub async fn reader(&self, file: &FileMetadata, offset: u64) -> StorageResult<ByteReader> {
        let directory = file.property(property::DIRECTORY).unwrap_or_default();
        let path = self.object_path(directory, file)?;

        let mut handle = fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
            _ => StorageError::DownloadFailed(format!(
                "Failed to open file {}: {}",
                path.display(),
                e
            )),
        })?;
        if offset > 0 {
            handle.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::pin(handle))
    }

    pub async fn remove(&self, file: &FileMetadata) -> StorageResult<()> {
        let directory = file.property(property::DIRECTORY).unwrap_or_default();
        let path = self.object_path(directory, file)?;

        fs::remove_file(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
            _ => StorageError::DeleteFailed(format!(
                "Failed to delete file {}: {}",
                path.display(),
                e
            )),
        })
    }
}
