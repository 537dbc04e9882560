//! Direct and cached uploads, byte-range reads and removal.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use stowage_core::{AppError, FileMetadata, PendingUploadJob, StoredFile, Thumbnail};
use stowage_storage::{Backend, ByteReader};
use tokio::io::AsyncReadExt;

use crate::context::UploadContext;
use crate::hashing::hashing;
use crate::thumbnail::{Captured, Thumbnails};

/// Length of the random prefix given to files addressed to an explicit
/// backend profile.
const PROFILE_PREFIX_LEN: usize = 7;

/// An open byte-range read.
pub struct FileRead {
    pub file: FileMetadata,
    pub reader: ByteReader,
    /// Logical size of the whole file, independent of the requested range.
    pub total_size: u64,
}

struct Destination {
    profile_id: Option<i32>,
    backend: Arc<Backend>,
}

fn random_prefix() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(PROFILE_PREFIX_LEN);
    id
}

pub struct UploadService {
    ctx: UploadContext,
}

impl UploadService {
    pub fn new(ctx: UploadContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &UploadContext {
        &self.ctx
    }

    async fn destination(
        &self,
        file: &mut FileMetadata,
        profile_id: Option<i32>,
    ) -> Result<Destination, AppError> {
        match profile_id {
            Some(id) => {
                let backend = self.ctx.backends.for_profile(file.tenant_id, id).await?;
                file.name = format!("{}_{}", random_prefix(), file.name);
                Ok(Destination {
                    profile_id: Some(id),
                    backend,
                })
            }
            None => {
                let (profile_id, backend) = self.ctx.backends.for_tenant(file.tenant_id).await?;
                Ok(Destination {
                    profile_id,
                    backend,
                })
            }
        }
    }

    /// Stream `src` straight to the destination backend and persist the file.
    ///
    /// Without `profile_id` the tenant's default backend is used. Nothing is
    /// persisted when the write fails; an object that already exists under the
    /// same name is taken as this upload's bytes.
    ///
    /// Chat uploads pass the antivirus scan first when one is configured.
    /// Image uploads asking for a thumbnail get one stored next to them; the
    /// upload fails, and its object is removed, when the thumbnail cannot be
    /// stored.
    #[tracing::instrument(skip(self, file, src), fields(tenant_id = file.tenant_id, name = %file.name))]
    pub async fn upload_direct(
        &self,
        mut file: FileMetadata,
        profile_id: Option<i32>,
        src: ByteReader,
    ) -> Result<FileMetadata, AppError> {
        let start = Instant::now();
        let destination = self.destination(&mut file, profile_id).await?;
        let tenant_id = file.tenant_id;

        let mut policed: ByteReader = Box::pin(
            self.ctx
                .policies
                .wrap_for_upload(tenant_id, &mut file, src)
                .await?,
        );
        if let Some(check) = self.ctx.malware.as_ref().filter(|c| c.applies_to(&file)) {
            policed = check.check(&mut file, policed).await?;
        }

        let thumbnails = self.ctx.thumbnails.as_ref().filter(|t| t.wanted_for(&file));
        let (source, captured): (ByteReader, Option<Captured>) = match thumbnails {
            Some(thumbs) => {
                let (reader, captured) = thumbs.capture(policed);
                (Box::pin(reader), Some(captured))
            }
            None => (policed, None),
        };
        let (hashed, digest) = hashing(source);

        let written = match destination.backend.write(Box::pin(hashed), &mut file).await {
            Ok(size) => {
                file.size = size;
                file.sha256 = Some(digest.hex());
                true
            }
            Err(e) if e.is_already_exists() => {
                tracing::debug!(
                    backend = %destination.backend.name(),
                    "Object already stored, keeping existing bytes"
                );
                false
            }
            Err(e) => {
                log_write_failure(&file, &e);
                return Err(e.into());
            }
        };

        if let (Some(thumbs), Some(captured), true) = (thumbnails, captured, written) {
            if let Err(e) = self
                .store_thumbnail(thumbs, captured, &destination.backend, &mut file)
                .await
            {
                if let Err(remove_err) = destination.backend.remove(&file).await {
                    tracing::warn!(
                        error = %remove_err,
                        "Failed to remove object after thumbnail failure"
                    );
                }
                return Err(e);
            }
        }

        let id = self
            .ctx
            .metadata
            .create_file(&file, destination.profile_id)
            .await?;
        file.id = Some(id);

        tracing::info!(
            file_id = id,
            backend = %destination.backend.name(),
            size_bytes = file.size,
            encrypted = file.encrypted,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "File stored"
        );
        Ok(file)
    }

    /// Render and store the thumbnail of a freshly written `file`. A source
    /// that cannot be rendered just gets no thumbnail.
    async fn store_thumbnail(
        &self,
        thumbs: &Thumbnails,
        captured: Captured,
        backend: &Backend,
        file: &mut FileMetadata,
    ) -> Result<(), AppError> {
        let Some(png) = thumbs.render(captured, &file.name).await else {
            return Ok(());
        };

        let mut thumb = file.thumbnail_file();
        let rendered = png.len() as u64;
        let size = match backend.write(Box::pin(Cursor::new(png)), &mut thumb).await {
            Ok(size) => size,
            Err(e) if e.is_already_exists() => rendered,
            Err(e) => {
                tracing::error!(
                    tenant_id = file.tenant_id,
                    backend = %backend.name(),
                    error = %e,
                    "Thumbnail write failed"
                );
                return Err(e.into());
            }
        };

        tracing::debug!(
            name = %thumb.name,
            size_bytes = size,
            scale = %thumbs.scale(),
            "Thumbnail stored"
        );
        file.thumbnail = Some(Thumbnail {
            name: thumb.name,
            mime_type: thumb.mime_type,
            size,
            scale: thumbs.scale().to_string(),
            properties: thumb.properties,
        });
        Ok(())
    }

    /// Write `src` to the local cache and queue it for relay to the
    /// destination backend.
    ///
    /// The destination profile is fixed now; policies are applied when the
    /// job is relayed.
    #[tracing::instrument(skip(self, file, src), fields(tenant_id = file.tenant_id, name = %file.name))]
    pub async fn upload_cached(
        &self,
        mut file: FileMetadata,
        profile_id: Option<i32>,
        src: ByteReader,
    ) -> Result<PendingUploadJob, AppError> {
        let tenant_id = file.tenant_id;
        let profile_id = match profile_id {
            Some(id) => {
                self.ctx.backends.profile_key(tenant_id, id).await?;
                file.name = format!("{}_{}", random_prefix(), file.name);
                Some(id)
            }
            None => self
                .ctx
                .backends
                .default_profile(tenant_id)
                .await?
                .map(|key| key.id),
        };

        file.size = self.ctx.cache.write(src, &mut file).await?;

        let job = match self.ctx.metadata.create_pending_job(&file, profile_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(error = %e, "Failed to queue cached upload");
                if let Err(remove_err) = self.ctx.cache.remove(&file).await {
                    tracing::error!(error = %remove_err, "Failed to remove cached copy");
                }
                return Err(e.into());
            }
        };

        tracing::debug!(
            job.id = job.id,
            size_bytes = file.size,
            "Cached upload queued for relay"
        );
        self.ctx.wake_relay();
        Ok(job)
    }

    /// Open a stored file at the logical `offset`, limited to `len` bytes when
    /// given. Reads are throttled by the download rate of the file's policy.
    pub async fn open_read(
        &self,
        tenant_id: i64,
        id: i64,
        offset: u64,
        len: Option<u64>,
    ) -> Result<FileRead, AppError> {
        let StoredFile { file, profile } = self
            .ctx
            .metadata
            .get_file_with_backend(tenant_id, id)
            .await?;
        let backend = self.ctx.backends.resolve(profile).await?;

        let raw = backend.reader(&file, offset).await?;
        let throttled = self
            .ctx
            .policies
            .wrap_for_download(tenant_id, &file, raw)
            .await?;
        let reader: ByteReader = match len {
            Some(len) => Box::pin(throttled.take(len)),
            None => Box::pin(throttled),
        };

        tracing::debug!(
            tenant_id,
            file_id = id,
            backend = %backend.name(),
            offset,
            len,
            "File opened for reading"
        );
        Ok(FileRead {
            total_size: file.size,
            file,
            reader,
        })
    }

    /// Mark files removed. Their bytes stay until [`UploadService::purge`].
    pub async fn remove_files(&self, tenant_id: i64, ids: &[i64]) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.ctx.metadata.mark_removed(tenant_id, ids).await?;
        tracing::info!(tenant_id, count = ids.len(), "Files marked removed");
        Ok(())
    }

    /// Delete a file's bytes from the backend holding them. A missing object
    /// counts as purged.
    pub async fn purge(&self, stored: &StoredFile) -> Result<(), AppError> {
        let backend = self.ctx.backends.resolve(stored.profile).await?;
        match backend.remove(&stored.file).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!(file_id = ?stored.file.id, "Object already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) fn log_write_failure(file: &FileMetadata, err: &stowage_storage::StorageError) {
    if let Some(violation) = err.policy_violation() {
        tracing::warn!(
            tenant_id = file.tenant_id,
            reason = violation.code(),
            error = %err,
            "Upload rejected by policy"
        );
    } else {
        tracing::error!(tenant_id = file.tenant_id, error = %err, "Backend write failed");
    }
}
