//! A configured storage backend: one driver plus the codec and accounting
//! applied around it.

use std::sync::atomic::{AtomicU64, Ordering};

use stowage_core::encryption::{estimate_plain_size, map_logical_offset};
use stowage_core::{BlockCipher, DecryptingReader, DriverKind, EncryptingReader, FileMetadata};

use crate::error::{ByteReader, StorageError, StorageResult};
#[cfg(feature = "storage-local")]
use crate::local::LocalDriver;
#[cfg(feature = "storage-s3")]
use crate::s3::S3Driver;

/// Closed set of storage drivers.
#[derive(Debug)]
pub enum Driver {
    #[cfg(feature = "storage-local")]
    Local(LocalDriver),
    #[cfg(feature = "storage-s3")]
    S3(S3Driver),
}

impl Driver {
    pub fn kind(&self) -> DriverKind {
        match self {
            #[cfg(feature = "storage-local")]
            Driver::Local(_) => DriverKind::Local,
            #[cfg(feature = "storage-s3")]
            Driver::S3(_) => DriverKind::S3,
        }
    }

    async fn test_connection(&self) -> StorageResult<()> {
        match self {
            #[cfg(feature = "storage-local")]
            Driver::Local(d) => d.test_connection().await,
            #[cfg(feature = "storage-s3")]
            Driver::S3(d) => d.test_connection().await,
        }
    }

    async fn write(&self, src: ByteReader, file: &mut FileMetadata) -> StorageResult<u64> {
        match self {
            #[cfg(feature = "storage-local")]
            Driver::Local(d) => d.write(src, file).await,
            #[cfg(feature = "storage-s3")]
            Driver::S3(d) => d.write(src, file).await,
        }
    }

    async fn reader(&self, file: &FileMetadata, offset: u64) -> StorageResult<ByteReader> {
        match self {
            #[cfg(feature = "storage-local")]
            Driver::Local(d) => d.reader(file, offset).await,
            #[cfg(feature = "storage-s3")]
            Driver::S3(d) => d.reader(file, offset).await,
        }
    }

    async fn remove(&self, file: &FileMetadata) -> StorageResult<()> {
        match self {
            #[cfg(feature = "storage-local")]
            Driver::Local(d) => d.remove(file).await,
            #[cfg(feature = "storage-s3")]
            Driver::S3(d) => d.remove(file).await,
        }
    }
}

#[derive(Debug)]
pub struct Backend {
    name: String,
    sync_time: i64,
    expire_day: i32,
    written: AtomicU64,
    cipher: Option<BlockCipher>,
    driver: Driver,
}

impl Backend {
    pub fn new(name: impl Into<String>, driver: Driver) -> Self {
        Self {
            name: name.into(),
            sync_time: 0,
            expire_day: 0,
            written: AtomicU64::new(0),
            cipher: None,
            driver,
        }
    }

    /// Stamp the profile version this instance was built from.
    pub fn with_sync_time(mut self, sync_time: i64) -> Self {
        self.sync_time = sync_time;
        self
    }

    pub fn with_expire_day(mut self, expire_day: i32) -> Self {
        self.expire_day = expire_day;
        self
    }

    pub fn with_cipher(mut self, cipher: Option<BlockCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sync_time(&self) -> i64 {
        self.sync_time
    }

    pub fn expire_day(&self) -> i32 {
        self.expire_day
    }

    pub fn kind(&self) -> DriverKind {
        self.driver.kind()
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Stored bytes written through this instance since the last reset.
    pub fn written_size(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Reset the written-bytes counter and return its previous value.
    pub fn reset_written_size(&self) -> u64 {
        self.written.swap(0, Ordering::Relaxed)
    }

    pub async fn test_connection(&self) -> StorageResult<()> {
        self.driver.test_connection().await
    }

    fn require_cipher(&self) -> StorageResult<&BlockCipher> {
        self.cipher.as_ref().ok_or_else(|| {
            StorageError::ConfigError(format!(
                "backend {} has no encryption key configured",
                self.name
            ))
        })
    }

    /// Write `src` for `file` and return the plaintext byte count.
    ///
    /// Encrypted files are sealed on the way in. The driver records where the
    /// bytes went on `file.properties`.
    pub async fn write(&self, src: ByteReader, file: &mut FileMetadata) -> StorageResult<u64> {
        let start = std::time::Instant::now();
        let src: ByteReader = if file.encrypted {
            Box::pin(EncryptingReader::new(src, self.require_cipher()?.clone()))
        } else {
            src
        };

        let stored = self.driver.write(src, file).await?;
        self.written.fetch_add(stored, Ordering::Relaxed);

        let size = if file.encrypted {
            estimate_plain_size(stored)?
        } else {
            stored
        };

        tracing::debug!(
            backend = %self.name,
            tenant_id = file.tenant_id,
            name = %file.name,
            encrypted = file.encrypted,
            size_bytes = size,
            stored_bytes = stored,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Backend write complete"
        );
        Ok(size)
    }

    /// Open `file` for reading from the plaintext `offset`.
    pub async fn reader(&self, file: &FileMetadata, offset: u64) -> StorageResult<ByteReader> {
        if !file.encrypted {
            return self.driver.reader(file, offset).await;
        }

        let cipher = self.require_cipher()?.clone();
        let (cipher_offset, skip) = map_logical_offset(offset);
        let raw = self.driver.reader(file, cipher_offset).await?;
        Ok(Box::pin(DecryptingReader::new(raw, cipher, skip)))
    }

    pub async fn remove(&self, file: &FileMetadata) -> StorageResult<()> {
        self.driver.remove(file).await
    }
}

#[cfg(all(test, feature = "storage-local"))]
mod tests {
    use super::*;
    use std::io::Cursor;
    use stowage_core::channel;
    use stowage_core::encryption::{BLOCK_SIZE, ENCRYPTED_BLOCK_SIZE};
    use stowage_core::models::property;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    fn local(root: &std::path::Path) -> Backend {
        Backend::new("local", Driver::Local(LocalDriver::new(root, "$DOMAIN")))
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn read_all(mut reader: ByteReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_plain_write_counts_written_size() {
        let dir = tempdir().unwrap();
        let backend = local(dir.path());
        let mut file = FileMetadata::new(3, "r1", "a.txt", "text/plain");

        let n = backend
            .write(Box::pin(Cursor::new(b"0123456789".to_vec())), &mut file)
            .await
            .unwrap();
        assert_eq!(n, 10);
        assert_eq!(backend.written_size(), 10);
        assert_eq!(backend.reset_written_size(), 10);
        assert_eq!(backend.written_size(), 0);

        let tail = read_all(backend.reader(&file, 4).await.unwrap()).await;
        assert_eq!(tail, b"456789");
    }

    #[tokio::test]
    async fn test_encrypted_round_trip_with_offset() {
        let dir = tempdir().unwrap();
        let cipher = BlockCipher::from_secret(b"backend secret").unwrap();
        let backend = local(dir.path()).with_cipher(Some(cipher));
        let data = payload(BLOCK_SIZE * 2 + 1000);

        let mut file =
            FileMetadata::new(3, "r2", "call.wav", "audio/wav").with_channel(channel::CALL);
        file.encrypted = true;

        let n = backend
            .write(Box::pin(Cursor::new(data.clone())), &mut file)
            .await
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(
            backend.written_size(),
            (2 * ENCRYPTED_BLOCK_SIZE + 1000 + 28) as u64
        );

        let on_disk = std::fs::read(
            dir.path()
                .join(file.property(property::DIRECTORY).unwrap())
                .join(file.store_name()),
        )
        .unwrap();
        assert_ne!(&on_disk[..64], &data[..64]);

        let offset = BLOCK_SIZE + 17;
        let tail = read_all(backend.reader(&file, offset as u64).await.unwrap()).await;
        assert_eq!(tail, &data[offset..]);
    }

    #[tokio::test]
    async fn test_encrypted_write_without_key_fails() {
        let dir = tempdir().unwrap();
        let backend = local(dir.path());
        let mut file = FileMetadata::new(3, "r3", "a.txt", "text/plain");
        file.encrypted = true;

        let err = backend
            .write(Box::pin(Cursor::new(b"secret".to_vec())), &mut file)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConfigError(_)));
        assert_eq!(backend.written_size(), 0);
    }

    #[tokio::test]
    async fn test_accessors() {
        let dir = tempdir().unwrap();
        let backend = local(dir.path()).with_sync_time(77).with_expire_day(30);
        assert_eq!(backend.name(), "local");
        assert_eq!(backend.sync_time(), 77);
        assert_eq!(backend.expire_day(), 30);
        assert_eq!(backend.kind(), DriverKind::Local);
        backend.test_connection().await.unwrap();
    }
}
