//! Building blocks of the `stowage` operator CLI.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use stowage_core::encryption::map_logical_offset;
use stowage_core::{BlockCipher, Config, DecryptingReader, EncryptingReader, FileMetadata};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Load the block cipher from `key_file`, or from the configured
/// `STOWAGE_ENCRYPTION_KEY_FILE` when no file is given.
pub fn load_cipher(key_file: Option<&Path>) -> anyhow::Result<BlockCipher> {
    let path = match key_file {
        Some(path) => path.to_path_buf(),
        None => Config::from_env()?
            .storage
            .encryption_key_file
            .context("No key file given and STOWAGE_ENCRYPTION_KEY_FILE is not set")?,
    };
    BlockCipher::from_key_file(&path)
        .with_context(|| format!("Failed to load key from {}", path.display()))
}

/// Seal `src` into `dst`. Returns the number of bytes written.
pub async fn encrypt<R, W>(src: R, dst: &mut W, cipher: BlockCipher) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sealed = EncryptingReader::new(src, cipher);
    let written = tokio::io::copy(&mut sealed, dst)
        .await
        .context("Encryption failed")?;
    dst.flush().await?;
    Ok(written)
}

/// Open sealed `src` (read from its first byte) into `dst`, starting at the
/// plaintext `offset`. Returns the number of plaintext bytes written.
pub async fn decrypt<R, W>(
    mut src: R,
    dst: &mut W,
    cipher: BlockCipher,
    offset: u64,
) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (cipher_offset, skip) = map_logical_offset(offset);
    tokio::io::copy(&mut (&mut src).take(cipher_offset), &mut tokio::io::sink())
        .await
        .context("Failed to skip to the requested block")?;

    let mut opened = DecryptingReader::new(src, cipher, skip);
    let written = tokio::io::copy(&mut opened, dst)
        .await
        .context("Decryption failed")?;
    dst.flush().await?;
    Ok(written)
}

/// Render a storage path template for a sample file.
pub fn preview_path(
    pattern: &str,
    tenant_id: i64,
    channel: Option<&str>,
    mime_type: &str,
    now: DateTime<Utc>,
) -> String {
    let mut file = FileMetadata::new(tenant_id, "preview", "preview", mime_type);
    file.channel = channel.map(str::to_string);
    stowage_storage::keys::render_pattern(pattern, &file, now)
}
