//! Block cipher codec for encryption at rest.
//!
//! Plaintext is cut into fixed 256 KiB blocks. Every block is sealed on its own
//! with ChaCha20-Poly1305 under a fresh random nonce and framed as
//! `nonce ‖ ciphertext ‖ tag`, so a reader can start decrypting at any block
//! boundary without touching the blocks before it.

use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use tokio::io::{AsyncRead, ReadBuf};

/// Plaintext bytes per block.
pub const BLOCK_SIZE: usize = 256 * 1024;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
/// Framing bytes added to every block.
pub const BLOCK_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
pub const ENCRYPTED_BLOCK_SIZE: usize = BLOCK_SIZE + BLOCK_OVERHEAD;

const KEY_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("failed to load encryption key: {0}")]
    KeyFile(String),

    #[error("failed to seal block")]
    Seal,

    #[error("block {block} failed authentication")]
    Authentication { block: u64 },

    #[error("block {block} is truncated")]
    Truncated { block: u64 },

    #[error("invalid encrypted size {0}: trailing block too small to be valid")]
    InvalidSize(u64),
}

impl CipherError {
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }

    pub fn from_io(err: &io::Error) -> Option<&CipherError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<CipherError>())
    }
}

/// AEAD key derived from a shared secret.
///
/// Every instance holding the same secret derives the same key, so any node can
/// decrypt objects written by any other.
#[derive(Clone)]
pub struct BlockCipher {
    aead: ChaCha20Poly1305,
}

impl fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCipher").finish_non_exhaustive()
    }
}

impl BlockCipher {
    /// Derive the key with HKDF-SHA256 (no salt, no info) from `secret`.
    pub fn from_secret(secret: &[u8]) -> Result<Self, CipherError> {
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut key = [0u8; KEY_SIZE];
        hk.expand(&[], &mut key)
            .map_err(|e| CipherError::KeyFile(format!("key derivation failed: {}", e)))?;
        Ok(Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    /// Read the shared secret file and derive the key from its contents.
    pub fn from_key_file(path: impl AsRef<Path>) -> Result<Self, CipherError> {
        let path = path.as_ref();
        let secret = std::fs::read(path)
            .map_err(|e| CipherError::KeyFile(format!("{}: {}", path.display(), e)))?;
        if secret.is_empty() {
            return Err(CipherError::KeyFile(format!(
                "{}: key file is empty",
                path.display()
            )));
        }
        Self::from_secret(&secret)
    }

    fn seal_block(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .aead
            .encrypt(&nonce, plain)
            .map_err(|_| CipherError::Seal)?;

        let mut frame = Vec::with_capacity(NONCE_SIZE + sealed.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    fn open_block(&self, frame: &[u8], block: u64) -> Result<Vec<u8>, CipherError> {
        if frame.len() < BLOCK_OVERHEAD {
            return Err(CipherError::Truncated { block });
        }
        let (nonce, sealed) = frame.split_at(NONCE_SIZE);
        self.aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Authentication { block })
    }
}

/// Translate a plaintext offset into the ciphertext offset of the block that
/// contains it plus the offset inside that block's plaintext.
pub fn map_logical_offset(offset: u64) -> (u64, u64) {
    let block = offset / BLOCK_SIZE as u64;
    (
        block * ENCRYPTED_BLOCK_SIZE as u64,
        offset % BLOCK_SIZE as u64,
    )
}

/// Plaintext size of a ciphertext of `encrypted_size` bytes.
pub fn estimate_plain_size(encrypted_size: u64) -> Result<u64, CipherError> {
    let full_blocks = encrypted_size / ENCRYPTED_BLOCK_SIZE as u64;
    let remaining = encrypted_size % ENCRYPTED_BLOCK_SIZE as u64;

    if remaining > 0 && remaining < BLOCK_OVERHEAD as u64 {
        return Err(CipherError::InvalidSize(encrypted_size));
    }

    let mut plain = full_blocks * BLOCK_SIZE as u64;
    if remaining > 0 {
        plain += remaining - BLOCK_OVERHEAD as u64;
    }
    Ok(plain)
}

/// Fill `buf[*filled..]` from `src` until it is full or `src` reports EOF.
/// Returns `true` once EOF was seen.
fn poll_fill<R: AsyncRead + Unpin>(
    src: &mut R,
    cx: &mut Context<'_>,
    buf: &mut [u8],
    filled: &mut usize,
) -> Poll<io::Result<bool>> {
    while *filled < buf.len() {
        let mut rb = ReadBuf::new(&mut buf[*filled..]);
        ready!(Pin::new(&mut *src).poll_read(cx, &mut rb))?;
        let n = rb.filled().len();
        if n == 0 {
            return Poll::Ready(Ok(true));
        }
        *filled += n;
    }
    Poll::Ready(Ok(false))
}

fn drain_into(out: &[u8], pos: &mut usize, buf: &mut ReadBuf<'_>) {
    let n = buf.remaining().min(out.len() - *pos);
    buf.put_slice(&out[*pos..*pos + n]);
    *pos += n;
}

/// Encrypts a plaintext stream one block at a time.
pub struct EncryptingReader<R> {
    src: R,
    cipher: BlockCipher,
    plain: Vec<u8>,
    filled: usize,
    out: Vec<u8>,
    out_pos: usize,
    src_done: bool,
}

impl<R> EncryptingReader<R> {
    pub fn new(src: R, cipher: BlockCipher) -> Self {
        Self {
            src,
            cipher,
            plain: vec![0u8; BLOCK_SIZE],
            filled: 0,
            out: Vec::new(),
            out_pos: 0,
            src_done: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EncryptingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.out_pos < this.out.len() {
                drain_into(&this.out, &mut this.out_pos, buf);
                return Poll::Ready(Ok(()));
            }
            if this.src_done {
                return Poll::Ready(Ok(()));
            }

            let eof = ready!(poll_fill(
                &mut this.src,
                cx,
                &mut this.plain,
                &mut this.filled
            ))?;
            this.src_done = eof;
            if this.filled == 0 {
                // Input ended on a block boundary.
                return Poll::Ready(Ok(()));
            }

            this.out = this
                .cipher
                .seal_block(&this.plain[..this.filled])
                .map_err(CipherError::into_io)?;
            this.out_pos = 0;
            this.filled = 0;
        }
    }
}

/// Decrypts a ciphertext stream that starts on a block boundary.
///
/// The first `skip` plaintext bytes of the first block are discarded, which
/// together with [`map_logical_offset`] gives random access. Any block that
/// fails authentication poisons the reader: no plaintext of that block is
/// released and every later read returns the same error.
pub struct DecryptingReader<R> {
    src: R,
    cipher: BlockCipher,
    frame: Vec<u8>,
    filled: usize,
    skip: usize,
    out: Vec<u8>,
    out_pos: usize,
    src_done: bool,
    block: u64,
    failed: Option<CipherError>,
}

impl<R> DecryptingReader<R> {
    pub fn new(src: R, cipher: BlockCipher, skip: u64) -> Self {
        Self {
            src,
            cipher,
            frame: vec![0u8; ENCRYPTED_BLOCK_SIZE],
            filled: 0,
            skip: usize::try_from(skip).unwrap_or(usize::MAX),
            out: Vec::new(),
            out_pos: 0,
            src_done: false,
            block: 0,
            failed: None,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(err) = &this.failed {
                return Poll::Ready(Err(err.clone().into_io()));
            }
            if this.out_pos < this.out.len() {
                drain_into(&this.out, &mut this.out_pos, buf);
                return Poll::Ready(Ok(()));
            }
            if this.src_done {
                return Poll::Ready(Ok(()));
            }

            let eof = ready!(poll_fill(
                &mut this.src,
                cx,
                &mut this.frame,
                &mut this.filled
            ))?;
            this.src_done = eof;
            if this.filled == 0 {
                return Poll::Ready(Ok(()));
            }

            match this
                .cipher
                .open_block(&this.frame[..this.filled], this.block)
            {
                Ok(mut plain) => {
                    if this.skip > 0 {
                        let skip = this.skip.min(plain.len());
                        plain.drain(..skip);
                        this.skip = 0;
                    }
                    this.out = plain;
                    this.out_pos = 0;
                    this.filled = 0;
                    this.block += 1;
                }
                Err(err) => {
                    tracing::warn!(block = this.block, error = %err, "Block decryption failed");
                    this.failed = Some(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn test_cipher() -> BlockCipher {
        BlockCipher::from_secret(b"stowage test shared secret").unwrap()
    }

    fn sample(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect()
    }

    /// Hands out at most `step` bytes per read.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let n = self.step.min(buf.remaining()).min(self.data.len() - self.pos);
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    async fn encrypt(plain: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        EncryptingReader::new(plain, test_cipher())
            .read_to_end(&mut out)
            .await
            .unwrap();
        out
    }

    async fn decrypt_from(cipher_text: &[u8], offset: u64) -> io::Result<Vec<u8>> {
        let (cipher_offset, skip) = map_logical_offset(offset);
        let start = (cipher_offset as usize).min(cipher_text.len());
        let mut out = Vec::new();
        DecryptingReader::new(&cipher_text[start..], test_cipher(), skip)
            .read_to_end(&mut out)
            .await?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_round_trip_multi_block() {
        let plain = sample(2 * BLOCK_SIZE + 1000);
        let sealed = encrypt(&plain).await;
        assert_eq!(sealed.len(), plain.len() + 3 * BLOCK_OVERHEAD);
        assert_eq!(decrypt_from(&sealed, 0).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn test_empty_input_encrypts_to_nothing() {
        let sealed = encrypt(&[]).await;
        assert!(sealed.is_empty());
        assert_eq!(estimate_plain_size(0).unwrap(), 0);
        assert!(decrypt_from(&sealed, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exact_block_multiple_has_no_trailing_block() {
        let plain = sample(BLOCK_SIZE);
        let sealed = encrypt(&plain).await;
        assert_eq!(sealed.len(), ENCRYPTED_BLOCK_SIZE);
        assert_eq!(decrypt_from(&sealed, 0).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn test_short_reads_from_source() {
        let plain = sample(BLOCK_SIZE + 4097);
        let mut sealed = Vec::new();
        let src = Trickle {
            data: plain.clone(),
            pos: 0,
            step: 7919,
        };
        EncryptingReader::new(src, test_cipher())
            .read_to_end(&mut sealed)
            .await
            .unwrap();
        assert_eq!(sealed.len(), plain.len() + 2 * BLOCK_OVERHEAD);

        let src = Trickle {
            data: sealed,
            pos: 0,
            step: 1013,
        };
        let mut out = Vec::new();
        DecryptingReader::new(src, test_cipher(), 0)
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, plain);
    }

    #[tokio::test]
    async fn test_random_access_matches_suffix() {
        let plain = sample(3 * BLOCK_SIZE + 123);
        let sealed = encrypt(&plain).await;
        for offset in [
            0,
            1,
            BLOCK_SIZE - 1,
            BLOCK_SIZE,
            BLOCK_SIZE + 17,
            2 * BLOCK_SIZE + 5,
            3 * BLOCK_SIZE,
            3 * BLOCK_SIZE + 122,
        ] {
            let got = decrypt_from(&sealed, offset as u64).await.unwrap();
            assert_eq!(got, &plain[offset..], "offset {}", offset);
        }
    }

    #[tokio::test]
    async fn test_offset_past_end_is_empty() {
        let plain = sample(1000);
        let sealed = encrypt(&plain).await;
        assert!(decrypt_from(&sealed, 5000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flipped_byte_fails_authentication() {
        let plain = sample(BLOCK_SIZE + 500);
        let sealed = encrypt(&plain).await;
        for pos in [0, NONCE_SIZE + 3, ENCRYPTED_BLOCK_SIZE - 1, sealed.len() - 1] {
            let mut tampered = sealed.clone();
            tampered[pos] ^= 0x01;
            let err = decrypt_from(&tampered, 0).await.unwrap_err();
            assert!(
                matches!(
                    CipherError::from_io(&err),
                    Some(CipherError::Authentication { .. })
                ),
                "byte {} not detected",
                pos
            );
        }
    }

    #[tokio::test]
    async fn test_failed_block_releases_no_plaintext() {
        let plain = sample(BLOCK_SIZE + 10);
        let mut sealed = encrypt(&plain).await;
        sealed[NONCE_SIZE] ^= 0xff;
        let mut reader = DecryptingReader::new(&sealed[..], test_cipher(), 0);
        let mut buf = vec![0u8; 64];
        assert!(reader.read(&mut buf).await.is_err());
        // Poisoned for good.
        assert!(reader.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_trailing_frame() {
        let plain = sample(100);
        let sealed = encrypt(&plain).await;
        let err = decrypt_from(&sealed[..NONCE_SIZE + 4], 0).await.unwrap_err();
        assert_eq!(
            CipherError::from_io(&err),
            Some(&CipherError::Truncated { block: 0 })
        );
    }

    #[tokio::test]
    async fn test_other_key_cannot_decrypt() {
        let sealed = encrypt(&sample(64)).await;
        let other = BlockCipher::from_secret(b"another secret").unwrap();
        let mut out = Vec::new();
        let err = DecryptingReader::new(&sealed[..], other, 0)
            .read_to_end(&mut out)
            .await
            .unwrap_err();
        assert!(CipherError::from_io(&err).is_some());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_estimate_plain_size_inverts_encryption() {
        for len in [0, 1, 100, BLOCK_SIZE - 1, BLOCK_SIZE, BLOCK_SIZE + 1, 2 * BLOCK_SIZE + 77] {
            let sealed = encrypt(&sample(len)).await;
            assert_eq!(estimate_plain_size(sealed.len() as u64).unwrap(), len as u64);
        }
    }

    #[test]
    fn test_estimate_rejects_impossible_remainder() {
        let bad = ENCRYPTED_BLOCK_SIZE as u64 + 5;
        assert_eq!(estimate_plain_size(bad), Err(CipherError::InvalidSize(bad)));
        assert_eq!(estimate_plain_size(BLOCK_OVERHEAD as u64).unwrap(), 0);
    }

    #[test]
    fn test_map_logical_offset() {
        assert_eq!(map_logical_offset(0), (0, 0));
        assert_eq!(map_logical_offset(10), (0, 10));
        assert_eq!(
            map_logical_offset(BLOCK_SIZE as u64),
            (ENCRYPTED_BLOCK_SIZE as u64, 0)
        );
        assert_eq!(
            map_logical_offset(2 * BLOCK_SIZE as u64 + 9),
            (2 * ENCRYPTED_BLOCK_SIZE as u64, 9)
        );
    }

    #[test]
    fn test_key_file_derivation_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        std::fs::write(&path, b"stowage test shared secret").unwrap();
        let from_file = BlockCipher::from_key_file(&path).unwrap();

        let sealed = from_file.seal_block(b"hello").unwrap();
        assert_eq!(test_cipher().open_block(&sealed, 0).unwrap(), b"hello");
    }

    #[test]
    fn test_missing_or_empty_key_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            BlockCipher::from_key_file(dir.path().join("missing")),
            Err(CipherError::KeyFile(_))
        ));
        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            BlockCipher::from_key_file(&empty),
            Err(CipherError::KeyFile(_))
        ));
    }

    #[test]
    fn test_nonces_are_fresh_per_block() {
        let cipher = test_cipher();
        let a = cipher.seal_block(b"same").unwrap();
        let b = cipher.seal_block(b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }
}
