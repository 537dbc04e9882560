//! SHA-256 of a stream, computed while it is read.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

pub struct HashingReader<R> {
    inner: R,
    hasher: Arc<Mutex<Sha256>>,
}

/// Handle on the running hash of a [`HashingReader`], usable after the
/// reader has been moved into a backend write.
#[derive(Clone)]
pub struct Digest(Arc<Mutex<Sha256>>);

impl Digest {
    /// Hex digest of every byte read so far.
    pub fn hex(&self) -> String {
        let hasher = self.0.lock().unwrap_or_else(PoisonError::into_inner).clone();
        hex::encode(hasher.finalize())
    }
}

/// Wrap `inner` so that everything read through it is hashed.
pub fn hashing<R>(inner: R) -> (HashingReader<R>, Digest) {
    let hasher = Arc::new(Mutex::new(Sha256::new()));
    let reader = HashingReader {
        inner,
        hasher: Arc::clone(&hasher),
    };
    (reader, Digest(hasher))
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let chunk = &buf.filled()[before..];
                if !chunk.is_empty() {
                    this.hasher
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .update(chunk);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
