//! Stream copy that tells source failures from destination failures.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{StorageError, StorageResult};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Copy `src` into `dst` and return the number of bytes written.
///
/// Read errors come back as [`StorageError::Source`] so policy and codec
/// failures raised by stream adapters keep their identity; write errors are
/// plain I/O errors of the destination.
pub(crate) async fn copy_counted<R, W>(src: &mut R, dst: &mut W) -> StorageResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = src
            .read(&mut buf)
            .await
            .map_err(StorageError::source_failed)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    dst.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    struct Failing;

    impl AsyncRead for Failing {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }
    }

    #[tokio::test]
    async fn test_copy_counts_bytes() {
        let data = vec![7u8; COPY_BUFFER_SIZE * 2 + 3];
        let mut out = Vec::new();
        let n = copy_counted(&mut &data[..], &mut out).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_read_error_is_source_error() {
        let mut out = Vec::new();
        let err = copy_counted(&mut Failing, &mut out).await.unwrap_err();
        assert!(matches!(err, StorageError::Source(_)));
    }
}
