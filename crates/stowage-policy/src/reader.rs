//! Stream adapter enforcing a policy's size limit, content check and rate.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use stowage_core::PolicyViolation;
use stowage_infra::TokenBucket;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{sleep, Sleep};

pub struct PolicyReader<R> {
    inner: R,
    consumed: u64,
    max_size: Option<u64>,
    /// Declared MIME awaiting validation against the first non-empty read.
    pending_check: Option<String>,
    bucket: Option<TokenBucket>,
    delay: Option<Pin<Box<Sleep>>>,
    scratch: Vec<u8>,
    failed: Option<PolicyViolation>,
}

impl<R> PolicyReader<R> {
    /// A pass-through reader. Limits are added with the `with_*` methods.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            consumed: 0,
            max_size: None,
            pending_check: None,
            bucket: None,
            delay: None,
            scratch: Vec::new(),
            failed: None,
        }
    }

    /// Fail once more than `max` bytes have been read.
    pub fn with_max_size(mut self, max: u64) -> Self {
        self.max_size = Some(max);
        self
    }

    /// Sniff the first bytes and compare them to `declared`.
    pub fn with_content_check(mut self, declared: impl Into<String>) -> Self {
        self.pending_check = Some(declared.into());
        self
    }

    /// Deliver at most `bytes_per_sec` on average.
    pub fn with_rate(mut self, bytes_per_sec: u64) -> Self {
        self.bucket = Some(TokenBucket::new(bytes_per_sec));
        self
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    fn fail(&mut self, violation: PolicyViolation) -> Poll<io::Result<()>> {
        self.failed = Some(violation.clone());
        Poll::Ready(Err(violation.into_io()))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PolicyReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if let Some(violation) = &this.failed {
            return Poll::Ready(Err(violation.clone().into_io()));
        }

        if let Some(delay) = this.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.delay = None;
        }

        let before = buf.filled().len();
        let cap = this.bucket.as_ref().map(TokenBucket::burst);

        match cap {
            Some(cap) if cap < buf.remaining() => {
                if this.scratch.len() < cap {
                    this.scratch.resize(cap, 0);
                }
                let mut limited = ReadBuf::new(&mut this.scratch[..cap]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
                buf.put_slice(limited.filled());
            }
            _ => ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?,
        }

        let chunk = &buf.filled()[before..];
        let n = chunk.len() as u64;
        if n == 0 {
            return Poll::Ready(Ok(()));
        }

        this.consumed += n;
        if let Some(max) = this.max_size {
            if this.consumed > max {
                return this.fail(PolicyViolation::MaxSizeExceeded { max });
            }
        }

        if let Some(declared) = this.pending_check.take() {
            if let Err(violation) = crate::sniff::check_content_type(&declared, chunk) {
                return this.fail(violation);
            }
        }

        if let Some(bucket) = this.bucket.as_mut() {
            let wait = bucket.take(n);
            if !wait.is_zero() {
                this.delay = Some(Box::pin(sleep(wait)));
            }
        }

        Poll::Ready(Ok(()))
    }
}
