//! Resumable ("safe") uploads.
//!
//! A session bridges client writes to a background direct upload through a
//! bounded pipe. Between client requests the session is parked (`Sleep`) in a
//! capacity-bounded registry under an opaque id; a later request resumes it
//! and keeps writing into the same pipe.
//!
//! Evicting an unfinished session aborts its pipe, so the background write
//! fails and nothing is persisted. The background task only holds a weak
//! reference: once every handle is gone the pipe closes the same way.

use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use stowage_core::config::SafeUploadSettings;
use stowage_core::{AppError, FileMetadata};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, watch};

use crate::service::UploadService;

const ACTIVE: u8 = 0;
const SLEEP: u8 = 1;
const FINISHED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A client is attached and bytes are flowing.
    Active,
    /// Parked between client requests.
    Sleep,
    Finished,
}

impl SessionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            ACTIVE => SessionState::Active,
            SLEEP => SessionState::Sleep,
            _ => SessionState::Finished,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Active => write!(f, "active"),
            SessionState::Sleep => write!(f, "sleep"),
            SessionState::Finished => write!(f, "finished"),
        }
    }
}

/// Final result of a session's background write.
#[derive(Debug, Clone)]
pub enum SafeUploadOutcome {
    Stored(FileMetadata),
    Failed(Arc<AppError>),
}

/// Read end of a session's pipe. Ends cleanly only after
/// [`SafeUpload::close_write`]; a write end dropped any other way surfaces as
/// a broken pipe.
struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    chunk: Bytes,
    completed: Arc<AtomicBool>,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.chunk.is_empty() {
                let n = self.chunk.len().min(buf.remaining());
                let head = self.chunk.split_to(n);
                buf.put_slice(&head);
                return Poll::Ready(Ok(()));
            }

            match ready!(self.rx.poll_recv(cx)) {
                Some(chunk) => self.chunk = chunk,
                None if self.completed.load(Ordering::Acquire) => return Poll::Ready(Ok(())),
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "safe upload aborted",
                    )))
                }
            }
        }
    }
}

pub struct SafeUpload {
    id: String,
    tenant_id: i64,
    state: AtomicU8,
    written: AtomicU64,
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
    completed: Arc<AtomicBool>,
    outcome: watch::Receiver<Option<SafeUploadOutcome>>,
    /// Bumped on every park and resume; a sleep timer only fires for the
    /// period it was armed in.
    generation: AtomicU64,
}

impl SafeUpload {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Bytes accepted from clients so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn close_sender(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Push a chunk into the pipe, waiting while the background write is
    /// behind. Only valid while the session is active.
    pub async fn write(&self, chunk: Bytes) -> Result<(), AppError> {
        let state = self.state();
        if state != SessionState::Active {
            return Err(AppError::InvalidSessionState(format!(
                "safe upload {} is {}",
                self.id, state
            )));
        }
        if chunk.is_empty() {
            return Ok(());
        }

        let len = chunk.len() as u64;
        let Some(sender) = self.sender() else {
            return Err(self.closed_error().await);
        };
        if sender.send(chunk).await.is_err() {
            return Err(self.closed_error().await);
        }
        self.written.fetch_add(len, Ordering::AcqRel);
        Ok(())
    }

    /// End of input: the background write completes once the pipe drains.
    pub fn close_write(&self) {
        self.completed.store(true, Ordering::Release);
        self.close_sender();
    }

    /// Abort the session from any state. The background write fails and
    /// nothing is persisted.
    pub fn abort(&self, reason: &str) {
        let previous = SessionState::from_raw(self.state.swap(FINISHED, Ordering::AcqRel));
        if self.close_sender() {
            tracing::warn!(
                session_id = %self.id,
                tenant_id = self.tenant_id,
                state = %previous,
                reason,
                "Safe upload aborted"
            );
        }
    }

    /// Abort only if still parked.
    fn expire(&self, reason: &str) -> bool {
        if !self.transition(SLEEP, FINISHED) {
            return false;
        }
        self.close_sender();
        tracing::warn!(
            session_id = %self.id,
            tenant_id = self.tenant_id,
            written_bytes = self.written(),
            reason,
            "Parked safe upload dropped"
        );
        true
    }

    /// Watch the outcome without keeping the session alive.
    pub fn subscribe(&self) -> watch::Receiver<Option<SafeUploadOutcome>> {
        self.outcome.clone()
    }

    /// Wait for the background write to finish.
    pub async fn wait(&self) -> SafeUploadOutcome {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            SafeUploadOutcome::Failed(Arc::new(AppError::Internal(
                "safe upload ended without an outcome".to_string(),
            )))
        })
    }

    /// Error for a write into a pipe whose reader is gone.
    async fn closed_error(&self) -> AppError {
        match self.wait().await {
            SafeUploadOutcome::Failed(err) => match err.as_ref() {
                AppError::Forbidden(violation) => AppError::Forbidden(violation.clone()),
                AppError::Malware(signature) => AppError::Malware(signature.clone()),
                other => AppError::InvalidSessionState(format!(
                    "safe upload {} failed: {}",
                    self.id, other
                )),
            },
            SafeUploadOutcome::Stored(_) => AppError::InvalidSessionState(format!(
                "safe upload {} is already stored",
                self.id
            )),
        }
    }
}

type Sessions = Arc<Mutex<LruCache<String, Arc<SafeUpload>>>>;

/// Capacity-bounded registry of safe upload sessions.
pub struct SafeUploadRegistry {
    service: Arc<UploadService>,
    sessions: Sessions,
    pipe_chunks: usize,
    max_sleep: Option<Duration>,
}

impl SafeUploadRegistry {
    pub fn new(service: Arc<UploadService>, settings: &SafeUploadSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            service,
            sessions: Arc::new(Mutex::new(LruCache::new(capacity))),
            pipe_chunks: settings.pipe_chunks.max(1),
            max_sleep: settings.max_sleep,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look a session up without touching its recency.
    pub fn get(&self, id: &str) -> Option<Arc<SafeUpload>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peek(id)
            .cloned()
    }

    /// Open a session and start its background write. The session starts
    /// active.
    pub fn start(&self, file: FileMetadata, profile_id: Option<i32>) -> Arc<SafeUpload> {
        let (tx, rx) = mpsc::channel(self.pipe_chunks);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let completed = Arc::new(AtomicBool::new(false));

        let session = Arc::new(SafeUpload {
            id: uuid::Uuid::new_v4().simple().to_string(),
            tenant_id: file.tenant_id,
            state: AtomicU8::new(ACTIVE),
            written: AtomicU64::new(0),
            sender: Mutex::new(Some(tx)),
            completed: Arc::clone(&completed),
            outcome: outcome_rx,
            generation: AtomicU64::new(0),
        });
        let reader = PipeReader {
            rx,
            chunk: Bytes::new(),
            completed,
        };

        tracing::debug!(
            session_id = %session.id,
            tenant_id = file.tenant_id,
            name = %file.name,
            "Safe upload started"
        );

        self.remember(&session);

        let service = Arc::clone(&self.service);
        let sessions = Arc::clone(&self.sessions);
        let session_id = session.id.clone();
        let task_session = Arc::downgrade(&session);
        tokio::spawn(async move {
            let result = service
                .upload_direct(file, profile_id, Box::pin(reader))
                .await;

            let written = task_session.upgrade().map(|session| {
                session.state.store(FINISHED, Ordering::Release);
                session.close_sender();
                session.written()
            });
            sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop(&session_id);

            let outcome = match result {
                Ok(stored) => SafeUploadOutcome::Stored(stored),
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        written_bytes = ?written,
                        error = %e,
                        "Safe upload failed"
                    );
                    SafeUploadOutcome::Failed(Arc::new(e))
                }
            };
            outcome_tx.send_replace(Some(outcome));
        });

        session
    }

    /// Park an active session until a client resumes it.
    pub fn sleep(&self, session: &Arc<SafeUpload>) -> Result<(), AppError> {
        if !session.transition(ACTIVE, SLEEP) {
            return Err(AppError::InvalidSessionState(format!(
                "safe upload {} is {}",
                session.id,
                session.state()
            )));
        }
        let generation = session.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.remember(session);

        if let Some(max_sleep) = self.max_sleep {
            let parked = Arc::downgrade(session);
            let sessions = Arc::clone(&self.sessions);
            tokio::spawn(async move {
                tokio::time::sleep(max_sleep).await;
                let Some(session) = parked.upgrade() else {
                    return;
                };
                if session.generation.load(Ordering::Acquire) == generation
                    && session.expire("parked too long")
                {
                    sessions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop(&session.id);
                }
            });
        }

        tracing::debug!(
            session_id = %session.id,
            written_bytes = session.written(),
            "Safe upload parked"
        );
        Ok(())
    }

    /// Reattach to a parked session. Unknown ids and sessions that are not
    /// parked are not resumable.
    pub fn resume(&self, id: &str) -> Result<Arc<SafeUpload>, AppError> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| {
                AppError::InvalidSessionState(format!("safe upload {} is not resumable", id))
            })?;

        if !session.transition(SLEEP, ACTIVE) {
            return Err(AppError::InvalidSessionState(format!(
                "safe upload {} is {}",
                id,
                session.state()
            )));
        }
        session.generation.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(
            session_id = %id,
            written_bytes = session.written(),
            "Safe upload resumed"
        );
        Ok(session)
    }

    fn remember(&self, session: &Arc<SafeUpload>) {
        let evicted = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session.id.clone(), Arc::clone(session));

        if let Some((id, evicted)) = evicted {
            if id != session.id {
                evicted.abort("evicted from registry");
            }
        }
    }
}
