//! Relay queue: worker pool, polling with explicit wake-ups, errored-job sweep.
//!
//! Shutdown: [`RelayQueue::shutdown`] signals the pool to stop; it does not wait
//! for in-flight relays.

use std::sync::Arc;
use std::time::Duration;

use stowage_core::config::RelaySettings;
use stowage_core::{MetadataStore, PendingUploadJob};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::context::RelayHandler;

#[derive(Clone, Debug)]
pub struct RelayQueueConfig {
    pub node_id: String,
    pub workers: usize,
    pub page_size: usize,
    pub poll_interval: Duration,
    /// Active or errored jobs untouched this long may be claimed again.
    pub retry_after: Duration,
    /// Errored jobs untouched this long are dropped together with their cached bytes.
    pub errored_ttl: Duration,
    /// Zero disables the sweeper.
    pub sweep_interval: Duration,
}

impl RelayQueueConfig {
    pub fn from_settings(node_id: impl Into<String>, relay: &RelaySettings) -> Self {
        Self {
            node_id: node_id.into(),
            workers: relay.workers,
            page_size: relay.page_size,
            poll_interval: relay.poll_interval,
            retry_after: relay.retry_after,
            errored_ttl: relay.errored_ttl,
            sweep_interval: relay.sweep_interval,
        }
    }
}

impl Default for RelayQueueConfig {
    fn default() -> Self {
        Self {
            node_id: "stowage".to_string(),
            workers: 10,
            page_size: 100,
            poll_interval: Duration::from_secs(2),
            retry_after: Duration::from_secs(60),
            errored_ttl: Duration::from_secs(7 * 24 * 3600),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Wakes the relay loop before its next poll, e.g. right after a job was queued.
#[derive(Clone, Debug, Default)]
pub struct RelayWaker(Arc<Notify>);

impl RelayWaker {
    pub fn wake(&self) {
        self.0.notify_one();
    }
}

struct Shared {
    store: Arc<dyn MetadataStore>,
    handler: Arc<dyn RelayHandler>,
    config: RelayQueueConfig,
    semaphore: Arc<Semaphore>,
}

pub struct RelayQueue {
    shared: Arc<Shared>,
    waker: RelayWaker,
    shutdown_tx: mpsc::Sender<()>,
}

impl RelayQueue {
    /// Create the queue and spawn its worker loop and errored-job sweeper.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        handler: Arc<dyn RelayHandler>,
        config: RelayQueueConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let queue = Self::build(store, handler, config, shutdown_tx);

        let shared = Arc::clone(&queue.shared);
        let waker = queue.waker.clone();
        tokio::spawn(async move {
            Self::worker_loop(shared, waker, shutdown_rx).await;
        });

        queue
    }

    /// Create a queue that does not spawn a worker. Jobs are only relayed by
    /// explicit calls to [`RelayQueue::drain_once`].
    pub fn new_no_worker(
        store: Arc<dyn MetadataStore>,
        handler: Arc<dyn RelayHandler>,
        config: RelayQueueConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        drop(shutdown_rx);
        Self::build(store, handler, config, shutdown_tx)
    }

    fn build(
        store: Arc<dyn MetadataStore>,
        handler: Arc<dyn RelayHandler>,
        config: RelayQueueConfig,
        shutdown_tx: mpsc::Sender<()>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            shared: Arc::new(Shared {
                store,
                handler,
                config,
                semaphore,
            }),
            waker: RelayWaker::default(),
            shutdown_tx,
        }
    }

    pub fn waker(&self) -> RelayWaker {
        self.waker.clone()
    }

    /// Claim and relay pages until a page comes back short. Returns the number
    /// of jobs handled.
    pub async fn drain_once(&self) -> usize {
        Self::drain(&self.shared).await
    }

    /// Drop errored jobs past their lifetime. Returns how many were dropped.
    pub async fn sweep_errored(&self) -> usize {
        Self::sweep(&self.shared).await
    }

    /// Signals the worker loop to stop claiming jobs. Returns immediately.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating relay queue shutdown");
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn worker_loop(
        shared: Arc<Shared>,
        waker: RelayWaker,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let config = &shared.config;
        tracing::info!(
            node_id = %config.node_id,
            workers = config.workers,
            page_size = config.page_size,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "Relay worker pool started"
        );

        let (sweeper_shutdown_tx, mut sweeper_shutdown_rx) = mpsc::channel::<()>(1);
        if !config.sweep_interval.is_zero() {
            let sweeper = Arc::clone(&shared);
            let period = config.sweep_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            Self::sweep(&sweeper).await;
                        }
                        _ = sweeper_shutdown_rx.recv() => break,
                    }
                }
            });
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Relay worker pool shutting down");
                    let _ = sweeper_shutdown_tx.send(()).await;
                    break;
                }
                _ = waker.0.notified() => {
                    Self::drain(&shared).await;
                }
                _ = sleep(config.poll_interval) => {
                    Self::drain(&shared).await;
                }
            }
        }

        tracing::info!("Relay worker pool stopped");
    }

    async fn drain(shared: &Arc<Shared>) -> usize {
        let config = &shared.config;
        let mut handled = 0;

        loop {
            let jobs = match shared
                .store
                .claim_pending_jobs(config.page_size, &config.node_id, config.retry_after)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim pending upload jobs");
                    return handled;
                }
            };

            let claimed = jobs.len();
            if claimed == 0 {
                tracing::trace!("No pending upload jobs");
                return handled;
            }

            let mut running = JoinSet::new();
            for job in jobs {
                let Ok(permit) = Arc::clone(&shared.semaphore).acquire_owned().await else {
                    return handled;
                };
                let shared = Arc::clone(shared);
                running.spawn(async move {
                    let _permit = permit;
                    Self::process(&shared, job).await;
                });
            }
            while let Some(joined) = running.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Relay task panicked");
                }
            }

            handled += claimed;
            if claimed < config.page_size {
                return handled;
            }
        }
    }

    #[tracing::instrument(skip(shared, job), fields(job.id = job.id, tenant_id = job.file.tenant_id))]
    async fn process(shared: &Shared, job: PendingUploadJob) {
        let start = std::time::Instant::now();
        match shared.handler.relay(&job).await {
            Ok(()) => {
                tracing::info!(
                    attempts = job.attempts,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Pending upload relayed"
                );
            }
            Err(e) if !e.is_recoverable() => {
                tracing::warn!(error = %e, "Pending upload rejected, dropping job");
                if let Err(e) = shared.store.delete_pending_job(job.id).await {
                    tracing::error!(error = %e, "Failed to delete rejected job");
                    return;
                }
                shared.handler.discard(&job).await;
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    attempts = job.attempts,
                    "Pending upload relay failed, will retry"
                );
                if let Err(e) = shared
                    .store
                    .mark_pending_job_errored(job.id, &e.to_string())
                    .await
                {
                    tracing::error!(error = %e, "Failed to mark job errored");
                }
            }
        }
    }

    async fn sweep(shared: &Shared) -> usize {
        let expired = match shared
            .store
            .sweep_errored_jobs(shared.config.errored_ttl)
            .await
        {
            Ok(expired) => expired,
            Err(e) => {
                tracing::error!(error = %e, "Errored job sweep failed");
                return 0;
            }
        };

        for job in &expired {
            tracing::warn!(
                job.id = job.id,
                tenant_id = job.file.tenant_id,
                error = job.error.as_deref().unwrap_or_default(),
                "Dropping expired errored job"
            );
            shared.handler.discard(job).await;
        }
        expired.len()
    }
}
