//! Bounded work executor: admission, dispatch and job execution.
//!
//! Admission capacity is `max_concurrent + max_queued`, enforced by a
//! semaphore whose permit is claimed before the job record exists and
//! travels with the job until its worker finishes. That makes the
//! admission/dispatch step atomic with respect to concurrent `submit`
//! calls: over-admission past capacity is impossible, and a rejected
//! submission leaves no record behind.
//!
//! Each worker holds no registry lock across the extraction call; records
//! are only touched to read or write snapshots.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::CleanupScheduler;
use crate::extractor::{ExtractionRequest, Extractor};
use crate::progress::ProgressSink;
use crate::registry::{
    JobFailure, JobOutcome, JobRecord, JobRegistry, JobSpec, JobStats, JobStatus, JobUpdate,
};
use crate::{Error, Result};

fn default_max_concurrent() -> usize {
    4
}

fn default_max_queued() -> usize {
    16
}

fn default_job_timeout_secs() -> u64 {
    3600 // 1 hour
}

fn default_artifact_ttl_secs() -> u64 {
    3600 // 1 hour
}

/// Configuration for the work executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum jobs executing at once (worker slot count).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum jobs admitted beyond the running slots.
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,

    /// Job timeout in seconds; 0 disables the timeout.
    ///
    /// A job exceeding this duration is failed and its extraction future
    /// dropped. Extractors must be cancel-safe to handle this gracefully.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Retention window in seconds before a completed artifact is deleted.
    #[serde(default = "default_artifact_ttl_secs")]
    pub artifact_ttl_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queued: default_max_queued(),
            job_timeout_secs: default_job_timeout_secs(),
            artifact_ttl_secs: default_artifact_ttl_secs(),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_max_queued(mut self, max: usize) -> Self {
        self.max_queued = max;
        self
    }

    pub fn with_job_timeout_secs(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    pub fn with_artifact_ttl_secs(mut self, secs: u64) -> Self {
        self.artifact_ttl_secs = secs;
        self
    }
}

/// Executor health snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutorHealth {
    pub started: bool,
    pub active_count: usize,
    pub queued_count: usize,
    pub capacity: usize,
}

/// A job travelling from `submit` to a worker, carrying its admission
/// permit. Dropping it (for any reason) releases the slot.
struct DispatchedJob {
    job_id: String,
    permit: OwnedSemaphorePermit,
}

/// State that only exists while the executor is started.
struct RuntimeState {
    queue_tx: mpsc::Sender<DispatchedJob>,
    workers: JoinSet<()>,
    pool_token: CancellationToken,
}

/// Shared internals, visible to the worker tasks.
struct Inner {
    config: ExecutorConfig,
    registry: Arc<JobRegistry>,
    cleanup: Arc<CleanupScheduler>,
    extractor: Arc<dyn Extractor>,
    /// Admission slots: one permit per unit of capacity.
    slots: Arc<Semaphore>,
    /// Signalled whenever a slot is released.
    capacity_notify: Notify,
    active: AtomicUsize,
    queued: AtomicUsize,
    /// Cancellation tokens for running jobs.
    cancel_tokens: DashMap<String, CancellationToken>,
}

/// Bounded worker queue with a fixed-size execution pool.
pub struct WorkExecutor {
    inner: Arc<Inner>,
    state: parking_lot::Mutex<Option<RuntimeState>>,
}

impl WorkExecutor {
    /// Create an executor. The registry and cleanup scheduler must already
    /// be constructed; the executor never reaches into their internals.
    pub fn new(
        config: ExecutorConfig,
        registry: Arc<JobRegistry>,
        cleanup: Arc<CleanupScheduler>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        let capacity = config.max_concurrent + config.max_queued;
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                cleanup,
                extractor,
                slots: Arc::new(Semaphore::new(capacity)),
                capacity_notify: Notify::new(),
                active: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                cancel_tokens: DashMap::new(),
            }),
            state: parking_lot::Mutex::new(None),
        }
    }

    /// Total admission capacity (`max_concurrent + max_queued`).
    pub fn capacity(&self) -> usize {
        self.inner.config.max_concurrent + self.inner.config.max_queued
    }

    /// Spawn the worker pool.
    ///
    /// Must be called within a tokio runtime. Fails with
    /// [`Error::AlreadyStarted`] if called twice without an intervening
    /// [`WorkExecutor::shutdown`].
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let (queue_tx, queue_rx) = mpsc::channel::<DispatchedJob>(self.capacity().max(1));
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let pool_token = CancellationToken::new();

        // Stale counters can survive an aborted shutdown.
        self.inner.active.store(0, Ordering::SeqCst);
        self.inner.queued.store(0, Ordering::SeqCst);

        let mut workers = JoinSet::new();
        for i in 0..self.inner.config.max_concurrent.max(1) {
            let inner = self.inner.clone();
            let queue_rx = queue_rx.clone();
            let pool_token = pool_token.clone();
            workers.spawn(async move {
                worker_loop(inner, queue_rx, pool_token, i).await;
            });
        }

        info!(
            "Executor started with {} workers, {} queue slots",
            self.inner.config.max_concurrent, self.inner.config.max_queued
        );

        *state = Some(RuntimeState {
            queue_tx,
            workers,
            pool_token,
        });
        Ok(())
    }

    /// Admit and dispatch a job. Fails fast with [`Error::QueueFull`] when
    /// admission capacity is exhausted; no silent dropping, and a rejected
    /// submission leaves no job record behind.
    pub fn submit(&self, spec: JobSpec) -> Result<String> {
        let queue_tx = {
            let state = self.state.lock();
            match state.as_ref() {
                Some(s) => s.queue_tx.clone(),
                None => return Err(Error::NotStarted),
            }
        };

        let permit = self
            .inner
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::QueueFull {
                capacity: self.capacity(),
            })?;

        let record = self.inner.registry.create(spec);
        let job_id = record.id.clone();
        self.inner.queued.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = queue_tx.try_send(DispatchedJob {
            job_id: job_id.clone(),
            permit,
        }) {
            // Only possible when shutdown closed the channel between the
            // state check and here; the permit count always leaves room.
            self.inner.queued.fetch_sub(1, Ordering::SeqCst);
            let _ = self.inner.registry.cancel_if_queued(&job_id);
            self.inner.capacity_notify.notify_waiters();
            return match e {
                TrySendError::Closed(_) | TrySendError::Full(_) => Err(Error::NotStarted),
            };
        }

        debug!(job_id = %job_id, "Submitted job");
        Ok(job_id)
    }

    /// Block until an admission slot frees or `timeout` elapses; returns
    /// whether capacity became available. Parks on a notify primitive,
    /// never busy-polls.
    pub async fn wait_for_capacity(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut notified = std::pin::pin!(self.inner.capacity_notify.notified());
            // Register before checking so a release between the check and
            // the await is not missed.
            notified.as_mut().enable();
            if self.inner.slots.available_permits() > 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.slots.available_permits() > 0;
            }
        }
    }

    /// Cancel a job.
    ///
    /// A queued job is marked `Cancelled` and never starts. A running job
    /// has its cancellation token fired: the acknowledgment is immediate,
    /// while actual termination of the extraction call is cooperative and
    /// unguaranteed in time. An extractor that ignores its token is not
    /// forcibly killed. Terminal jobs are rejected with
    /// [`Error::InvalidStateTransition`].
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        if self.inner.registry.cancel_if_queued(job_id)? {
            info!(job_id = %job_id, "Cancelled queued job");
            return Ok(());
        }

        if let Some(token) = self.inner.cancel_tokens.get(job_id) {
            token.cancel();
            info!(job_id = %job_id, "Signalled cancellation for running job");
            return Ok(());
        }

        // The job left Running between the two checks; report its terminal
        // state.
        let record = self.inner.registry.get(job_id)?;
        Err(Error::invalid_transition(
            format!("{:?}", record.status),
            "Cancelled",
        ))
    }

    /// Snapshot of a job's record.
    pub fn status(&self, job_id: &str) -> Result<JobRecord> {
        self.inner.registry.get(job_id)
    }

    /// List job snapshots in insertion order, optionally filtered by status.
    pub fn list(&self, status: Option<JobStatus>, limit: Option<usize>) -> Vec<JobRecord> {
        self.inner.registry.list(status, limit)
    }

    /// Aggregate job statistics.
    pub fn stats(&self) -> JobStats {
        self.inner.registry.stats()
    }

    /// Executor health snapshot.
    pub fn health(&self) -> ExecutorHealth {
        ExecutorHealth {
            started: self.state.lock().is_some(),
            active_count: self.inner.active.load(Ordering::SeqCst),
            queued_count: self.inner.queued.load(Ordering::SeqCst),
            capacity: self.capacity(),
        }
    }

    /// Stop the executor.
    ///
    /// New submissions are rejected immediately. With `wait = true` the
    /// pool drains admitted jobs, bounded by `timeout` (default 30s), after
    /// which the remaining work is cancelled; with `wait = false` running
    /// jobs are signalled to cancel right away. Calling this before
    /// [`WorkExecutor::start`] reports [`Error::NotStarted`] rather than
    /// panicking.
    pub async fn shutdown(&self, wait: bool, timeout: Option<Duration>) -> Result<()> {
        let state = self.state.lock().take();
        let Some(state) = state else {
            return Err(Error::NotStarted);
        };
        let RuntimeState {
            queue_tx,
            mut workers,
            pool_token,
        } = state;

        // Closing the channel stops admission; workers drain what is left.
        drop(queue_tx);

        if !wait {
            pool_token.cancel();
            self.cancel_running_jobs();
        }

        let limit = timeout.unwrap_or(Duration::from_secs(30));
        let drained = tokio::time::timeout(limit, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                "Executor drain did not finish within {:?}; cancelling remaining work",
                limit
            );
            pool_token.cancel();
            self.cancel_running_jobs();
            workers.abort_all();
            while workers.join_next().await.is_some() {}

            // Aborted workers never reached their finalization; settle the
            // records they abandoned.
            let orphaned: Vec<String> = self
                .inner
                .cancel_tokens
                .iter()
                .map(|entry| entry.key().clone())
                .collect();
            for job_id in orphaned {
                let _ = self
                    .inner
                    .registry
                    .update(&job_id, JobUpdate::new().status(JobStatus::Cancelled));
                self.inner.cancel_tokens.remove(&job_id);
            }
        }

        info!("Executor stopped");
        Ok(())
    }

    fn cancel_running_jobs(&self) {
        for entry in self.inner.cancel_tokens.iter() {
            entry.value().cancel();
        }
    }
}

async fn worker_loop(
    inner: Arc<Inner>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DispatchedJob>>>,
    pool_token: CancellationToken,
    worker_index: usize,
) {
    debug!("Worker {} started", worker_index);

    loop {
        if pool_token.is_cancelled() {
            break;
        }

        let dispatched = {
            let mut rx = queue_rx.lock().await;
            tokio::select! {
                _ = pool_token.cancelled() => None,
                job = rx.recv() => job,
            }
        };

        let Some(dispatched) = dispatched else {
            // Pool cancelled, or channel closed and drained.
            break;
        };
        inner.queued.fetch_sub(1, Ordering::SeqCst);

        if pool_token.is_cancelled() {
            // Immediate shutdown: leave the record queued and release the
            // slot.
            drop(dispatched);
            inner.capacity_notify.notify_waiters();
            break;
        }

        inner.run_job(dispatched).await;
    }

    debug!("Worker {} shutting down", worker_index);
}

impl Inner {
    async fn run_job(&self, dispatched: DispatchedJob) {
        let DispatchedJob { job_id, permit } = dispatched;

        let release = |permit: OwnedSemaphorePermit| {
            drop(permit);
            self.capacity_notify.notify_waiters();
        };

        let record = match self.registry.get(&job_id) {
            Ok(record) => record,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Dispatched job vanished from registry");
                release(permit);
                return;
            }
        };
        if record.status == JobStatus::Cancelled {
            debug!(job_id = %job_id, "Skipping job cancelled while queued");
            release(permit);
            return;
        }

        // Token goes in before the Running transition so a concurrent
        // cancel always finds either a queued record or a live token.
        let token = CancellationToken::new();
        self.cancel_tokens.insert(job_id.clone(), token.clone());

        match self
            .registry
            .update(&job_id, JobUpdate::new().status(JobStatus::Running))
        {
            Ok(_) => {}
            Err(Error::InvalidStateTransition { .. }) => {
                // Lost the race against a queued-job cancellation.
                debug!(job_id = %job_id, "Job cancelled before execution started");
                self.cancel_tokens.remove(&job_id);
                release(permit);
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to mark job running");
                self.cancel_tokens.remove(&job_id);
                release(permit);
                return;
            }
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        info!(job_id = %job_id, url = %record.spec.url, "Job started");

        let request = ExtractionRequest::from_spec(&job_id, &record.spec);
        let sink = ProgressSink::new(job_id.clone(), self.registry.clone());

        // No registry lock is held across this call; it may block for a
        // long time.
        let extraction = self.extractor.extract(&request, &sink, &token);
        let outcome = match self.config.job_timeout_secs {
            0 => Ok(extraction.await),
            secs => tokio::time::timeout(Duration::from_secs(secs), extraction).await,
        };

        self.finalize_job(&job_id, &token, outcome);

        self.cancel_tokens.remove(&job_id);
        self.active.fetch_sub(1, Ordering::SeqCst);
        release(permit);
    }

    fn finalize_job(
        &self,
        job_id: &str,
        token: &CancellationToken,
        outcome: std::result::Result<
            Result<crate::extractor::ExtractionOutput>,
            tokio::time::error::Elapsed,
        >,
    ) {
        if token.is_cancelled() {
            match self
                .registry
                .update(job_id, JobUpdate::new().status(JobStatus::Cancelled))
            {
                Ok(_) => info!(job_id = %job_id, "Job cancelled"),
                Err(e) => debug!(job_id = %job_id, error = %e, "Cancel finalization skipped"),
            }
            return;
        }

        match outcome {
            Ok(Ok(output)) => {
                let job_outcome = JobOutcome {
                    output_path: output.output_path.clone(),
                    metadata: output.metadata,
                    duration_secs: output.duration_secs,
                };
                let update = JobUpdate::new()
                    .status(JobStatus::Completed)
                    .outcome(job_outcome)
                    .logs(output.logs);
                match self.registry.update(job_id, update) {
                    Ok(_) => {
                        info!(
                            job_id = %job_id,
                            duration_secs = output.duration_secs,
                            "Job completed"
                        );
                        if let Some(path) = output.output_path {
                            let ttl = Duration::from_secs(self.config.artifact_ttl_secs);
                            let task_id = self.cleanup.schedule(path, ttl);
                            debug!(job_id = %job_id, task_id = %task_id, "Scheduled artifact deletion");
                        }
                    }
                    Err(e) => {
                        // A cancel may have landed between the token check
                        // and here; the record already settled.
                        debug!(job_id = %job_id, error = %e, "Completion finalization skipped");
                    }
                }
            }
            Ok(Err(e)) => {
                let failure = JobFailure::from_error(&e);
                warn!(job_id = %job_id, kind = %failure.kind, "Job failed: {}", failure.message);
                let update = JobUpdate::new()
                    .status(JobStatus::Failed)
                    .failure(failure);
                if let Err(e) = self.registry.update(job_id, update) {
                    debug!(job_id = %job_id, error = %e, "Failure finalization skipped");
                }
            }
            Err(_elapsed) => {
                let secs = self.config.job_timeout_secs;
                warn!(job_id = %job_id, "Job timed out after {}s", secs);
                let update = JobUpdate::new().status(JobStatus::Failed).failure(
                    JobFailure::new("timeout", format!("job exceeded the {secs}s limit")),
                );
                if let Err(e) = self.registry.update(job_id, update) {
                    debug!(job_id = %job_id, error = %e, "Timeout finalization skipped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_config_default() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.max_queued, 16);
        assert_eq!(config.job_timeout_secs, 3600);
        assert_eq!(config.artifact_ttl_secs, 3600);
    }

    #[test]
    fn test_executor_config_builder() {
        let config = ExecutorConfig::new()
            .with_max_concurrent(2)
            .with_max_queued(0)
            .with_job_timeout_secs(60)
            .with_artifact_ttl_secs(300);

        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.max_queued, 0);
        assert_eq!(config.job_timeout_secs, 60);
        assert_eq!(config.artifact_ttl_secs, 300);
    }
}
