//! Deferred-deletion scheduler for downloaded artifacts.
//!
//! Completed artifacts are removed from storage after a retention window.
//! A single background worker sleeps until the earliest pending deadline or
//! until it is signalled (a task scheduled earlier than the current wait
//! target, or shutdown), never on a fixed poll interval. Filesystem
//! deletion happens outside the scheduler lock so that slow I/O cannot
//! block task-set mutation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A pending deletion, ordered by deadline then insertion sequence.
///
/// Tasks with equal deadlines may fire in either order; the sequence number
/// only gives the heap a total order.
#[derive(Debug)]
struct CleanupTask {
    execute_at: Instant,
    seq: u64,
    task_id: String,
    path: PathBuf,
}

impl PartialEq for CleanupTask {
    fn eq(&self, other: &Self) -> bool {
        self.execute_at == other.execute_at && self.seq == other.seq
    }
}

impl Eq for CleanupTask {}

impl PartialOrd for CleanupTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CleanupTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.execute_at, self.seq).cmp(&(other.execute_at, other.seq))
    }
}

struct CleanupState {
    /// Min-heap of pending tasks, earliest deadline first.
    heap: BinaryHeap<Reverse<CleanupTask>>,
    /// Pending task ids mapped to their cancelled flag. A task leaves this
    /// map exactly once: when it fires or when shutdown discards it.
    pending: HashMap<String, bool>,
    next_seq: u64,
}

/// Schedules filesystem deletions at a future time, with cancellation.
pub struct CleanupScheduler {
    state: Arc<Mutex<CleanupState>>,
    notify: Arc<Notify>,
    shutdown_token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupScheduler {
    /// Create the scheduler and spawn its background worker.
    ///
    /// Must be called within a tokio runtime.
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(CleanupState {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_seq: 0,
        }));
        let notify = Arc::new(Notify::new());
        let shutdown_token = CancellationToken::new();

        let worker = tokio::spawn(Self::worker_loop(
            state.clone(),
            notify.clone(),
            shutdown_token.clone(),
        ));
        info!("Cleanup scheduler started");

        Self {
            state,
            notify,
            shutdown_token,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Schedule `path` for deletion after `delay`; returns a cancellation
    /// handle.
    pub fn schedule(&self, path: impl Into<PathBuf>, delay: Duration) -> String {
        let path = path.into();
        let task_id = uuid::Uuid::new_v4().to_string();
        let execute_at = Instant::now() + delay;

        let is_earliest = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let earliest = state.heap.peek().map(|Reverse(t)| t.execute_at);
            state.heap.push(Reverse(CleanupTask {
                execute_at,
                seq,
                task_id: task_id.clone(),
                path: path.clone(),
            }));
            state.pending.insert(task_id.clone(), false);
            earliest.is_none_or(|t| execute_at < t)
        };

        // Only a new earliest deadline moves the worker's wait target.
        if is_earliest {
            self.notify.notify_one();
        }

        debug!(task_id = %task_id, path = %path.display(), delay_ms = delay.as_millis() as u64, "Scheduled deletion");
        task_id
    }

    /// Cancel a pending deletion.
    ///
    /// Returns whether cancellation succeeded: `false` for an unknown id, a
    /// task that already fired, or a task already cancelled. Cancellation is
    /// inherently racy against firing, so this never errors.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.pending.get_mut(task_id) {
            Some(cancelled) if !*cancelled => {
                *cancelled = true;
                debug!(task_id = %task_id, "Cancelled scheduled deletion");
                true
            }
            _ => false,
        }
    }

    /// Number of pending (scheduled, not yet resolved) deletions.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Stop the worker, waiting up to `timeout` for a deletion-in-flight to
    /// finish. Pending tasks are discarded without execution.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown_token.cancel();
        self.notify.notify_one();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("Cleanup worker did not stop within {:?}", timeout);
            }
        }

        let mut state = self.state.lock();
        let discarded = state.pending.len();
        state.heap.clear();
        state.pending.clear();
        if discarded > 0 {
            info!("Discarded {} pending deletions on shutdown", discarded);
        }
    }

    async fn worker_loop(
        state: Arc<Mutex<CleanupState>>,
        notify: Arc<Notify>,
        shutdown_token: CancellationToken,
    ) {
        loop {
            let next_deadline = state.lock().heap.peek().map(|Reverse(t)| t.execute_at);

            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    debug!("Cleanup worker shutting down");
                    break;
                }
                _ = notify.notified() => {
                    // Wait target changed; recompute the deadline.
                    continue;
                }
                _ = Self::wait_for_deadline(next_deadline) => {}
            }

            // Pop everything due under the lock, delete outside it.
            let due = {
                let mut state = state.lock();
                let now = Instant::now();
                let mut due = Vec::new();
                while let Some(Reverse(task)) = state.heap.peek() {
                    if task.execute_at > now {
                        break;
                    }
                    let Reverse(task) = state.heap.pop().expect("peeked entry");
                    let cancelled = state.pending.remove(&task.task_id).unwrap_or(true);
                    if cancelled {
                        debug!(task_id = %task.task_id, "Skipping cancelled deletion");
                    } else {
                        due.push(task);
                    }
                }
                due
            };

            for task in due {
                match tokio::fs::remove_file(&task.path).await {
                    Ok(()) => {
                        info!(task_id = %task.task_id, path = %task.path.display(), "Deleted expired artifact");
                    }
                    Err(e) => {
                        // Each task's failure is independent; keep going.
                        warn!(
                            task_id = %task.task_id,
                            path = %task.path.display(),
                            error = %e,
                            "Failed to delete expired artifact"
                        );
                    }
                }
            }
        }
    }

    /// Sleep until the deadline, or forever when nothing is pending.
    async fn wait_for_deadline(deadline: Option<Instant>) {
        match deadline {
            Some(instant) => tokio::time::sleep_until(instant).await,
            None => std::future::pending().await,
        }
    }
}
