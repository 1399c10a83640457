//! In-memory job state registry.
//!
//! The registry is the single owner of all [`JobRecord`] storage. Callers
//! get cloned snapshots out, never references into the store, and every
//! mutation goes through [`JobRegistry::update`] so that status changes are
//! validated against the lifecycle state machine in one place.
//!
//! One `RwLock` guards the whole store. At this scale that is the simplest
//! strategy that keeps cross-record reads such as [`JobRegistry::stats`]
//! consistent: the counts always come from a single lock acquisition.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::progress::ProgressSnapshot;
use crate::{Error, Result};

/// Maximum log entries retained per job; oldest entries are evicted first.
const MAX_JOB_LOGS: usize = 100;

/// Job lifecycle status.
///
/// Legal transitions: `Queued -> Running -> {Completed, Failed}`,
/// `Queued -> Cancelled`, `Running -> Cancelled`. The three right-hand
/// states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job is waiting for a worker slot.
    Queued,
    /// Job is currently executing.
    Running,
    /// Job finished successfully.
    Completed,
    /// Job failed.
    Failed,
    /// Job was cancelled before or during execution.
    Cancelled,
}

impl JobStatus {
    /// Whether no further status mutation is permitted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

/// What kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Fetch media and produce an artifact on disk.
    Download,
    /// Probe metadata only; produces no artifact.
    Metadata,
}

/// Description of a unit of work submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Source location handed to the extractor.
    pub url: String,
    /// Download or metadata-only.
    pub kind: JobKind,
    /// Optional format selector, passed through opaquely.
    pub format: Option<String>,
    /// Optional destination directory hint, passed through opaquely.
    pub output_dir: Option<String>,
}

impl JobSpec {
    /// Create a download job spec.
    pub fn download(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: JobKind::Download,
            format: None,
            output_dir: None,
        }
    }

    /// Create a metadata-only job spec.
    pub fn metadata(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: JobKind::Metadata,
            format: None,
            output_dir: None,
        }
    }

    /// Set the format selector.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Set the destination directory hint.
    pub fn with_output_dir(mut self, dir: impl Into<String>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

/// Log level for job log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// A single timestamped log entry attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl JobLogEntry {
    /// Create a new log entry with the current timestamp.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

/// Captured failure of a job, set only when the job is `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    /// Failure category (e.g. "extraction", "timeout", "internal").
    pub kind: String,
    /// Human-readable message, captured verbatim.
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Build a failure from a crate error, preserving the extraction kind
    /// when one is available.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Extraction { kind, message } => Self::new(kind.clone(), message.clone()),
            other => Self::new("internal", other.to_string()),
        }
    }
}

/// Result payload of a completed job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Artifact path on disk, when the job produced one.
    pub output_path: Option<String>,
    /// Opaque extractor metadata.
    pub metadata: Option<serde_json::Value>,
    /// Extraction duration in seconds.
    pub duration_secs: f64,
}

/// One tracked unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job id, immutable after creation.
    pub id: String,
    /// The submitted spec, immutable after creation.
    pub spec: JobSpec,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Latest progress snapshot, replaced wholesale on every update.
    pub progress: Option<ProgressSnapshot>,
    /// Recent log entries, capped at [`MAX_JOB_LOGS`].
    pub logs: VecDeque<JobLogEntry>,
    /// Failure details, set only when `Failed`.
    pub error: Option<JobFailure>,
    /// Result payload, set only when `Completed`.
    pub result: Option<JobOutcome>,
}

impl JobRecord {
    fn new(spec: JobSpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            spec,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            progress: None,
            logs: VecDeque::new(),
            error: None,
            result: None,
        }
    }
}

/// Aggregate job counts, computed under one lock acquisition.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// A described set of field changes, applied atomically by
/// [`JobRegistry::update`].
#[derive(Debug, Default)]
pub struct JobUpdate {
    status: Option<JobStatus>,
    progress: Option<ProgressSnapshot>,
    logs: Vec<JobLogEntry>,
    error: Option<JobFailure>,
    result: Option<JobOutcome>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a status transition.
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Replace the progress snapshot.
    pub fn progress(mut self, snapshot: ProgressSnapshot) -> Self {
        self.progress = Some(snapshot);
        self
    }

    /// Append one log entry.
    pub fn log(mut self, entry: JobLogEntry) -> Self {
        self.logs.push(entry);
        self
    }

    /// Append several log entries.
    pub fn logs(mut self, entries: impl IntoIterator<Item = JobLogEntry>) -> Self {
        self.logs.extend(entries);
        self
    }

    /// Attach failure details; only valid together with `status(Failed)`.
    pub fn failure(mut self, failure: JobFailure) -> Self {
        self.error = Some(failure);
        self
    }

    /// Attach the result payload; only valid together with
    /// `status(Completed)`.
    pub fn outcome(mut self, outcome: JobOutcome) -> Self {
        self.result = Some(outcome);
        self
    }
}

struct RegistryInner {
    records: HashMap<String, JobRecord>,
    /// Insertion order of job ids, for `list`.
    order: Vec<String>,
}

/// Thread-safe owner of all job records.
pub struct JobRegistry {
    inner: RwLock<RegistryInner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                records: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Create a record for the spec and return a snapshot of it.
    pub fn create(&self, spec: JobSpec) -> JobRecord {
        let record = JobRecord::new(spec);
        let snapshot = record.clone();

        let mut inner = self.inner.write();
        inner.order.push(record.id.clone());
        inner.records.insert(record.id.clone(), record);
        drop(inner);

        debug!(job_id = %snapshot.id, "Created job record");
        snapshot
    }

    /// Apply a [`JobUpdate`] atomically and return the updated snapshot.
    ///
    /// Fails with [`Error::NotFound`] for an unknown id and with
    /// [`Error::InvalidStateTransition`] for an illegal status change; in
    /// either case the record is left unchanged. Progress and log appends
    /// against an already-terminal record are ignored rather than rejected:
    /// the only writer racing a terminal transition is the job's own worker
    /// winding down.
    pub fn update(&self, id: &str, update: JobUpdate) -> Result<JobRecord> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Job", id))?;

        if let Some(next) = update.status {
            if !record.status.can_transition_to(next) {
                return Err(Error::invalid_transition(
                    format!("{:?}", record.status),
                    format!("{next:?}"),
                ));
            }
        }
        if update.result.is_some() && update.status != Some(JobStatus::Completed) {
            return Err(Error::validation(
                "a result payload requires a transition to Completed",
            ));
        }
        if update.error.is_some() && update.status != Some(JobStatus::Failed) {
            return Err(Error::validation(
                "failure details require a transition to Failed",
            ));
        }

        // Validation passed; no error path below this point.
        if update.status.is_none() && record.status.is_terminal() {
            return Ok(record.clone());
        }

        if let Some(next) = update.status {
            let now = Utc::now();
            if next == JobStatus::Running {
                record.started_at = Some(now);
            }
            if next.is_terminal() {
                record.finished_at = Some(now);
            }
            record.status = next;
        }
        if let Some(snapshot) = update.progress {
            record.progress = Some(snapshot);
        }
        if let Some(failure) = update.error {
            record.error = Some(failure);
        }
        if let Some(outcome) = update.result {
            record.result = Some(outcome);
        }
        if !update.logs.is_empty() {
            record.logs.extend(update.logs);
            while record.logs.len() > MAX_JOB_LOGS {
                record.logs.pop_front();
            }
        }

        Ok(record.clone())
    }

    /// Atomically cancel the job if it is still queued.
    ///
    /// Returns `Ok(true)` when the job was queued and is now cancelled, and
    /// `Ok(false)` when it is running (the caller should signal the job's
    /// cancellation token instead). Terminal jobs are rejected with
    /// [`Error::InvalidStateTransition`].
    pub fn cancel_if_queued(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Job", id))?;

        match record.status {
            JobStatus::Queued => {
                record.status = JobStatus::Cancelled;
                record.finished_at = Some(Utc::now());
                Ok(true)
            }
            JobStatus::Running => Ok(false),
            status => Err(Error::invalid_transition(
                format!("{status:?}"),
                "Cancelled",
            )),
        }
    }

    /// Return a snapshot of the record.
    pub fn get(&self, id: &str) -> Result<JobRecord> {
        self.inner
            .read()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Job", id))
    }

    /// List records in insertion order, optionally filtered by status and
    /// truncated to `limit`.
    pub fn list(&self, status: Option<JobStatus>, limit: Option<usize>) -> Vec<JobRecord> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for id in &inner.order {
            if let Some(record) = inner.records.get(id) {
                if let Some(wanted) = status
                    && record.status != wanted
                {
                    continue;
                }
                out.push(record.clone());
                if let Some(limit) = limit
                    && out.len() >= limit
                {
                    break;
                }
            }
        }
        out
    }

    /// Aggregate counts from a single consistent view of the store.
    pub fn stats(&self) -> JobStats {
        let inner = self.inner.read();
        let mut stats = JobStats {
            total: inner.records.len(),
            ..JobStats::default()
        };
        for record in inner.records.values() {
            match record.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Remove terminal records that finished before `cutoff`.
    ///
    /// This is the explicit age-based eviction hook; the executor never
    /// deletes records on its own. Returns the number of evicted records.
    pub fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write();
        let evict: Vec<String> = inner
            .records
            .values()
            .filter(|r| {
                r.status.is_terminal()
                    && r.finished_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|r| r.id.clone())
            .collect();

        for id in &evict {
            inner.records.remove(id);
        }
        inner.order.retain(|id| !evict.contains(id));
        drop(inner);

        if !evict.is_empty() {
            info!("Evicted {} finished jobs", evict.len());
        }
        evict.len()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_job() -> (JobRegistry, String) {
        let registry = JobRegistry::new();
        let record = registry.create(JobSpec::download("https://example.com/v"));
        (registry, record.id)
    }

    #[test]
    fn test_create_starts_queued() {
        let (registry, id) = registry_with_job();
        let record = registry.get(&id).unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert!(record.started_at.is_none());
        assert!(record.finished_at.is_none());
    }

    #[test]
    fn test_legal_lifecycle_stamps_timestamps() {
        let (registry, id) = registry_with_job();

        let running = registry
            .update(&id, JobUpdate::new().status(JobStatus::Running))
            .unwrap();
        assert!(running.started_at.is_some());

        let done = registry
            .update(
                &id,
                JobUpdate::new()
                    .status(JobStatus::Completed)
                    .outcome(JobOutcome::default()),
            )
            .unwrap();
        assert!(done.finished_at.is_some());
        assert!(done.created_at <= done.started_at.unwrap());
        assert!(done.started_at.unwrap() <= done.finished_at.unwrap());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let (registry, id) = registry_with_job();
        registry
            .update(&id, JobUpdate::new().status(JobStatus::Running))
            .unwrap();
        registry
            .update(
                &id,
                JobUpdate::new()
                    .status(JobStatus::Completed)
                    .outcome(JobOutcome::default()),
            )
            .unwrap();

        let before = registry.get(&id).unwrap();
        let err = registry
            .update(&id, JobUpdate::new().status(JobStatus::Running))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        // Record unchanged by the rejected update.
        let after = registry.get(&id).unwrap();
        assert_eq!(after.status, before.status);
        assert_eq!(after.finished_at, before.finished_at);
    }

    #[test]
    fn test_queued_to_completed_rejected() {
        let (registry, id) = registry_with_job();
        let err = registry
            .update(
                &id,
                JobUpdate::new()
                    .status(JobStatus::Completed)
                    .outcome(JobOutcome::default()),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_result_requires_completed() {
        let (registry, id) = registry_with_job();
        let err = registry
            .update(&id, JobUpdate::new().outcome(JobOutcome::default()))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_log_cap_drops_oldest() {
        let (registry, id) = registry_with_job();
        registry
            .update(&id, JobUpdate::new().status(JobStatus::Running))
            .unwrap();

        for i in 0..150 {
            registry
                .update(&id, JobUpdate::new().log(JobLogEntry::info(format!("line {i}"))))
                .unwrap();
        }

        let record = registry.get(&id).unwrap();
        assert_eq!(record.logs.len(), 100);
        assert_eq!(record.logs.front().unwrap().message, "line 50");
        assert_eq!(record.logs.back().unwrap().message, "line 149");
    }

    #[test]
    fn test_progress_later_update_wins() {
        let (registry, id) = registry_with_job();
        registry
            .update(&id, JobUpdate::new().status(JobStatus::Running))
            .unwrap();

        registry
            .update(
                &id,
                JobUpdate::new().progress(ProgressSnapshot::new().with_percent(10.0)),
            )
            .unwrap();
        registry
            .update(
                &id,
                JobUpdate::new().progress(ProgressSnapshot::new().with_bytes(2048, None)),
            )
            .unwrap();

        // Replaced wholesale: the percent from the first update is gone.
        let progress = registry.get(&id).unwrap().progress.unwrap();
        assert_eq!(progress.percent, None);
        assert_eq!(progress.bytes_downloaded, Some(2048));
    }

    #[test]
    fn test_progress_after_terminal_is_ignored() {
        let (registry, id) = registry_with_job();
        registry
            .update(&id, JobUpdate::new().status(JobStatus::Running))
            .unwrap();
        registry
            .update(
                &id,
                JobUpdate::new()
                    .status(JobStatus::Completed)
                    .outcome(JobOutcome::default()),
            )
            .unwrap();

        registry
            .update(
                &id,
                JobUpdate::new().progress(ProgressSnapshot::new().with_percent(99.0)),
            )
            .unwrap();
        assert!(registry.get(&id).unwrap().progress.is_none());
    }

    #[test]
    fn test_cancel_if_queued() {
        let (registry, id) = registry_with_job();
        assert!(registry.cancel_if_queued(&id).unwrap());
        assert_eq!(registry.get(&id).unwrap().status, JobStatus::Cancelled);

        let err = registry.cancel_if_queued(&id).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_list_insertion_order_and_filter() {
        let registry = JobRegistry::new();
        let a = registry.create(JobSpec::download("https://example.com/a"));
        let b = registry.create(JobSpec::metadata("https://example.com/b"));
        let c = registry.create(JobSpec::download("https://example.com/c"));

        let all = registry.list(None, None);
        assert_eq!(
            all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec![a.id.as_str(), b.id.as_str(), c.id.as_str()]
        );

        registry.cancel_if_queued(&b.id).unwrap();
        let queued = registry.list(Some(JobStatus::Queued), None);
        assert_eq!(queued.len(), 2);

        let limited = registry.list(None, Some(1));
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, a.id);
    }

    #[test]
    fn test_concurrent_creates_unique_and_counted() {
        let registry = std::sync::Arc::new(JobRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..150 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                registry.create(JobSpec::metadata("https://example.com")).id
            }));
        }

        let mut ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 150);
        assert_eq!(registry.stats().total, 150);
        assert_eq!(registry.stats().queued, 150);
    }

    #[test]
    fn test_evict_finished_before() {
        let (registry, id) = registry_with_job();
        let keep = registry.create(JobSpec::download("https://example.com/keep"));

        registry
            .update(&id, JobUpdate::new().status(JobStatus::Running))
            .unwrap();
        registry
            .update(
                &id,
                JobUpdate::new()
                    .status(JobStatus::Failed)
                    .failure(JobFailure::new("extraction", "boom")),
            )
            .unwrap();

        // Cutoff in the future evicts the failed job but not the queued one.
        let evicted = registry.evict_finished_before(Utc::now() + chrono::Duration::hours(1));
        assert_eq!(evicted, 1);
        assert!(registry.get(&id).is_err());
        assert!(registry.get(&keep.id).is_ok());
    }
}
