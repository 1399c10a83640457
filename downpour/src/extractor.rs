//! Extraction collaborator seam.
//!
//! The actual media retrieval (format negotiation, network transfer,
//! transcoding) lives behind the [`Extractor`] trait. The core treats it as
//! an opaque, possibly slow, possibly-failing unit of work and provides no
//! safety property through it: admission, state tracking and cleanup are
//! all enforced on this side of the seam.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::progress::ProgressSink;
use crate::registry::{JobKind, JobLogEntry, JobSpec};

/// Input handed to the extractor for one job.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    /// Id of the job being executed.
    pub job_id: String,
    /// Source location.
    pub url: String,
    /// Download or metadata-only.
    pub kind: JobKind,
    /// Optional format selector, passed through opaquely.
    pub format: Option<String>,
    /// Optional destination directory hint, passed through opaquely.
    pub output_dir: Option<String>,
}

impl ExtractionRequest {
    /// Build a request from a submitted spec.
    pub fn from_spec(job_id: impl Into<String>, spec: &JobSpec) -> Self {
        Self {
            job_id: job_id.into(),
            url: spec.url.clone(),
            kind: spec.kind,
            format: spec.format.clone(),
            output_dir: spec.output_dir.clone(),
        }
    }
}

/// Output of a successful extraction.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutput {
    /// Artifact path on disk; `None` for metadata-only jobs.
    pub output_path: Option<String>,
    /// Opaque metadata payload.
    pub metadata: Option<serde_json::Value>,
    /// Wall-clock duration of the extraction in seconds.
    pub duration_secs: f64,
    /// Logs captured during extraction, merged into the job record.
    pub logs: Vec<JobLogEntry>,
}

/// Trait for the external media-extraction adapter.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Adapter name, for logging.
    fn name(&self) -> &'static str;

    /// Perform the extraction for one job.
    ///
    /// Progress should be reported through `progress` as it becomes
    /// available; the sink tolerates its own failures and never aborts the
    /// job. `cancel` is the job's cooperative cancellation signal:
    /// implementations should observe it and return promptly, but the core
    /// will not forcibly kill an implementation that ignores it.
    ///
    /// # Cancel Safety
    ///
    /// This method MUST be cancel-safe. The worker drops the future when the
    /// job exceeds its timeout or the process shuts down; implementations
    /// must not leave external state inconsistent when that happens.
    async fn extract(
        &self,
        request: &ExtractionRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ExtractionOutput>;
}
