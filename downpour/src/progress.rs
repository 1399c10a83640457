//! Progress reporting for running jobs.
//!
//! Extractors receive a [`ProgressSink`] and call [`ProgressSink::report`]
//! whenever the underlying tool emits a progress line. Each report replaces
//! the job's progress snapshot wholesale; a later update always wins.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::registry::{JobRegistry, JobUpdate};

/// Consecutive registry failures tolerated before the sink gives up.
const MAX_REPORT_FAILURES: u32 = 3;

/// Point-in-time progress of a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_downloaded: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_bytes_per_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
}

impl ProgressSnapshot {
    pub fn new() -> Self {
        Self {
            updated_at: Utc::now(),
            percent: None,
            bytes_downloaded: None,
            bytes_total: None,
            speed_bytes_per_sec: None,
            eta_secs: None,
        }
    }

    pub fn with_percent(mut self, percent: f32) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn with_bytes(mut self, downloaded: u64, total: Option<u64>) -> Self {
        self.bytes_downloaded = Some(downloaded);
        self.bytes_total = total;
        self
    }

    pub fn with_speed(mut self, bytes_per_sec: f64) -> Self {
        self.speed_bytes_per_sec = Some(bytes_per_sec);
        self
    }

    pub fn with_eta(mut self, secs: f64) -> Self {
        self.eta_secs = Some(secs);
        self
    }
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Sink that forwards extractor progress callbacks into the job registry.
///
/// A flaky progress channel must never abort an otherwise-healthy job: after
/// [`MAX_REPORT_FAILURES`] consecutive registry failures the sink abandons
/// itself and silently drops further reports. The job continues; only
/// progress visibility is degraded.
pub struct ProgressSink {
    job_id: String,
    registry: Arc<JobRegistry>,
    failures: AtomicU32,
    abandoned: AtomicBool,
}

impl ProgressSink {
    pub fn new(job_id: impl Into<String>, registry: Arc<JobRegistry>) -> Self {
        Self {
            job_id: job_id.into(),
            registry,
            failures: AtomicU32::new(0),
            abandoned: AtomicBool::new(false),
        }
    }

    /// Record a progress snapshot against the job.
    ///
    /// The snapshot is re-stamped with the current time so that a caller
    /// reusing a snapshot value cannot make progress appear to go backwards.
    pub fn report(&self, mut snapshot: ProgressSnapshot) {
        if self.abandoned.load(Ordering::Relaxed) {
            return;
        }

        snapshot.updated_at = Utc::now();
        match self
            .registry
            .update(&self.job_id, JobUpdate::new().progress(snapshot))
        {
            Ok(_) => {
                self.failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                let count = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= MAX_REPORT_FAILURES {
                    self.abandoned.store(true, Ordering::Relaxed);
                    warn!(
                        job_id = %self.job_id,
                        error = %e,
                        "Abandoning progress reporting after {} failures",
                        count
                    );
                } else {
                    debug!(
                        job_id = %self.job_id,
                        error = %e,
                        "Progress update failed (attempt {})",
                        count
                    );
                }
            }
        }
    }

    /// Whether the sink has given up forwarding reports.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// The job this sink reports for.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_builder() {
        let snapshot = ProgressSnapshot::new()
            .with_percent(42.0)
            .with_bytes(1024, Some(4096))
            .with_speed(512.0)
            .with_eta(6.0);

        assert_eq!(snapshot.percent, Some(42.0));
        assert_eq!(snapshot.bytes_downloaded, Some(1024));
        assert_eq!(snapshot.bytes_total, Some(4096));
        assert_eq!(snapshot.speed_bytes_per_sec, Some(512.0));
        assert_eq!(snapshot.eta_secs, Some(6.0));
    }

    #[test]
    fn test_sink_abandons_after_repeated_failures() {
        // Reports against a job that does not exist always fail.
        let registry = Arc::new(JobRegistry::new());
        let sink = ProgressSink::new("missing", registry);

        for _ in 0..MAX_REPORT_FAILURES {
            sink.report(ProgressSnapshot::new());
        }

        assert!(sink.is_abandoned());
    }
}
