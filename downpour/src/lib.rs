//! downpour library crate.
//!
//! Concurrency-and-lifecycle core for a media-download service:
//! - [`registry::JobRegistry`]: thread-safe job state tracking,
//! - [`executor::WorkExecutor`]: bounded admission and a fixed worker pool,
//! - [`cleanup::CleanupScheduler`]: deferred, cancellable artifact deletion.
//!
//! The actual media retrieval is delegated to an [`extractor::Extractor`]
//! implementation and treated as an opaque unit of work; none of the safety
//! properties here rely on it.

pub mod cleanup;
pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod extractor;
pub mod logging;
pub mod progress;
pub mod registry;

pub use cleanup::CleanupScheduler;
pub use config::CoreConfig;
pub use container::ServiceContainer;
pub use error::{Error, Result};
pub use executor::{ExecutorConfig, ExecutorHealth, WorkExecutor};
pub use extractor::{ExtractionOutput, ExtractionRequest, Extractor};
pub use progress::{ProgressSink, ProgressSnapshot};
pub use registry::{
    JobFailure, JobKind, JobLogEntry, JobOutcome, JobRecord, JobRegistry, JobSpec, JobStats,
    JobStatus, JobUpdate, LogLevel,
};
