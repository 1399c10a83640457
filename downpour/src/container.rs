//! Service container for dependency injection.
//!
//! One long-lived instance of each component, constructed at process start
//! and handed to consumers. Replaces hidden global singletons while keeping
//! single-instance-per-process semantics.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cleanup::CleanupScheduler;
use crate::config::CoreConfig;
use crate::executor::WorkExecutor;
use crate::extractor::Extractor;
use crate::registry::JobRegistry;
use crate::Result;

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Container holding the core services.
pub struct ServiceContainer {
    /// Job state registry.
    pub registry: Arc<JobRegistry>,
    /// Deferred-deletion scheduler.
    pub cleanup: Arc<CleanupScheduler>,
    /// Work executor.
    pub executor: Arc<WorkExecutor>,
}

impl ServiceContainer {
    /// Wire the components and start the executor.
    ///
    /// Must be called within a tokio runtime. The registry and cleanup
    /// scheduler carry no dependency on each other; the executor requires
    /// both, so they are constructed first.
    pub fn new(config: CoreConfig, extractor: Arc<dyn Extractor>) -> Result<Self> {
        let registry = Arc::new(JobRegistry::new());
        let cleanup = Arc::new(CleanupScheduler::new());
        let executor = Arc::new(WorkExecutor::new(
            config.executor,
            registry.clone(),
            cleanup.clone(),
            extractor,
        ));
        executor.start()?;

        info!("Service container initialized");
        Ok(Self {
            registry,
            cleanup,
            executor,
        })
    }

    /// Drain the executor, then stop the cleanup scheduler.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        let limit = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.executor.shutdown(true, Some(limit)).await?;
        self.cleanup.shutdown(limit).await;
        info!("Service container stopped");
        Ok(())
    }
}
