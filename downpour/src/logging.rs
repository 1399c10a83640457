//! Tracing setup.
//!
//! A plain fmt subscriber with an `EnvFilter`, plus an optional
//! non-blocking daily-rolling file appender for deployments that keep logs
//! on disk.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "downpour=info";

fn build_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install a console subscriber with the given filter directive.
///
/// Safe to call more than once; later calls are no-ops (useful in tests).
pub fn init(directive: &str) {
    let _ = tracing_subscriber::registry()
        .with(build_filter(directive))
        .with(fmt::layer())
        .try_init();
}

/// Install a console subscriber plus a daily-rolling file appender under
/// `log_dir`. The returned guard must be kept alive for the lifetime of the
/// process; dropping it stops the background log writer.
pub fn init_with_file(directive: &str, log_dir: impl AsRef<Path>) -> WorkerGuard {
    let appender = tracing_appender::rolling::daily(log_dir, "downpour.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let _ = tracing_subscriber::registry()
        .with(build_filter(directive))
        .with(fmt::layer())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init();

    guard
}
