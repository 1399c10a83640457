//! Process-level configuration.
//!
//! Component configs live next to their components; this module only
//! gathers them and applies `DOWNPOUR_*` environment overrides on top of
//! the defaults. Unparsable values fall back to the default with a warning
//! rather than failing startup.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::executor::ExecutorConfig;
use crate::logging::DEFAULT_LOG_FILTER;

/// Top-level configuration for the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Executor configuration.
    pub executor: ExecutorConfig,
    /// Tracing filter directive.
    pub log_filter: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from the environment.
    ///
    /// Reads a `.env` file when one is present (missing files are fine),
    /// then applies `DOWNPOUR_MAX_CONCURRENT`, `DOWNPOUR_MAX_QUEUED`,
    /// `DOWNPOUR_JOB_TIMEOUT_SECS`, `DOWNPOUR_ARTIFACT_TTL_SECS` and
    /// `DOWNPOUR_LOG` on top of the defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let mut config = Self::default();
        if let Some(v) = env_parse::<usize>("DOWNPOUR_MAX_CONCURRENT") {
            config.executor.max_concurrent = v;
        }
        if let Some(v) = env_parse::<usize>("DOWNPOUR_MAX_QUEUED") {
            config.executor.max_queued = v;
        }
        if let Some(v) = env_parse::<u64>("DOWNPOUR_JOB_TIMEOUT_SECS") {
            config.executor.job_timeout_secs = v;
        }
        if let Some(v) = env_parse::<u64>("DOWNPOUR_ARTIFACT_TTL_SECS") {
            config.executor.artifact_ttl_secs = v;
        }
        if let Ok(v) = std::env::var("DOWNPOUR_LOG")
            && !v.is_empty()
        {
            config.log_filter = v;
        }
        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring unparsable {}={:?}", key, raw);
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.executor.max_concurrent, 4);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        // SAFETY: test-only mutation of the process environment.
        unsafe { std::env::set_var("DOWNPOUR_TEST_GARBAGE", "not-a-number") };
        assert_eq!(env_parse::<usize>("DOWNPOUR_TEST_GARBAGE"), None);
        unsafe { std::env::remove_var("DOWNPOUR_TEST_GARBAGE") };
    }
}
