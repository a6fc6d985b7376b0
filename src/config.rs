//! Pipeline configuration.
//!
//! Every field has a default, so an empty TOML file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ImportError;

/// Upper bound on a single rate-limit wait.
pub const DEFAULT_MAX_RETRY_DELAY_SECS: u64 = 20;

/// Items requested per page from the source API.
pub const DEFAULT_PAGE_LENGTH: u32 = 25;

/// Delay between finalizer iterations while placeholder references remain.
pub const DEFAULT_FINISH_POLL_DELAY_SECS: u64 = 30;

/// Deadline after which a stalled barrier is forced forward.
pub const DEFAULT_WAITER_TIMEOUT_SECS: u64 = 4 * 60 * 60;

/// Attempts per job before it is marked failed.
pub const DEFAULT_JOB_MAX_ATTEMPTS: i64 = 5;

/// A job claimed longer ago than this is assumed to belong to a dead runner.
pub const DEFAULT_STALE_JOB_TIMEOUT_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PipelineConfig {
    /// Maximum seconds to honour a `retry-after` hint.
    pub max_retry_delay_secs: u64,

    /// Page length for paginated collections.
    pub page_length: u32,

    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Seconds between finalizer iterations.
    pub finish_poll_delay_secs: u64,

    /// Seconds a barrier may wait before it is forced forward.
    pub waiter_timeout_secs: u64,

    /// Attempts per job, including the first.
    pub job_max_attempts: i64,

    /// Base of the exponential backoff between job attempts.
    pub job_retry_base_delay_secs: u64,

    /// Cap on the backoff between job attempts.
    pub job_retry_max_delay_secs: u64,

    /// How often an idle job runner polls the queue.
    pub poll_interval_millis: u64,

    /// Seconds after which a `running` job is handed out again on runner start.
    pub stale_job_timeout_secs: u64,

    /// Whether the LFS objects stage downloads anything.
    pub lfs_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retry_delay_secs: DEFAULT_MAX_RETRY_DELAY_SECS,
            page_length: DEFAULT_PAGE_LENGTH,
            request_timeout_secs: 30,
            finish_poll_delay_secs: DEFAULT_FINISH_POLL_DELAY_SECS,
            waiter_timeout_secs: DEFAULT_WAITER_TIMEOUT_SECS,
            job_max_attempts: DEFAULT_JOB_MAX_ATTEMPTS,
            job_retry_base_delay_secs: 10,
            job_retry_max_delay_secs: 600,
            poll_interval_millis: 1000,
            stale_job_timeout_secs: DEFAULT_STALE_JOB_TIMEOUT_SECS,
            lfs_enabled: true,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ImportError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ImportError::invalid_input(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self, ImportError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ImportError::invalid_input(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ImportError> {
        if self.page_length == 0 {
            return Err(ImportError::invalid_input_field(
                "page length must be positive",
                "page-length",
            ));
        }
        if self.job_max_attempts < 1 {
            return Err(ImportError::invalid_input_field(
                "at least one attempt is required",
                "job-max-attempts",
            ));
        }
        if self.poll_interval_millis == 0 {
            return Err(ImportError::invalid_input_field(
                "poll interval must be positive",
                "poll-interval-millis",
            ));
        }
        Ok(())
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn finish_poll_delay(&self) -> Duration {
        Duration::from_secs(self.finish_poll_delay_secs)
    }

    pub fn waiter_timeout(&self) -> Duration {
        Duration::from_secs(self.waiter_timeout_secs)
    }

    pub fn job_retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.job_retry_base_delay_secs)
    }

    pub fn job_retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.job_retry_max_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn stale_job_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_job_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.page_length, 25);
        assert_eq!(config.max_retry_delay(), Duration::from_secs(20));
        assert_eq!(config.finish_poll_delay(), Duration::from_secs(30));
        assert_eq!(config.job_max_attempts, 5);
        assert_eq!(config.stale_job_timeout(), Duration::from_secs(3600));
        assert!(config.lfs_enabled);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = PipelineConfig::from_toml_str(
            "page-length = 100\nmax-retry-delay-secs = 5\nlfs-enabled = false\n",
        )
        .unwrap();
        assert_eq!(config.page_length, 100);
        assert_eq!(config.max_retry_delay_secs, 5);
        assert!(!config.lfs_enabled);
        assert_eq!(config.finish_poll_delay_secs, DEFAULT_FINISH_POLL_DELAY_SECS);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(PipelineConfig::from_toml_str("page-length = 0").is_err());
        assert!(PipelineConfig::from_toml_str("job-max-attempts = 0").is_err());
        assert!(PipelineConfig::from_toml_str("page-length = \"many\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "finish-poll-delay-secs = 45\n").unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.finish_poll_delay(), Duration::from_secs(45));

        assert!(PipelineConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
