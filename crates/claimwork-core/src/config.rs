//! Worker configuration.
//!
//! Loading (files, env, CLI flags) is the embedding binary's job; this module
//! only defines the shape, defaults and validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for claiming, renewing, uploading and reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Renew this long before `takenUntil`.
    pub reclaim_margin_ms: u64,

    /// Give up on a renewal (and declare the claim lost) this long before
    /// `takenUntil`. Must be smaller than `reclaim_margin_ms`.
    pub expiry_guard_ms: u64,

    /// Upper bound on a single reclaim call.
    pub reclaim_timeout_ms: u64,

    /// Upper bound on a single claim, report or createArtifact call. Calls
    /// made under a claim are also cut off at `takenUntil - expiry_guard`.
    pub queue_timeout_ms: u64,

    /// Consecutive transient reclaim failures tolerated before the claim is
    /// treated as lost.
    pub max_transient_reclaim_failures: u32,

    pub claim_attempts: u32,
    pub report_attempts: u32,
    pub upload_attempts: u32,

    /// Upper bound on a single upload request.
    pub upload_timeout_ms: u64,

    /// Artifact lifetime requested from the queue.
    pub artifact_expiry_secs: u64,

    /// Reject artifacts that carry no signature.
    pub require_signed_artifacts: bool,

    pub poll_interval_ms: u64,
    pub worker_count: usize,

    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reclaim_margin_ms: 240_000,
            expiry_guard_ms: 30_000,
            reclaim_timeout_ms: 30_000,
            queue_timeout_ms: 60_000,
            max_transient_reclaim_failures: 5,
            claim_attempts: 3,
            report_attempts: 3,
            upload_attempts: 5,
            upload_timeout_ms: 300_000,
            artifact_expiry_secs: 365 * 24 * 60 * 60,
            require_signed_artifacts: false,
            poll_interval_ms: 5_000,
            worker_count: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Parse and validate. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expiry_guard_ms >= self.reclaim_margin_ms {
            return Err(ConfigError::Invalid(format!(
                "expiry_guard_ms ({}) must be smaller than reclaim_margin_ms ({})",
                self.expiry_guard_ms, self.reclaim_margin_ms
            )));
        }
        if self.reclaim_timeout_ms == 0 || self.queue_timeout_ms == 0 || self.upload_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        for (name, value) in [
            ("claim_attempts", self.claim_attempts),
            ("report_attempts", self.report_attempts),
            ("upload_attempts", self.upload_attempts),
            ("max_transient_reclaim_failures", self.max_transient_reclaim_failures),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".to_string()));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1.0".to_string()));
        }
        Ok(())
    }

    pub fn reclaim_margin(&self) -> Duration {
        Duration::from_millis(self.reclaim_margin_ms)
    }

    pub fn expiry_guard(&self) -> Duration {
        Duration::from_millis(self.expiry_guard_ms)
    }

    pub fn reclaim_timeout(&self) -> Duration {
        Duration::from_millis(self.reclaim_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn artifact_expiry(&self) -> Duration {
        Duration::from_secs(self.artifact_expiry_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
