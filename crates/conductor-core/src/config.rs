//! Queue configuration.
//!
//! Deserializes the JSON configuration surface (camelCase keys, durations in
//! milliseconds):
//!
//! ```json
//! {
//!   "concurrency": 2,
//!   "autoStart": true,
//!   "timeout": { "total": 600000, "setup": 30000, "execution": 540000,
//!                "cleanup": 30000, "warningThreshold": 0.9, "behavior": "soft" },
//!   "retry": { "maxRetries": 3, "initialDelay": 1000, "maxDelay": 60000,
//!              "backoffMultiplier": 2, "retryableErrors": [], "policy": "exponential" }
//! }
//! ```
//!
//! Every field is optional. A missing `retry` section means no retry policy.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ConductorError;

/// Backoff shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicyKind {
    /// Never retry.
    #[serde(alias = "NONE")]
    None,
    /// `initial_delay * attempt`
    #[serde(alias = "LINEAR")]
    Linear,
    /// `initial_delay * multiplier^(attempt - 1)`
    #[default]
    #[serde(alias = "EXPONENTIAL")]
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(rename = "initialDelay")]
    pub initial_delay_ms: u64,
    #[serde(rename = "maxDelay")]
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Case-insensitive substrings matched against the error message or
    /// code. Empty means every error is retryable.
    pub retryable_errors: Vec<String>,
    pub policy: RetryPolicyKind,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            retryable_errors: Vec::new(),
            policy: RetryPolicyKind::Exponential,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConductorError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConductorError::InvalidConfig(format!(
                "retry.backoffMultiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// Execution phase of a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Setup,
    Execution,
    Cleanup,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Execution => "execution",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when a budget runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutBehavior {
    /// Cancel immediately.
    Hard,
    /// Enter the cleanup phase and cancel once the cleanup budget (the grace
    /// period) has elapsed too.
    #[default]
    Soft,
}

/// Phase and total budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    #[serde(rename = "total")]
    pub total_ms: u64,
    #[serde(rename = "setup")]
    pub setup_ms: u64,
    #[serde(rename = "execution")]
    pub execution_ms: u64,
    #[serde(rename = "cleanup")]
    pub cleanup_ms: u64,
    /// Fraction of a budget after which a warning fires.
    pub warning_threshold: f64,
    pub behavior: TimeoutBehavior,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            total_ms: 600_000,
            setup_ms: 30_000,
            execution_ms: 540_000,
            cleanup_ms: 30_000,
            warning_threshold: 0.9,
            behavior: TimeoutBehavior::Soft,
        }
    }
}

impl TimeoutConfig {
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms)
    }

    pub fn phase_budget(&self, phase: Phase) -> Duration {
        let ms = match phase {
            Phase::Setup => self.setup_ms,
            Phase::Execution => self.execution_ms,
            Phase::Cleanup => self.cleanup_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> Result<(), ConductorError> {
        if self.total_ms == 0 {
            return Err(ConductorError::InvalidConfig(
                "timeout.total must be greater than zero".to_string(),
            ));
        }
        if !(self.warning_threshold > 0.0 && self.warning_threshold <= 1.0) {
            return Err(ConductorError::InvalidConfig(format!(
                "timeout.warningThreshold must be in (0, 1], got {}",
                self.warning_threshold
            )));
        }
        Ok(())
    }
}

/// Top-level queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Maximum number of tasks running at once.
    pub concurrency: usize,
    /// Start dispatching as soon as the queue is built.
    pub auto_start: bool,
    pub timeout: TimeoutConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            auto_start: true,
            timeout: TimeoutConfig::default(),
            retry: None,
        }
    }
}

impl QueueConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConductorError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConductorError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn validate(&self) -> Result<(), ConductorError> {
        if self.concurrency == 0 {
            return Err(ConductorError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        self.timeout.validate()?;
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}
