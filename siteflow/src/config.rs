//! Run configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::StageName;
use crate::stages::RetryConfig;
use crate::tools::ToolPolicy;

/// Errors raised while loading or validating a [`RunConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid JSON for [`RunConfig`].
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// An environment override could not be parsed.
    #[error("Environment variable {var} has invalid value '{value}'")]
    Env {
        /// The variable name.
        var: &'static str,
        /// The rejected value.
        value: String,
    },

    /// A field has an unusable value.
    #[error("Invalid config field '{field}': {reason}")]
    Invalid {
        /// The field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Environment variable overriding `max_concurrency`.
pub const ENV_MAX_CONCURRENCY: &str = "SITEFLOW_MAX_CONCURRENCY";
/// Environment variable overriding `stage_timeout_ms`.
pub const ENV_STAGE_TIMEOUT_MS: &str = "SITEFLOW_STAGE_TIMEOUT_MS";
/// Environment variable overriding `phase_timeout_ms`.
pub const ENV_PHASE_TIMEOUT_MS: &str = "SITEFLOW_PHASE_TIMEOUT_MS";
/// Environment variable overriding `run_deadline_ms`.
pub const ENV_RUN_DEADLINE_MS: &str = "SITEFLOW_RUN_DEADLINE_MS";
/// Environment variable overriding `retry.max_attempts`.
pub const ENV_MAX_ATTEMPTS: &str = "SITEFLOW_MAX_ATTEMPTS";

/// Settings of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum research tasks running at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-attempt provider timeout in milliseconds.
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    /// Deadline of the research phase in milliseconds.
    #[serde(default = "default_phase_timeout_ms")]
    pub phase_timeout_ms: u64,
    /// Deadline of the whole run in milliseconds.
    #[serde(default)]
    pub run_deadline_ms: Option<u64>,
    /// Retry policy for transient provider failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Dispatch failed research queries once more before merging.
    #[serde(default)]
    pub retry_failed_queries: bool,
    /// Maximum questions turned into research queries.
    #[serde(default = "default_max_questions")]
    pub max_questions: usize,
    /// Stages whose failure is recorded as skipped instead of failing the run.
    #[serde(default)]
    pub optional_stages: BTreeSet<StageName>,
    /// Tool retry and failure policy.
    #[serde(default)]
    pub tool: ToolPolicy,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_stage_timeout_ms() -> u64 {
    60_000
}

fn default_phase_timeout_ms() -> u64 {
    180_000
}

fn default_max_questions() -> usize {
    5
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            stage_timeout_ms: default_stage_timeout_ms(),
            phase_timeout_ms: default_phase_timeout_ms(),
            run_deadline_ms: None,
            retry: RetryConfig::default(),
            retry_failed_queries: false,
            max_questions: default_max_questions(),
            optional_stages: BTreeSet::new(),
            tool: ToolPolicy::default(),
        }
    }
}

impl RunConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Applies `SITEFLOW_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
            let parsed = value.trim().parse();
            parsed.map_err(|_| ConfigError::Env { var, value })
        }

        if let Some(v) = lookup(ENV_MAX_CONCURRENCY) {
            self.max_concurrency = parse(ENV_MAX_CONCURRENCY, v)?;
        }
        if let Some(v) = lookup(ENV_STAGE_TIMEOUT_MS) {
            self.stage_timeout_ms = parse(ENV_STAGE_TIMEOUT_MS, v)?;
        }
        if let Some(v) = lookup(ENV_PHASE_TIMEOUT_MS) {
            self.phase_timeout_ms = parse(ENV_PHASE_TIMEOUT_MS, v)?;
        }
        if let Some(v) = lookup(ENV_RUN_DEADLINE_MS) {
            self.run_deadline_ms = Some(parse(ENV_RUN_DEADLINE_MS, v)?);
        }
        if let Some(v) = lookup(ENV_MAX_ATTEMPTS) {
            self.retry.max_attempts = parse(ENV_MAX_ATTEMPTS, v)?;
        }
        Ok(self)
    }

    /// Sets the research concurrency ceiling.
    #[must_use]
    pub const fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = crate::utils::millis(timeout);
        self
    }

    /// Sets the research phase deadline.
    #[must_use]
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout_ms = crate::utils::millis(timeout);
        self
    }

    /// Sets the run deadline.
    #[must_use]
    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline_ms = Some(crate::utils::millis(deadline));
        self
    }

    /// Sets the provider retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables the second round for failed research queries.
    #[must_use]
    pub const fn with_retry_failed_queries(mut self, enabled: bool) -> Self {
        self.retry_failed_queries = enabled;
        self
    }

    /// Sets the maximum number of research queries.
    #[must_use]
    pub const fn with_max_questions(mut self, max: usize) -> Self {
        self.max_questions = max;
        self
    }

    /// Marks a stage as optional.
    #[must_use]
    pub fn with_optional_stage(mut self, stage: StageName) -> Self {
        self.optional_stages.insert(stage);
        self
    }

    /// Sets the tool policy.
    #[must_use]
    pub fn with_tool_policy(mut self, policy: ToolPolicy) -> Self {
        self.tool = policy;
        self
    }

    /// Returns the per-attempt timeout.
    #[must_use]
    pub const fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    /// Returns the research phase deadline.
    #[must_use]
    pub const fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }

    /// Returns the run deadline, if any.
    #[must_use]
    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_ms.map(Duration::from_millis)
    }

    /// Returns true if `stage` is optional.
    #[must_use]
    pub fn is_optional(&self, stage: StageName) -> bool {
        self.optional_stages.contains(&stage)
    }

    /// Checks that every field is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if self.max_concurrency == 0 {
            return invalid("max_concurrency", "must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts", "must be at least 1");
        }
        if self.tool.max_attempts == 0 {
            return invalid("tool.max_attempts", "must be at least 1");
        }
        if self.max_questions == 0 {
            return invalid("max_questions", "must be at least 1");
        }
        if self.stage_timeout_ms == 0 {
            return invalid("stage_timeout_ms", "must be positive");
        }
        if self.phase_timeout_ms == 0 {
            return invalid("phase_timeout_ms", "must be positive");
        }
        if self.run_deadline_ms == Some(0) {
            return invalid("run_deadline_ms", "must be positive");
        }
        Ok(())
    }
}
