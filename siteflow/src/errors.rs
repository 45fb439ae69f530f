//! Error types for the siteflow orchestrator.
//!
//! Errors are layered: providers and tools report their own narrow
//! taxonomies, stages wrap those with stage-level context, and the
//! pipeline wraps stage failures with the name of the stage that failed.
//! Every type exposes a stable `kind()` string and a `to_dict()` view
//! suitable for structured logs and event payloads.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::core::{FailedQuery, StageName};

/// Failure reported by a capability provider.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderError {
    /// The provider did not answer within the per-attempt timeout.
    #[error("Provider timed out after {elapsed_ms}ms")]
    Timeout {
        /// Time spent waiting before giving up.
        elapsed_ms: u64,
    },

    /// The provider answered with something that is not usable output.
    #[error("Invalid provider response: {reason}")]
    InvalidResponse {
        /// What was wrong with the response.
        reason: String,
    },

    /// The provider could not serve the request at all.
    #[error("Provider unavailable: {reason}")]
    Unavailable {
        /// Why the provider is unavailable.
        reason: String,
    },

    /// The provider throttled the request.
    #[error("Provider rate limited the request")]
    RateLimited {
        /// Suggested wait before the next attempt, if the provider gave one.
        retry_after_ms: Option<u64>,
    },
}

impl ProviderError {
    /// Creates a timeout error for the given elapsed duration.
    #[must_use]
    pub fn timeout(elapsed: Duration) -> Self {
        Self::Timeout {
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates an invalid response error.
    #[must_use]
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Creates a rate limited error.
    #[must_use]
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            retry_after_ms: retry_after.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Returns the stable kind string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Unavailable { .. } => "unavailable",
            Self::RateLimited { .. } => "rate_limited",
        }
    }

    /// Returns true for failures the retry policy may retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::RateLimited { .. })
    }

    /// Returns the provider's suggested wait, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), self.kind().into());
        map.insert("message".to_string(), self.to_string().into());
        map
    }
}

/// Failure reported by an effect tool.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    /// The effect is not allowed (path outside the root, rejected credentials).
    #[error("Permission denied for {tool}: {reason}")]
    PermissionDenied {
        /// Tool identifier.
        tool: String,
        /// Why the effect was refused.
        reason: String,
    },

    /// The effect conflicts with existing state.
    #[error("Conflict in {tool}: {reason}")]
    Conflict {
        /// Tool identifier.
        tool: String,
        /// Description of the conflict.
        reason: String,
    },

    /// The target of the effect does not exist.
    #[error("Not found in {tool}: {reason}")]
    NotFound {
        /// Tool identifier.
        tool: String,
        /// What was missing.
        reason: String,
    },

    /// A temporary failure; the invocation is safe to retry.
    #[error("Transient failure in {tool}: {reason}")]
    Transient {
        /// Tool identifier.
        tool: String,
        /// Description of the failure.
        reason: String,
    },

    /// The invocation arguments are malformed.
    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments {
        /// Tool identifier.
        tool: String,
        /// What was wrong with the arguments.
        reason: String,
    },
}

impl ToolError {
    /// Creates a permission denied error.
    #[must_use]
    pub fn permission_denied(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotFound {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid arguments error.
    #[must_use]
    pub fn invalid_arguments(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Returns the stable kind string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Conflict { .. } => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::Transient { .. } => "transient",
            Self::InvalidArguments { .. } => "invalid_arguments",
        }
    }

    /// Returns true if the invocation may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), self.kind().into());
        map.insert("message".to_string(), self.to_string().into());
        map
    }
}

/// Failure of a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// A declared input was not present in the run context.
    #[error("Missing dependency: output of stage '{missing}' is not available")]
    MissingDependency {
        /// The stage whose output was needed.
        missing: StageName,
    },

    /// A recorded dependency output could not be decoded.
    #[error("Output of stage '{dependency}' could not be decoded: {reason}")]
    InputDecode {
        /// The stage whose output was malformed.
        dependency: StageName,
        /// Decoder message.
        reason: String,
    },

    /// The provider's output did not conform to the stage schema, even
    /// after the corrective retry.
    #[error("Output validation failed after {attempts} attempts: {reason}")]
    ValidationFailed {
        /// Schema violation of the last attempt.
        reason: String,
        /// Invocations made.
        attempts: u32,
    },

    /// Transient provider failures exhausted the retry policy.
    #[error("Provider exhausted after {attempts} attempts: {last_error}")]
    ProviderExhausted {
        /// Invocations made.
        attempts: u32,
        /// The final transient failure.
        last_error: ProviderError,
    },

    /// The provider failed with a non-retryable error.
    #[error("Provider failed: {0}")]
    ProviderFailed(#[source] ProviderError),

    /// A tool invocation failed and the tool policy does not tolerate it.
    #[error("Tool failed: {0}")]
    ToolFailed(#[source] ToolError),

    /// The stage observed cancellation.
    #[error("Stage cancelled: {reason}")]
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },
}

impl StageError {
    /// Returns the stable kind string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingDependency { .. } => "missing_dependency",
            Self::InputDecode { .. } => "input_decode",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::ProviderExhausted { .. } => "provider_exhausted",
            Self::ProviderFailed(_) => "provider_failed",
            Self::ToolFailed(_) => "tool_failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Returns the kind of the innermost cause.
    #[must_use]
    pub const fn root_kind(&self) -> &'static str {
        match self {
            Self::ProviderExhausted { last_error, .. } => last_error.kind(),
            Self::ProviderFailed(e) => e.kind(),
            Self::ToolFailed(e) => e.kind(),
            _ => self.kind(),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), self.kind().into());
        map.insert("root_kind".to_string(), self.root_kind().into());
        map.insert("message".to_string(), self.to_string().into());
        match self {
            Self::MissingDependency { missing } => {
                map.insert("missing".to_string(), missing.as_str().into());
            }
            Self::InputDecode { dependency, .. } => {
                map.insert("dependency".to_string(), dependency.as_str().into());
            }
            Self::ValidationFailed { attempts, .. } | Self::ProviderExhausted { attempts, .. } => {
                map.insert("attempts".to_string(), (*attempts).into());
            }
            _ => {}
        }
        map
    }
}

/// Failure of the research fan-out phase as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FanOutError {
    /// Every research task failed.
    #[error("All {} research queries failed", failures.len())]
    AllFailed {
        /// Per-query failures, ordered by query index.
        failures: Vec<FailedQuery>,
    },

    /// The phase deadline elapsed before any task succeeded.
    #[error("Research phase timed out after {timeout_ms}ms with no successful query")]
    PhaseTimeout {
        /// The phase timeout.
        timeout_ms: u64,
        /// Per-query failures, ordered by query index.
        failures: Vec<FailedQuery>,
    },

    /// The phase observed cancellation.
    #[error("Research phase cancelled: {reason}")]
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },
}

impl FanOutError {
    /// Returns the stable kind string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AllFailed { .. } => "all_failed",
            Self::PhaseTimeout { .. } => "phase_timeout",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Returns the per-query failures, if any were collected.
    #[must_use]
    pub fn failures(&self) -> &[FailedQuery] {
        match self {
            Self::AllFailed { failures } | Self::PhaseTimeout { failures, .. } => failures,
            Self::Cancelled { .. } => &[],
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), self.kind().into());
        map.insert("message".to_string(), self.to_string().into());
        let failures = self.failures();
        if !failures.is_empty() {
            map.insert(
                "failures".to_string(),
                serde_json::to_value(failures).unwrap_or_default(),
            );
        }
        map
    }
}

/// Cause of a stage failure as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageFailure {
    /// A single-call stage failed.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// The fan-out phase failed.
    #[error(transparent)]
    FanOut(#[from] FanOutError),
}

impl StageFailure {
    /// Returns the stable kind string of the wrapped error.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Stage(e) => e.kind(),
            Self::FanOut(e) => e.kind(),
        }
    }

    /// Returns the kind of the innermost cause.
    #[must_use]
    pub const fn root_kind(&self) -> &'static str {
        match self {
            Self::Stage(e) => e.root_kind(),
            Self::FanOut(e) => e.kind(),
        }
    }

    /// Returns true if the failure is a cancellation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Stage(StageError::Cancelled { .. }) | Self::FanOut(FanOutError::Cancelled { .. })
        )
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        match self {
            Self::Stage(e) => e.to_dict(),
            Self::FanOut(e) => e.to_dict(),
        }
    }
}

/// Error raised when a pipeline definition or its configuration is invalid.
#[derive(Debug, Clone, Error)]
#[error("Pipeline validation failed: {message}")]
pub struct PipelineValidationError {
    /// Error message.
    pub message: String,
    /// Stages involved in the error.
    pub stages: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Adds involved stages.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), "validation".into());
        map.insert("message".to_string(), self.message.clone().into());
        map.insert(
            "stages".to_string(),
            serde_json::Value::Array(self.stages.iter().cloned().map(Into::into).collect()),
        );
        map
    }
}

/// Error raised when a stage output cannot be merged into the run context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The stage already has a recorded output.
    #[error("Output for stage '{0}' is already recorded")]
    AlreadyRecorded(StageName),

    /// The stage is not the next stage in pipeline order.
    #[error("Stage '{got}' cannot be recorded before '{expected}'")]
    OutOfOrder {
        /// The next stage in order.
        expected: StageName,
        /// The stage that tried to record.
        got: StageName,
    },

    /// Every stage already has an output.
    #[error("Run already holds outputs for every stage; cannot record '{0}'")]
    RunComplete(StageName),

    /// The output payload does not belong to the stage.
    #[error("Output kind '{kind}' does not belong to stage '{stage}'")]
    WrongKind {
        /// Stage being recorded.
        stage: StageName,
        /// The payload kind that was offered.
        kind: &'static str,
    },
}

/// Failure of a whole pipeline run.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A stage failed and the run was aborted.
    #[error("Stage '{stage}' failed: {cause}")]
    StageFailed {
        /// The stage that failed.
        stage: StageName,
        /// Why it failed.
        cause: StageFailure,
    },

    /// The overall run deadline elapsed.
    #[error("Run deadline of {deadline_ms}ms exceeded during stage '{stage}'")]
    Deadline {
        /// The stage in flight when the deadline fired.
        stage: StageName,
        /// The configured deadline.
        deadline_ms: u64,
    },

    /// The run was cancelled by the caller.
    #[error("Pipeline cancelled: {reason}")]
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },

    /// The pipeline definition is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// The user input was rejected before any stage ran.
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// Why the input was rejected.
        reason: String,
    },

    /// A stage output could not be recorded.
    #[error("{0}")]
    Context(#[from] ContextError),
}

impl PipelineError {
    /// Returns the stable kind string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StageFailed { .. } => "stage_failed",
            Self::Deadline { .. } => "deadline",
            Self::Cancelled { .. } => "cancelled",
            Self::Validation(_) => "validation",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Context(_) => "context",
        }
    }

    /// Returns the failing stage, if the failure is attributable to one.
    #[must_use]
    pub const fn stage(&self) -> Option<StageName> {
        match self {
            Self::StageFailed { stage, .. } | Self::Deadline { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Returns the kind of the innermost cause.
    #[must_use]
    pub const fn root_kind(&self) -> &'static str {
        match self {
            Self::StageFailed { cause, .. } => cause.root_kind(),
            _ => self.kind(),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = match self {
            Self::StageFailed { cause, .. } => {
                let mut inner = HashMap::new();
                inner.insert(
                    "cause".to_string(),
                    serde_json::to_value(cause.to_dict()).unwrap_or_default(),
                );
                inner
            }
            Self::Validation(e) => e.to_dict(),
            _ => HashMap::new(),
        };
        map.insert("kind".to_string(), self.kind().into());
        map.insert("root_kind".to_string(), self.root_kind().into());
        map.insert("message".to_string(), self.to_string().into());
        if let Some(stage) = self.stage() {
            map.insert("stage".to_string(), stage.as_str().into());
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        assert!(ProviderError::timeout(Duration::from_secs(1)).is_transient());
        assert!(ProviderError::rate_limited(None).is_transient());
        assert!(!ProviderError::invalid_response("bad").is_transient());
        assert!(!ProviderError::unavailable("down").is_transient());
    }

    #[test]
    fn test_provider_error_retry_after() {
        let err = ProviderError::rate_limited(Some(Duration::from_millis(250)));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
        assert_eq!(ProviderError::rate_limited(None).retry_after(), None);
    }

    #[test]
    fn test_provider_error_serializes_with_kind_tag() {
        let value = serde_json::to_value(ProviderError::unavailable("down")).unwrap();
        assert_eq!(value["kind"], "unavailable");
        assert_eq!(value["reason"], "down");
    }

    #[test]
    fn test_tool_error_retryable() {
        assert!(ToolError::transient("vcs.commit", "lock").is_retryable());
        assert!(!ToolError::conflict("remote.publish", "rejected").is_retryable());
        assert_eq!(ToolError::not_found("file.write", "x").kind(), "not_found");
    }

    #[test]
    fn test_stage_error_root_kind() {
        let err = StageError::ProviderExhausted {
            attempts: 3,
            last_error: ProviderError::timeout(Duration::from_secs(60)),
        };
        assert_eq!(err.kind(), "provider_exhausted");
        assert_eq!(err.root_kind(), "timeout");

        let err = StageError::MissingDependency {
            missing: StageName::Design,
        };
        assert_eq!(err.root_kind(), "missing_dependency");
        assert_eq!(err.to_dict()["missing"], "design");
    }

    #[test]
    fn test_fan_out_error_failures() {
        let failures = vec![FailedQuery {
            index: 0,
            query: "q".to_string(),
            error_kind: "timeout".to_string(),
            message: "slow".to_string(),
            attempts: 3,
        }];
        let err = FanOutError::AllFailed {
            failures: failures.clone(),
        };
        assert_eq!(err.failures(), failures.as_slice());
        assert!(err.to_string().contains("All 1"));
        assert!(FanOutError::Cancelled {
            reason: "stop".into()
        }
        .failures()
        .is_empty());
    }

    #[test]
    fn test_pipeline_error_to_dict() {
        let err = PipelineError::StageFailed {
            stage: StageName::Research,
            cause: FanOutError::AllFailed { failures: vec![] }.into(),
        };
        let dict = err.to_dict();
        assert_eq!(dict["kind"], "stage_failed");
        assert_eq!(dict["stage"], "research");
        assert_eq!(dict["root_kind"], "all_failed");
        assert_eq!(err.stage(), Some(StageName::Research));
    }

    #[test]
    fn test_stage_failure_cancellation() {
        let failure: StageFailure = StageError::Cancelled {
            reason: "stop".into(),
        }
        .into();
        assert!(failure.is_cancellation());
        let failure: StageFailure = StageError::ProviderFailed(ProviderError::unavailable("x")).into();
        assert!(!failure.is_cancellation());
        assert_eq!(failure.root_kind(), "unavailable");
    }
}
