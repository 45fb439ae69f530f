//! Sequential stages.
//!
//! A stage wraps one capability provider with its dependency check, output
//! schema, retry policy and per-attempt timeout. The research slot is run
//! by the fan-out coordinator instead.

mod attempt;
mod retry;

pub use attempt::{corrective_instruction, AttemptError, AttemptRunner};
pub use retry::{
    decide_for_provider, should_retry, with_retry, BackoffStrategy, JitterStrategy, RetryConfig,
    RetryDecision, RetryState,
};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cancellation::CancellationToken;
use crate::config::RunConfig;
use crate::context::RunContext;
use crate::core::{StageName, StageOutput};
use crate::errors::StageError;
use crate::events::RunEvents;
use crate::providers::{CapabilityProvider, ProviderRequest, ProviderSession};
use crate::tools::{first_unrecovered_error, ToolEnvironment};

/// Retry and timeout policy of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePolicy {
    /// Retry policy for transient provider failures.
    pub retry: RetryConfig,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Whether a failure skips the stage instead of failing the run.
    pub optional: bool,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(60),
            optional: false,
        }
    }
}

impl StagePolicy {
    /// Derives the policy of `stage` from a run configuration.
    #[must_use]
    pub fn from_config(config: &RunConfig, stage: StageName) -> Self {
        Self {
            retry: config.retry.clone(),
            timeout: config.stage_timeout(),
            optional: config.is_optional(stage),
        }
    }
}

/// Per-run handles shared by every stage.
#[derive(Clone)]
pub struct StageEnv {
    /// Process-wide provider configuration.
    pub session: Arc<ProviderSession>,
    /// The run's cancellation token.
    pub cancel: Arc<CancellationToken>,
    /// Event emitter bound to the run.
    pub events: RunEvents,
    /// Tool environment for the final stage.
    pub tools: Option<Arc<ToolEnvironment>>,
}

impl std::fmt::Debug for StageEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageEnv")
            .field("run_id", &self.events.run_id())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("tools", &self.tools.is_some())
            .finish_non_exhaustive()
    }
}

/// A validated stage output and the provider calls it took.
#[derive(Debug, Clone, PartialEq)]
pub struct StageExecution {
    /// The validated output.
    pub output: StageOutput,
    /// Provider invocations made.
    pub attempts: u32,
}

/// One sequential stage.
#[derive(Clone)]
pub struct StageDefinition {
    name: StageName,
    provider: Arc<dyn CapabilityProvider>,
    policy: StagePolicy,
}

impl StageDefinition {
    /// Creates a stage.
    #[must_use]
    pub fn new(name: StageName, provider: Arc<dyn CapabilityProvider>, policy: StagePolicy) -> Self {
        Self {
            name,
            provider,
            policy,
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub const fn name(&self) -> StageName {
        self.name
    }

    /// Returns the stage policy.
    #[must_use]
    pub const fn policy(&self) -> &StagePolicy {
        &self.policy
    }

    /// Runs the stage against the recorded outputs of `ctx`.
    ///
    /// Fails with `MissingDependency` before calling the provider if a
    /// declared input is absent. The context is only read.
    pub async fn run(&self, env: &StageEnv, ctx: &RunContext) -> Result<StageExecution, StageError> {
        let inputs = ctx.inputs_for(self.name)?;
        let tools = if self.name.uses_tools() {
            env.tools.clone()
        } else {
            None
        };
        let request = ProviderRequest {
            run_id: ctx.run_id(),
            stage: self.name,
            attempt: 0,
            user_input: Arc::from(ctx.user_input()),
            inputs,
            corrective_instruction: None,
            query: None,
            session: Arc::clone(&env.session),
            tools: tools.clone(),
            cancel: Arc::clone(&env.cancel),
        };

        debug!(
            run_id = %ctx.run_id(),
            stage = %self.name,
            provider = self.provider.name(),
            "Invoking provider"
        );
        let runner = AttemptRunner::new(
            self.provider.as_ref(),
            &self.policy.retry,
            self.policy.timeout,
            &env.events,
            &env.cancel,
        );
        let stage = self.name;
        let result = runner
            .run(request, |raw| StageOutput::from_provider(stage, raw))
            .await;

        let (output, attempts) = match (result, tools) {
            (Ok((output, attempts)), Some(tools)) => (collect_tool_outcomes(output, &tools)?, attempts),
            (Ok(done), None) => done,
            (Err(e), Some(tools)) => {
                tools.take_outcomes();
                return Err(e.into());
            }
            (Err(e), None) => return Err(e.into()),
        };

        info!(
            run_id = %ctx.run_id(),
            stage = %self.name,
            attempt = attempts,
            "Stage output validated"
        );
        Ok(StageExecution { output, attempts })
    }
}

/// Attaches the tool outcome log to a generated file set.
fn collect_tool_outcomes(
    output: StageOutput,
    tools: &ToolEnvironment,
) -> Result<StageOutput, StageError> {
    let outcomes = tools.take_outcomes();
    let StageOutput::Files(mut files) = output else {
        return Ok(output);
    };
    if !outcomes.is_empty() {
        files.tool_outcomes = outcomes;
    }
    if tools.policy().fail_on_error {
        if let Some(err) = first_unrecovered_error(&files.tool_outcomes) {
            return Err(StageError::ToolFailed(err));
        }
    }
    Ok(StageOutput::Files(files))
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("policy", &self.policy)
            .finish()
    }
}
