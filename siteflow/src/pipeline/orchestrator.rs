//! Sequential pipeline execution.

use futures::future::BoxFuture;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn, Instrument};

use crate::cancellation::CancellationToken;
use crate::config::RunConfig;
use crate::context::RunContext;
use crate::core::{FinalArtifact, StageName, StageOutput};
use crate::errors::{PipelineError, StageFailure};
use crate::events::{get_event_sink, EventSink, RunEvents};
use crate::fanout::FanOutCoordinator;
use crate::providers::ProviderSession;
use crate::stages::{StageDefinition, StageEnv, StageExecution};
use crate::telemetry::{run_span, stage_span};
use crate::tools::{InMemoryIdempotencyStore, ToolEnvironment, ToolRegistry};
use crate::utils::millis;

/// How a stage ended, as seen by the orchestrator.
enum Driven {
    Done(Result<StageExecution, StageFailure>),
    Deadline,
    Cancelled(String),
}

/// A validated, ready-to-run website generation pipeline.
///
/// Built with [`PipelineBuilder`](super::PipelineBuilder). One pipeline can
/// serve many runs. Each run gets its own context, token, idempotency store
/// and tool log.
pub struct Pipeline {
    pub(super) stages: BTreeMap<StageName, StageDefinition>,
    pub(super) research: FanOutCoordinator,
    pub(super) config: RunConfig,
    pub(super) session: Arc<ProviderSession>,
    pub(super) tools: Arc<ToolRegistry>,
    pub(super) sink: Option<Arc<dyn EventSink>>,
}

impl Pipeline {
    /// Returns the run configuration.
    #[must_use]
    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Returns the shared provider session.
    #[must_use]
    pub fn session(&self) -> &ProviderSession {
        &self.session
    }

    /// Returns the registered tools.
    #[must_use]
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Runs every stage for `user_input`.
    pub async fn execute(
        &self,
        user_input: impl Into<String>,
    ) -> Result<FinalArtifact, PipelineError> {
        let mut ctx = RunContext::new(user_input);
        self.execute_with(&mut ctx, Arc::new(CancellationToken::new()))
            .await
    }

    /// Runs the remaining stages of `ctx` under `cancel`.
    ///
    /// Stages already recorded in `ctx` are not run again. On failure the
    /// context keeps every output recorded before the failing stage and its
    /// status is `Failed`.
    pub async fn execute_with(
        &self,
        ctx: &mut RunContext,
        cancel: Arc<CancellationToken>,
    ) -> Result<FinalArtifact, PipelineError> {
        let span = run_span(ctx.run_id());
        self.run(ctx, cancel).instrument(span).await
    }

    async fn run(
        &self,
        ctx: &mut RunContext,
        cancel: Arc<CancellationToken>,
    ) -> Result<FinalArtifact, PipelineError> {
        let events = RunEvents::new(self.sink.clone().unwrap_or_else(get_event_sink), ctx.run_id());

        if ctx.user_input().trim().is_empty() {
            let reason = "user input must not be empty".to_string();
            ctx.mark_failed(None, "invalid_input", reason.clone());
            events.emit("pipeline.failed", json!({"kind": "invalid_input", "error": reason}));
            return Err(PipelineError::InvalidInput { reason });
        }

        let run_token = cancel.child();
        let deadline = self
            .config
            .run_deadline()
            .map(|d| tokio::time::Instant::now() + d);
        let tools = Arc::new(ToolEnvironment::new(
            Arc::clone(&self.tools),
            Arc::new(InMemoryIdempotencyStore::new()),
            self.config.tool.clone(),
            Arc::clone(&self.session),
            events.clone(),
        ));
        let env = StageEnv {
            session: Arc::clone(&self.session),
            cancel: Arc::clone(&run_token),
            events: events.clone(),
            tools: Some(tools),
        };

        let start = Instant::now();
        ctx.mark_running();
        info!(run_id = %ctx.run_id(), "Pipeline started");
        events.emit(
            "pipeline.started",
            json!({
                "user_input": ctx.user_input(),
                "stages": StageName::ORDER,
                "first_stage": ctx.next_stage(),
            }),
        );

        while let Some(stage) = ctx.next_stage() {
            if run_token.is_cancelled() {
                let reason = run_token
                    .reason()
                    .unwrap_or_else(|| "cancelled".to_string());
                return Err(self.cancelled(ctx, &events, stage, reason));
            }

            events.emit("stage.started", json!({"stage": stage}));
            let stage_start = Instant::now();

            let driven = {
                let fut = self
                    .run_stage(stage, &env, ctx)
                    .instrument(stage_span(ctx.run_id(), stage));
                drive(fut, &run_token, deadline).await
            };
            let stage_duration_ms = stage_start.elapsed().as_secs_f64() * 1000.0;

            let failure = match driven {
                Driven::Done(Ok(exec)) => {
                    let output = self.limit_questions(ctx, stage, exec.output);
                    let partial = output.as_research().map(|r| r.partial);
                    let kind = output.kind();
                    if let Err(e) = ctx.record(stage, output, exec.attempts) {
                        error!(
                            run_id = %ctx.run_id(),
                            stage = %stage,
                            error = %e,
                            "Failed to record stage output"
                        );
                        ctx.mark_failed(Some(stage), "context", e.to_string());
                        events.emit(
                            "pipeline.failed",
                            json!({"stage": stage, "kind": "context", "error": e.to_string()}),
                        );
                        return Err(e.into());
                    }
                    info!(
                        run_id = %ctx.run_id(),
                        stage = %stage,
                        attempt = exec.attempts,
                        duration_ms = stage_duration_ms,
                        "Stage completed"
                    );
                    events.emit(
                        "stage.completed",
                        json!({
                            "stage": stage,
                            "kind": kind,
                            "attempts": exec.attempts,
                            "partial": partial,
                            "duration_ms": stage_duration_ms,
                        }),
                    );
                    continue;
                }
                Driven::Done(Err(failure)) => failure,
                Driven::Deadline => {
                    return Err(self.deadline_exceeded(ctx, &events, &run_token, stage));
                }
                Driven::Cancelled(reason) => {
                    return Err(self.cancelled(ctx, &events, stage, reason));
                }
            };

            if failure.is_cancellation() && run_token.is_cancelled() {
                let reason = run_token
                    .reason()
                    .unwrap_or_else(|| failure.to_string());
                return Err(self.cancelled(ctx, &events, stage, reason));
            }

            events.emit(
                "stage.failed",
                json!({
                    "stage": stage,
                    "error": failure.to_dict(),
                    "optional": self.config.is_optional(stage),
                    "duration_ms": stage_duration_ms,
                }),
            );

            if self.config.is_optional(stage) {
                warn!(
                    run_id = %ctx.run_id(),
                    stage = %stage,
                    error = %failure,
                    "Optional stage failed, recording as skipped"
                );
                let reason = failure.to_string();
                ctx.record(stage, StageOutput::Skipped { reason: reason.clone() }, 0)?;
                events.emit("stage.skipped", json!({"stage": stage, "reason": reason}));
                continue;
            }

            error!(
                run_id = %ctx.run_id(),
                stage = %stage,
                error = %failure,
                "Stage failed, aborting run"
            );
            ctx.mark_failed(Some(stage), failure.root_kind(), failure.to_string());
            events.emit(
                "pipeline.failed",
                json!({
                    "stage": stage,
                    "kind": failure.kind(),
                    "root_kind": failure.root_kind(),
                    "error": failure.to_string(),
                    "duration_ms": start.elapsed().as_secs_f64() * 1000.0,
                }),
            );
            return Err(PipelineError::StageFailed {
                stage,
                cause: failure,
            });
        }

        ctx.mark_completed();
        let artifact = FinalArtifact::from_context(ctx);
        info!(
            run_id = %ctx.run_id(),
            files = artifact.files.len(),
            research_partial = artifact.research_partial,
            "Pipeline completed"
        );
        events.emit(
            "pipeline.completed",
            json!({
                "files": artifact.files.len(),
                "research_partial": artifact.research_partial,
                "skipped_stages": artifact.skipped_stages,
                "duration_ms": start.elapsed().as_secs_f64() * 1000.0,
            }),
        );
        Ok(artifact)
    }

    fn run_stage<'a>(
        &'a self,
        stage: StageName,
        env: &'a StageEnv,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<StageExecution, StageFailure>> {
        if stage.is_fan_out() {
            return Box::pin(self.research.run(env, ctx));
        }
        match self.stages.get(&stage) {
            Some(definition) => {
                Box::pin(async move { definition.run(env, ctx).await.map_err(StageFailure::from) })
            }
            None => Box::pin(async move {
                Err(StageFailure::from(crate::errors::StageError::ProviderFailed(
                    crate::errors::ProviderError::unavailable(format!(
                        "no provider registered for stage '{stage}'"
                    )),
                )))
            }),
        }
    }

    /// Truncates the question list to `max_questions`.
    fn limit_questions(
        &self,
        ctx: &RunContext,
        stage: StageName,
        output: StageOutput,
    ) -> StageOutput {
        let max = self.config.max_questions;
        match output {
            StageOutput::Questions(mut list)
                if stage == StageName::QuestionGeneration && list.questions.len() > max =>
            {
                warn!(
                    run_id = %ctx.run_id(),
                    generated = list.questions.len(),
                    max_questions = max,
                    "Truncating generated questions"
                );
                list.questions.truncate(max);
                StageOutput::Questions(list)
            }
            other => other,
        }
    }

    fn cancelled(
        &self,
        ctx: &mut RunContext,
        events: &RunEvents,
        stage: StageName,
        reason: String,
    ) -> PipelineError {
        warn!(run_id = %ctx.run_id(), stage = %stage, reason = %reason, "Pipeline cancelled");
        ctx.mark_failed(Some(stage), "cancelled", reason.clone());
        events.emit("pipeline.cancelled", json!({"stage": stage, "reason": reason}));
        PipelineError::Cancelled { reason }
    }

    fn deadline_exceeded(
        &self,
        ctx: &mut RunContext,
        events: &RunEvents,
        run_token: &CancellationToken,
        stage: StageName,
    ) -> PipelineError {
        let deadline_ms = self.config.run_deadline().map_or(0, millis);
        run_token.cancel("run deadline exceeded");
        error!(run_id = %ctx.run_id(), stage = %stage, deadline_ms, "Run deadline exceeded");
        ctx.mark_failed(
            Some(stage),
            "deadline",
            format!("run deadline of {deadline_ms}ms exceeded"),
        );
        events.emit(
            "pipeline.failed",
            json!({"stage": stage, "kind": "deadline", "deadline_ms": deadline_ms}),
        );
        PipelineError::Deadline { stage, deadline_ms }
    }
}

/// Awaits a stage future against the run token and deadline.
async fn drive<F>(
    fut: F,
    token: &CancellationToken,
    deadline: Option<tokio::time::Instant>,
) -> Driven
where
    F: std::future::Future<Output = Result<StageExecution, StageFailure>>,
{
    let bounded = async {
        match deadline {
            Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
            None => Some(fut.await),
        }
    };
    tokio::select! {
        biased;
        () = token.cancelled() => Driven::Cancelled(
            token.reason().unwrap_or_else(|| "cancelled".to_string())
        ),
        result = bounded => result.map_or(Driven::Deadline, Driven::Done),
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .field("research", &self.research)
            .field("config", &self.config)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}
