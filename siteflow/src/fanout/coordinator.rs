//! Parallel research phase.

use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::task::ResearchTask;
use crate::cancellation::{CancellationToken, TaskGroup};
use crate::config::RunConfig;
use crate::context::RunContext;
use crate::core::{Finding, QuestionList, ResearchFindings, StageName, StageOutput};
use crate::errors::{FanOutError, StageFailure};
use crate::events::RunEvents;
use crate::providers::{CapabilityProvider, ProviderRequest, ProviderSession, ResearchQuery};
use crate::stages::{AttemptError, AttemptRunner, RetryConfig, StageEnv, StageExecution};
use crate::utils::millis;

/// Settings of the research phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutPolicy {
    /// Maximum tasks running at once.
    pub max_concurrency: usize,
    /// Per-attempt timeout of each task.
    pub task_timeout: Duration,
    /// Deadline for the whole phase, retries included.
    pub phase_timeout: Duration,
    /// Per-task retry policy.
    pub retry: RetryConfig,
    /// Dispatch failed queries once more before merging.
    pub retry_failed_queries: bool,
}

impl Default for FanOutPolicy {
    fn default() -> Self {
        Self::from_config(&RunConfig::default())
    }
}

impl FanOutPolicy {
    /// Derives the phase policy from a run configuration.
    #[must_use]
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            task_timeout: config.stage_timeout(),
            phase_timeout: config.phase_timeout(),
            retry: config.retry.clone(),
            retry_failed_queries: config.retry_failed_queries,
        }
    }
}

struct TaskReport {
    result: Result<Finding, AttemptError>,
    attempts: u32,
}

/// State shared by the tasks of one round.
struct RoundShared {
    provider: Arc<dyn CapabilityProvider>,
    retry: RetryConfig,
    timeout: Duration,
    events: RunEvents,
    session: Arc<ProviderSession>,
    user_input: Arc<str>,
    run_id: uuid::Uuid,
    inputs: crate::context::StageInputs,
}

impl RoundShared {
    async fn research(
        &self,
        query: ResearchQuery,
        token: Arc<CancellationToken>,
        counter: Arc<AtomicU32>,
    ) -> TaskReport {
        let request = ProviderRequest {
            run_id: self.run_id,
            stage: StageName::Research,
            attempt: 0,
            user_input: Arc::clone(&self.user_input),
            inputs: self.inputs.clone(),
            corrective_instruction: None,
            query: Some(query),
            session: Arc::clone(&self.session),
            tools: None,
            cancel: Arc::clone(&token),
        };
        let runner = AttemptRunner::new(
            self.provider.as_ref(),
            &self.retry,
            self.timeout,
            &self.events,
            &token,
        )
        .with_counter(counter);
        match runner.run(request, crate::core::schema::parse::<Finding>).await {
            Ok((finding, attempts)) => TaskReport {
                result: Ok(finding),
                attempts,
            },
            Err(e) => TaskReport {
                attempts: e.attempts(),
                result: Err(e),
            },
        }
    }
}

/// Runs one research task per generated question and merges the results.
///
/// Tasks run concurrently up to the policy's ceiling and write only to
/// their own slots. The merge into the run context happens after every
/// slot is terminal. Some failures yield `partial = true`; no successes
/// fail the phase.
#[derive(Clone)]
pub struct FanOutCoordinator {
    provider: Arc<dyn CapabilityProvider>,
    policy: FanOutPolicy,
}

impl FanOutCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(provider: Arc<dyn CapabilityProvider>, policy: FanOutPolicy) -> Self {
        Self { provider, policy }
    }

    /// Returns the phase policy.
    #[must_use]
    pub const fn policy(&self) -> &FanOutPolicy {
        &self.policy
    }

    /// Runs the research phase against the recorded questions of `ctx`.
    pub async fn run(
        &self,
        env: &StageEnv,
        ctx: &RunContext,
    ) -> Result<StageExecution, StageFailure> {
        let inputs = ctx.inputs_for(StageName::Research)?;
        let questions = match ctx.get(StageName::QuestionGeneration) {
            Some(StageOutput::Skipped { reason }) => {
                warn!(run_id = %ctx.run_id(), reason = %reason, "Question generation was skipped");
                Vec::new()
            }
            _ => {
                inputs
                    .decode::<QuestionList>(StageName::QuestionGeneration)?
                    .questions
            }
        };

        let mut tasks: Vec<ResearchTask> = questions
            .iter()
            .enumerate()
            .map(|(i, q)| ResearchTask::new(i, q.clone()))
            .collect();
        if tasks.is_empty() {
            warn!(run_id = %ctx.run_id(), "No research queries to dispatch");
            return Err(FanOutError::AllFailed { failures: vec![] }.into());
        }

        let shared = Arc::new(RoundShared {
            provider: Arc::clone(&self.provider),
            retry: self.policy.retry.clone(),
            timeout: self.policy.task_timeout,
            events: env.events.clone(),
            session: Arc::clone(&env.session),
            user_input: Arc::from(ctx.user_input()),
            run_id: ctx.run_id(),
            inputs,
        });
        let deadline = Instant::now() + self.policy.phase_timeout;
        let mut total_attempts = 0;
        let mut timed_out = false;
        let mut rounds = 1;

        let all: Vec<usize> = (0..tasks.len()).collect();
        let (round, round_timed_out) = self
            .run_round(&shared, env, &mut tasks, &all, deadline)
            .await?;
        total_attempts += round;
        timed_out |= round_timed_out;

        if self.policy.retry_failed_queries && !timed_out {
            let failed: Vec<usize> = tasks
                .iter()
                .filter(|t| t.failure().is_some())
                .map(ResearchTask::index)
                .collect();
            if !failed.is_empty() {
                info!(
                    run_id = %ctx.run_id(),
                    failed = failed.len(),
                    "Retrying failed research queries"
                );
                rounds += 1;
                for &i in &failed {
                    tasks[i] = ResearchTask::new(i, questions[i].clone());
                }
                let (round, round_timed_out) =
                    self.run_round(&shared, env, &mut tasks, &failed, deadline).await?;
                total_attempts += round;
                timed_out |= round_timed_out;
            }
        }

        let findings: Vec<Finding> = tasks
            .iter()
            .filter_map(ResearchTask::finding)
            .cloned()
            .collect();
        let failed: Vec<_> = tasks.iter().filter_map(ResearchTask::failure).cloned().collect();

        env.events.emit(
            "fanout.completed",
            json!({
                "succeeded": findings.len(),
                "failed": failed.len(),
                "partial": !failed.is_empty(),
                "rounds": rounds,
                "timed_out": timed_out,
            }),
        );

        if findings.is_empty() {
            let err = if timed_out {
                FanOutError::PhaseTimeout {
                    timeout_ms: millis(self.policy.phase_timeout),
                    failures: failed,
                }
            } else {
                FanOutError::AllFailed { failures: failed }
            };
            return Err(err.into());
        }

        info!(
            run_id = %ctx.run_id(),
            succeeded = findings.len(),
            failed = failed.len(),
            "Research phase merged"
        );
        Ok(StageExecution {
            output: StageOutput::Research(ResearchFindings {
                partial: !failed.is_empty(),
                findings,
                failed,
            }),
            attempts: total_attempts,
        })
    }

    /// Dispatches `indices` and settles their slots.
    ///
    /// Returns the provider calls made and whether the deadline elapsed.
    async fn run_round(
        &self,
        shared: &Arc<RoundShared>,
        env: &StageEnv,
        tasks: &mut [ResearchTask],
        indices: &[usize],
        deadline: Instant,
    ) -> Result<(u32, bool), FanOutError> {
        let mut group: TaskGroup<TaskReport> =
            TaskGroup::new(&env.cancel, self.policy.max_concurrency.min(indices.len()));
        let mut counters = Vec::with_capacity(indices.len());

        for &index in indices {
            let query = ResearchQuery {
                index,
                text: tasks[index].query().to_string(),
            };
            let counter = Arc::new(AtomicU32::new(0));
            counters.push(Arc::clone(&counter));
            let shared = Arc::clone(shared);
            group.spawn(move |token| async move { shared.research(query, token, counter).await });
        }

        let outcome = group.join_all(Some(deadline)).await;
        if env.cancel.is_cancelled() || outcome.cancelled() {
            return Err(FanOutError::Cancelled {
                reason: env
                    .cancel
                    .reason()
                    .unwrap_or_else(|| "research phase cancelled".to_string()),
            });
        }

        let timed_out = outcome.deadline_elapsed();
        let mut attempts = 0;
        for (task_id, report) in outcome.completed {
            let task = &mut tasks[indices[task_id]];
            attempts += report.attempts;
            match report.result {
                Ok(finding) => {
                    task.succeed(finding, report.attempts);
                    env.events.emit(
                        "fanout.task_completed",
                        json!({
                            "index": task.index(),
                            "query": task.query(),
                            "attempts": report.attempts,
                        }),
                    );
                }
                Err(e) => {
                    self.settle_failure(env, task, e.root_kind(), &e.message(), report.attempts);
                }
            }
        }

        for task_id in outcome.unfinished {
            let made = counters[task_id].load(Ordering::SeqCst);
            attempts += made;
            let task = &mut tasks[indices[task_id]];
            if timed_out {
                let message = format!(
                    "research phase timed out after {}ms",
                    millis(self.policy.phase_timeout)
                );
                self.settle_failure(env, task, "timeout", &message, made);
            } else {
                self.settle_failure(env, task, "panicked", "research task panicked", made);
            }
        }

        Ok((attempts, timed_out))
    }

    fn settle_failure(
        &self,
        env: &StageEnv,
        task: &mut ResearchTask,
        error_kind: &str,
        message: &str,
        attempts: u32,
    ) {
        if !task.fail(error_kind, message, attempts) {
            return;
        }
        warn!(
            run_id = %env.events.run_id(),
            provider = self.provider.name(),
            query_index = task.index(),
            attempt = attempts,
            error = %message,
            "Research query failed"
        );
        env.events.emit(
            "fanout.task_failed",
            json!({
                "index": task.index(),
                "query": task.query(),
                "error_kind": error_kind,
                "message": message,
                "attempts": attempts,
            }),
        );
    }
}

impl std::fmt::Debug for FanOutCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutCoordinator")
            .field("provider", &self.provider.name())
            .field("policy", &self.policy)
            .finish()
    }
}
