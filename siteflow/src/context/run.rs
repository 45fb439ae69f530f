//! The accumulating record of one pipeline run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::inputs::StageInputs;
use crate::core::{RunStatus, StageName, StageOutput};
use crate::errors::{ContextError, StageError};

/// One recorded stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage that produced the output.
    pub stage: StageName,
    /// The validated output.
    pub output: StageOutput,
    /// Provider invocations the stage needed.
    pub attempts: u32,
    /// When the output was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Why a run ended in [`RunStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// The stage in flight, if the failure is attributable to one.
    pub stage: Option<StageName>,
    /// Root error kind.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// State of one pipeline execution.
///
/// Outputs are recorded in pipeline order and never overwritten, so the
/// recorded stages are always a prefix of [`StageName::ORDER`]. Only the
/// orchestrator holds a mutable reference; stages read copies of their
/// inputs through [`RunContext::inputs_for`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    run_id: Uuid,
    user_input: String,
    stage_outputs: Vec<StageRecord>,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    failure: Option<FailureRecord>,
}

impl RunContext {
    /// Creates a pending run with a fresh time-ordered run id.
    #[must_use]
    pub fn new(user_input: impl Into<String>) -> Self {
        Self::with_run_id(Uuid::now_v7(), user_input)
    }

    /// Creates a pending run with a caller-supplied run id.
    #[must_use]
    pub fn with_run_id(run_id: Uuid, user_input: impl Into<String>) -> Self {
        Self {
            run_id,
            user_input: user_input.into(),
            stage_outputs: Vec::new(),
            status: RunStatus::Pending,
            started_at: None,
            ended_at: None,
            failure: None,
        }
    }

    /// Returns the run id.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the user's description.
    #[must_use]
    pub fn user_input(&self) -> &str {
        &self.user_input
    }

    /// Returns the run status.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Returns when the run started.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Returns when the run ended.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Returns the failure record of a failed run.
    #[must_use]
    pub const fn failure(&self) -> Option<&FailureRecord> {
        self.failure.as_ref()
    }

    /// Returns the recorded outputs in pipeline order.
    #[must_use]
    pub fn records(&self) -> &[StageRecord] {
        &self.stage_outputs
    }

    /// Returns the stages recorded so far, in order.
    #[must_use]
    pub fn completed_stages(&self) -> Vec<StageName> {
        self.stage_outputs.iter().map(|r| r.stage).collect()
    }

    /// Returns true if `stage` has a recorded output.
    #[must_use]
    pub fn contains(&self, stage: StageName) -> bool {
        self.stage_outputs.iter().any(|r| r.stage == stage)
    }

    /// Returns the output recorded for `stage`.
    #[must_use]
    pub fn get(&self, stage: StageName) -> Option<&StageOutput> {
        self.stage_outputs
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.output)
    }

    /// Returns the next stage expected to record, if any.
    #[must_use]
    pub fn next_stage(&self) -> Option<StageName> {
        StageName::ORDER.get(self.stage_outputs.len()).copied()
    }

    /// Builds the read-only inputs of `stage`.
    ///
    /// Every declared dependency must already be recorded.
    pub fn inputs_for(&self, stage: StageName) -> Result<StageInputs, StageError> {
        let mut inputs = StageInputs::new(stage);
        for dep in stage.requires() {
            let output = self
                .get(*dep)
                .ok_or(StageError::MissingDependency { missing: *dep })?;
            inputs.insert(*dep, output.payload_json());
        }
        Ok(inputs)
    }

    /// Records the output of the next stage in order.
    pub fn record(
        &mut self,
        stage: StageName,
        output: StageOutput,
        attempts: u32,
    ) -> Result<(), ContextError> {
        if self.contains(stage) {
            return Err(ContextError::AlreadyRecorded(stage));
        }
        let expected = self.next_stage().ok_or(ContextError::RunComplete(stage))?;
        if expected != stage {
            return Err(ContextError::OutOfOrder {
                expected,
                got: stage,
            });
        }
        if !output.belongs_to(stage) {
            return Err(ContextError::WrongKind {
                stage,
                kind: output.kind(),
            });
        }
        self.stage_outputs.push(StageRecord {
            stage,
            output,
            attempts,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    /// Marks the run as started.
    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        self.ended_at = None;
        self.failure = None;
    }

    /// Marks the run as completed.
    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.ended_at = Some(Utc::now());
    }

    /// Marks the run as failed and records why.
    pub fn mark_failed(
        &mut self,
        stage: Option<StageName>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.status = RunStatus::Failed;
        self.ended_at = Some(Utc::now());
        self.failure = Some(FailureRecord {
            stage,
            kind: kind.into(),
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{QuestionList, StageOutput};
    use pretty_assertions::assert_eq;

    fn questions() -> StageOutput {
        StageOutput::Questions(QuestionList {
            questions: vec!["Who visits the site?".into()],
        })
    }

    #[test]
    fn test_new_context_is_pending() {
        let ctx = RunContext::new("a portfolio site");
        assert_eq!(ctx.status(), RunStatus::Pending);
        assert_eq!(ctx.user_input(), "a portfolio site");
        assert!(ctx.records().is_empty());
        assert_eq!(ctx.next_stage(), Some(StageName::QuestionGeneration));
    }

    #[test]
    fn test_record_in_order() {
        let mut ctx = RunContext::new("site");
        ctx.record(StageName::QuestionGeneration, questions(), 1).unwrap();
        assert!(ctx.contains(StageName::QuestionGeneration));
        assert_eq!(ctx.completed_stages(), vec![StageName::QuestionGeneration]);
        assert_eq!(ctx.next_stage(), Some(StageName::Research));
    }

    #[test]
    fn test_record_never_overwrites() {
        let mut ctx = RunContext::new("site");
        ctx.record(StageName::QuestionGeneration, questions(), 1).unwrap();
        let err = ctx
            .record(StageName::QuestionGeneration, questions(), 1)
            .unwrap_err();
        assert_eq!(err, ContextError::AlreadyRecorded(StageName::QuestionGeneration));
        assert_eq!(ctx.records().len(), 1);
    }

    #[test]
    fn test_record_rejects_gaps() {
        let mut ctx = RunContext::new("site");
        let err = ctx
            .record(
                StageName::Design,
                StageOutput::Skipped {
                    reason: "x".into(),
                },
                1,
            )
            .unwrap_err();
        assert_eq!(
            err,
            ContextError::OutOfOrder {
                expected: StageName::QuestionGeneration,
                got: StageName::Design
            }
        );
    }

    #[test]
    fn test_record_rejects_wrong_payload() {
        let mut ctx = RunContext::new("site");
        ctx.record(StageName::QuestionGeneration, questions(), 1).unwrap();
        let err = ctx.record(StageName::Research, questions(), 1).unwrap_err();
        assert!(matches!(err, ContextError::WrongKind { .. }));
    }

    #[test]
    fn test_inputs_for_missing_dependency() {
        let ctx = RunContext::new("site");
        let err = ctx.inputs_for(StageName::Research).unwrap_err();
        assert_eq!(
            err,
            StageError::MissingDependency {
                missing: StageName::QuestionGeneration
            }
        );
    }

    #[test]
    fn test_inputs_are_copies() {
        let mut ctx = RunContext::new("site");
        ctx.record(StageName::QuestionGeneration, questions(), 1).unwrap();
        let mut inputs = ctx.inputs_for(StageName::Research).unwrap();
        inputs.insert(
            StageName::QuestionGeneration,
            serde_json::json!({"questions": ["tampered"]}),
        );
        assert_eq!(
            ctx.get(StageName::QuestionGeneration)
                .and_then(StageOutput::as_questions)
                .map(|q| q.questions.clone()),
            Some(vec!["Who visits the site?".to_string()])
        );
    }

    #[test]
    fn test_status_transitions() {
        let mut ctx = RunContext::new("site");
        ctx.mark_running();
        assert_eq!(ctx.status(), RunStatus::Running);
        assert!(ctx.started_at().is_some());
        assert!(ctx.ended_at().is_none());

        ctx.mark_failed(Some(StageName::Design), "timeout", "slow");
        assert_eq!(ctx.status(), RunStatus::Failed);
        assert!(ctx.ended_at().is_some());
        assert_eq!(ctx.failure().unwrap().stage, Some(StageName::Design));
    }

    #[test]
    fn test_context_serializes_for_checkpointing() {
        let mut ctx = RunContext::new("site");
        ctx.record(StageName::QuestionGeneration, questions(), 2).unwrap();
        let json = serde_json::to_string(&ctx).unwrap();
        let restored: RunContext = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.run_id(), ctx.run_id());
        assert_eq!(restored.records(), ctx.records());
    }
}
