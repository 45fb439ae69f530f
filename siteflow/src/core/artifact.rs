//! The deliverable of a completed run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::output::{DesignSpecification, FailedQuery, RequirementsDocument};
use super::stage::StageName;
use crate::context::RunContext;
use crate::tools::ToolOutcome;

/// Generated files plus the metadata a caller needs to judge the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalArtifact {
    /// Run id.
    pub run_id: Uuid,
    /// The user's description.
    pub user_input: String,
    /// Generated files, path to content.
    pub files: BTreeMap<String, String>,
    /// Effects applied by the final stage.
    pub tool_outcomes: Vec<ToolOutcome>,
    /// The design the files were generated from.
    pub design: Option<DesignSpecification>,
    /// The requirements the design was derived from.
    pub requirements: Option<RequirementsDocument>,
    /// True when some research queries failed.
    pub research_partial: bool,
    /// The research queries that failed.
    pub failed_queries: Vec<FailedQuery>,
    /// Stages in the order they were recorded.
    pub stages: Vec<StageName>,
    /// Stages recorded as skipped.
    pub skipped_stages: Vec<StageName>,
    /// When the run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run ended.
    pub ended_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<i64>,
}

impl FinalArtifact {
    /// Derives the artifact from a run context.
    #[must_use]
    pub fn from_context(ctx: &RunContext) -> Self {
        let files = ctx.get(StageName::CodeGeneration).and_then(|o| o.as_files());
        let research = ctx.get(StageName::Research).and_then(|o| o.as_research());

        Self {
            run_id: ctx.run_id(),
            user_input: ctx.user_input().to_string(),
            files: files.map(|f| f.files.clone()).unwrap_or_default(),
            tool_outcomes: files.map(|f| f.tool_outcomes.clone()).unwrap_or_default(),
            design: ctx
                .get(StageName::Design)
                .and_then(|o| o.as_design())
                .cloned(),
            requirements: ctx
                .get(StageName::Requirements)
                .and_then(|o| o.as_requirements())
                .cloned(),
            research_partial: research.is_some_and(|r| r.partial),
            failed_queries: research.map(|r| r.failed.clone()).unwrap_or_default(),
            stages: ctx.completed_stages(),
            skipped_stages: ctx
                .records()
                .iter()
                .filter(|r| r.output.is_skipped())
                .map(|r| r.stage)
                .collect(),
            started_at: ctx.started_at(),
            ended_at: ctx.ended_at(),
            duration_ms: match (ctx.started_at(), ctx.ended_at()) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                _ => None,
            },
        }
    }

    /// Returns the content of a generated file.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }
}
