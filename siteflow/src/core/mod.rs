//! Core domain model types for siteflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - The closed set of stages and their order
//! - Run and task status enums
//! - Typed stage payloads and their schema validation
//! - The final artifact of a run

mod artifact;
mod output;
pub mod schema;
mod stage;
mod status;

pub use artifact::FinalArtifact;
pub use output::{
    ColorPalette, ComponentSpec, DesignSpecification, FailedQuery, Finding, GeneratedFileSet,
    LayoutSpec, PageRequirement, QuestionList, RefinedQueries, RequirementsDocument,
    ResearchFindings, StageOutput, Typography,
};
pub use schema::{SchemaViolation, Validate};
pub use stage::{StageName, UnknownStageError};
pub use status::{RunStatus, TaskStatus};
