//! Testing utilities for siteflow pipelines.
//!
//! Scripted providers stand in for model backends, [`PipelineFixture`]
//! wires one of each into a builder, and the assertions check run
//! contexts and collected events.

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_emitted_before, assert_prefix_order, assert_recorded, assert_stage_events,
};
pub use fixtures::{
    design_payload, fast_config, files_payload, finding_payload, questions_payload,
    refined_queries_payload, requirements_payload, PipelineFixture, SITE_FILES,
};
pub use mocks::{
    FileWritingGenerator, QueryBehavior, RecordedCall, RecordingTool, ResearchProvider,
    ScriptedProvider,
};
