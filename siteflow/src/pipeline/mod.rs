//! Pipeline building and execution.
//!
//! This module provides:
//! - The pipeline builder with validation
//! - The orchestrator that drives the fixed stage order for one run

mod builder;
mod orchestrator;

pub use builder::PipelineBuilder;
pub use orchestrator::Pipeline;
