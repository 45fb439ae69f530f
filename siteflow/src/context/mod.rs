//! Run state shared between the orchestrator and its stages.
//!
//! - [`RunContext`]: the single-writer record of one run
//! - [`StageInputs`]: the read-only copies a stage is given

mod inputs;
mod run;

pub use inputs::StageInputs;
pub use run::{FailureRecord, RunContext, StageRecord};
