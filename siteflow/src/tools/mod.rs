//! Effect tools used by the code generation stage.
//!
//! This module provides:
//! - Tool identifiers, invocations and results
//! - A registry of tool instances
//! - An idempotency store for replaying identical effects
//! - The per-run tool environment that applies invocations
//! - File, commit and publish tool implementations

mod definitions;
mod environment;
mod file_writer;
mod git;
mod idempotency;
mod registry;
mod remote;

pub use definitions::{EffectTool, ToolId, ToolInvocation, ToolOutcome, ToolResult};
pub use environment::{first_unrecovered_error, ToolEnvironment, ToolPolicy};
pub use file_writer::FileWriteTool;
pub use git::GitCommitTool;
pub use idempotency::{
    check_idempotency, generate_idempotency_key, hash_parameters, CachedResult, IdempotencyCheck,
    IdempotencyStore, InMemoryIdempotencyStore,
};
pub use registry::ToolRegistry;
pub use remote::RemotePublishTool;

#[cfg(test)]
pub(crate) use definitions::MockEffectTool;
