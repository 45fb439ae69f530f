//! # Siteflow
//!
//! Staged orchestration of website generation.
//!
//! A run turns a short user description into a set of site files by
//! passing it through a fixed sequence of stages:
//!
//! - **Question generation**: research questions about the site
//! - **Research**: one concurrent task per question, tolerating partial failure
//! - **Query refinement**, **requirements** and **design**
//! - **Code generation**: the only stage allowed to apply effect tools
//!   (`file.write`, `vcs.commit`, `remote.publish`)
//!
//! Every stage's generative work is delegated to a [`CapabilityProvider`];
//! the orchestrator validates outputs, retries transient failures, enforces
//! timeouts and propagates cancellation.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use siteflow::prelude::*;
//!
//! let pipeline = PipelineBuilder::new()
//!     .question_generator(questions)
//!     .researcher(research)
//!     .query_refiner(refiner)
//!     .requirements_writer(requirements)
//!     .designer(designer)
//!     .code_generator(generator)
//!     .tool(Arc::new(FileWriteTool::new("./site")))
//!     .build()?;
//!
//! let artifact = pipeline.execute("A portfolio site for a photographer").await?;
//! ```
//!
//! [`CapabilityProvider`]: providers::CapabilityProvider

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod fanout;
pub mod pipeline;
pub mod providers;
pub mod stages;
pub mod telemetry;
pub mod testing;
pub mod tools;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, TaskGroup};
    pub use crate::config::{ConfigError, RunConfig};
    pub use crate::context::{RunContext, StageInputs};
    pub use crate::core::{
        FinalArtifact, ResearchFindings, RunStatus, StageName, StageOutput, TaskStatus,
    };
    pub use crate::errors::{
        FanOutError, PipelineError, PipelineValidationError, ProviderError, StageError,
        StageFailure, ToolError,
    };
    pub use crate::events::{
        CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, RunEvents,
    };
    pub use crate::pipeline::{Pipeline, PipelineBuilder};
    pub use crate::providers::{CapabilityProvider, ProviderRequest, ProviderSession};
    pub use crate::stages::RetryConfig;
    pub use crate::telemetry::{init_tracing, LogFormat};
    pub use crate::tools::{
        EffectTool, FileWriteTool, GitCommitTool, RemotePublishTool, ToolId, ToolInvocation,
        ToolPolicy, ToolRegistry, ToolResult,
    };
}
