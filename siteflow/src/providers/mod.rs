//! Capability providers: the units that do each stage's generative work.
//!
//! The orchestrator knows nothing about models or prompts. A provider
//! receives a [`ProviderRequest`] and answers with raw JSON, which the stage
//! then validates against its schema.

mod session;

pub use session::ProviderSession;

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::context::StageInputs;
use crate::core::StageName;
use crate::errors::ProviderError;
use crate::tools::ToolEnvironment;

/// A research query handed to one fan-out task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResearchQuery {
    /// Position in the question list.
    pub index: usize,
    /// The query text.
    pub text: String,
}

/// Everything a provider may read for one invocation.
#[derive(Clone)]
pub struct ProviderRequest {
    /// Run id.
    pub run_id: Uuid,
    /// The stage being executed.
    pub stage: StageName,
    /// 1-based invocation number within the stage (or research task).
    pub attempt: u32,
    /// The user's description.
    pub user_input: Arc<str>,
    /// Copies of the outputs this stage depends on.
    pub inputs: StageInputs,
    /// Set on the corrective attempt after a schema violation.
    pub corrective_instruction: Option<String>,
    /// Set for research tasks.
    pub query: Option<ResearchQuery>,
    /// Shared process-wide configuration.
    pub session: Arc<ProviderSession>,
    /// Effect tools, handed to the final stage only.
    pub tools: Option<Arc<ToolEnvironment>>,
    /// Cancellation signal for cooperative providers.
    pub cancel: Arc<CancellationToken>,
}

impl ProviderRequest {
    /// Returns the model configured for this stage.
    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.session.model_for(self.stage)
    }

    /// Returns the research query text, if this is a research task.
    #[must_use]
    pub fn query_text(&self) -> Option<&str> {
        self.query.as_ref().map(|q| q.text.as_str())
    }

    /// Returns true if this is the corrective attempt after a schema violation.
    #[must_use]
    pub const fn is_corrective(&self) -> bool {
        self.corrective_instruction.is_some()
    }
}

impl std::fmt::Debug for ProviderRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRequest")
            .field("run_id", &self.run_id)
            .field("stage", &self.stage)
            .field("attempt", &self.attempt)
            .field("query", &self.query)
            .field("corrective", &self.is_corrective())
            .field("has_tools", &self.tools.is_some())
            .finish_non_exhaustive()
    }
}

/// A unit of generative work for one stage.
///
/// Providers are stateless across invocations; anything they need arrives
/// in the request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Returns the provider name, used in logs.
    fn name(&self) -> &str;

    /// Produces raw output for the request.
    async fn invoke(&self, request: &ProviderRequest) -> Result<serde_json::Value, ProviderError>;
}
