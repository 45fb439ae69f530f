//! Pipeline builder with validation.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::Pipeline;
use crate::config::RunConfig;
use crate::core::StageName;
use crate::errors::PipelineValidationError;
use crate::events::EventSink;
use crate::fanout::{FanOutCoordinator, FanOutPolicy};
use crate::providers::{CapabilityProvider, ProviderSession};
use crate::stages::{StageDefinition, StagePolicy};
use crate::tools::{EffectTool, ToolRegistry};

/// Builder for a [`Pipeline`].
///
/// Every stage in [`StageName::ORDER`] needs a provider. Tools, session and
/// event sink are optional.
#[derive(Default)]
pub struct PipelineBuilder {
    providers: BTreeMap<StageName, Arc<dyn CapabilityProvider>>,
    config: RunConfig,
    session: ProviderSession,
    tools: ToolRegistry,
    sink: Option<Arc<dyn EventSink>>,
}

impl PipelineBuilder {
    /// Creates an empty builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the provider of `stage`, replacing any previous one.
    #[must_use]
    pub fn provider(mut self, stage: StageName, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.providers.insert(stage, provider);
        self
    }

    /// Sets the question generation provider.
    #[must_use]
    pub fn question_generator(self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.provider(StageName::QuestionGeneration, provider)
    }

    /// Sets the provider run once per research query.
    #[must_use]
    pub fn researcher(self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.provider(StageName::Research, provider)
    }

    /// Sets the query refinement provider.
    #[must_use]
    pub fn query_refiner(self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.provider(StageName::QueryRefinement, provider)
    }

    /// Sets the requirements provider.
    #[must_use]
    pub fn requirements_writer(self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.provider(StageName::Requirements, provider)
    }

    /// Sets the design provider.
    #[must_use]
    pub fn designer(self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.provider(StageName::Design, provider)
    }

    /// Sets the code generation provider.
    #[must_use]
    pub fn code_generator(self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.provider(StageName::CodeGeneration, provider)
    }

    /// Sets the run configuration.
    #[must_use]
    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the shared provider session.
    #[must_use]
    pub fn session(mut self, session: ProviderSession) -> Self {
        self.session = session;
        self
    }

    /// Registers an effect tool.
    #[must_use]
    pub fn tool(mut self, tool: Arc<dyn EffectTool>) -> Self {
        self.tools.register(tool);
        self
    }

    /// Replaces the tool registry.
    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the event sink. Defaults to the process-wide sink.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validates the configuration and builds the pipeline.
    pub fn build(mut self) -> Result<Pipeline, PipelineValidationError> {
        let missing: Vec<String> = StageName::ORDER
            .iter()
            .filter(|s| !self.providers.contains_key(*s))
            .map(|s| s.as_str().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "No provider registered for stage(s): {}",
                missing.join(", ")
            ))
            .with_stages(missing));
        }

        self.config
            .validate()
            .map_err(|e| PipelineValidationError::new(e.to_string()))?;

        let Some(research) = self.providers.remove(&StageName::Research) else {
            return Err(PipelineValidationError::new("No research provider registered")
                .with_stages(vec![StageName::Research.as_str().to_string()]));
        };

        let stages = self
            .providers
            .into_iter()
            .map(|(name, provider)| {
                let policy = StagePolicy::from_config(&self.config, name);
                (name, StageDefinition::new(name, provider, policy))
            })
            .collect();

        Ok(Pipeline {
            stages,
            research: FanOutCoordinator::new(research, FanOutPolicy::from_config(&self.config)),
            session: Arc::new(self.session),
            tools: Arc::new(self.tools),
            sink: self.sink,
            config: self.config,
        })
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("stages", &self.providers.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockCapabilityProvider;

    fn mock() -> Arc<dyn CapabilityProvider> {
        let mut provider = MockCapabilityProvider::new();
        provider.expect_name().return_const("mock".to_string());
        Arc::new(provider)
    }

    fn complete() -> PipelineBuilder {
        StageName::ORDER
            .iter()
            .fold(PipelineBuilder::new(), |b, stage| b.provider(*stage, mock()))
    }

    #[test]
    fn test_build_complete_pipeline() {
        let pipeline = complete()
            .config(RunConfig::default().with_max_concurrency(2))
            .build()
            .unwrap();
        assert_eq!(pipeline.config().max_concurrency, 2);
        assert_eq!(pipeline.stages.len(), 5);
        assert!(!pipeline.stages.contains_key(&StageName::Research));
        assert_eq!(pipeline.research.policy().max_concurrency, 2);
    }

    #[test]
    fn test_missing_providers_are_listed() {
        let err = PipelineBuilder::new()
            .question_generator(mock())
            .researcher(mock())
            .build()
            .unwrap_err();
        assert_eq!(
            err.stages,
            vec!["query_refinement", "requirements", "design", "code_generation"]
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = complete()
            .config(RunConfig::default().with_max_concurrency(0))
            .build()
            .unwrap_err();
        assert!(err.message.contains("max_concurrency"));
    }

    #[test]
    fn test_optional_stage_policy() {
        let pipeline = complete()
            .config(RunConfig::default().with_optional_stage(StageName::Design))
            .build()
            .unwrap();
        assert!(pipeline.stages[&StageName::Design].policy().optional);
        assert!(!pipeline.stages[&StageName::Requirements].policy().optional);
    }
}
