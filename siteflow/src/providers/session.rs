//! Process-wide provider configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::StageName;

/// Shared configuration handed to every provider and tool call.
///
/// Built once per process, wrapped in an `Arc`, and never mutated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSession {
    /// Label of the generative backend, e.g. `vertex`.
    #[serde(default)]
    pub backend: String,
    /// Model used when a stage has no override.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Per-stage model overrides.
    #[serde(default)]
    pub stage_models: HashMap<StageName, String>,
    /// Free-form backend settings.
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

impl ProviderSession {
    /// Creates a session for `backend`.
    #[must_use]
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ..Self::default()
        }
    }

    /// Sets the default model.
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Sets the model for one stage.
    #[must_use]
    pub fn with_stage_model(mut self, stage: StageName, model: impl Into<String>) -> Self {
        self.stage_models.insert(stage, model.into());
        self
    }

    /// Adds a backend setting.
    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Returns the model to use for `stage`.
    #[must_use]
    pub fn model_for(&self, stage: StageName) -> Option<&str> {
        self.stage_models
            .get(&stage)
            .or(self.default_model.as_ref())
            .map(String::as_str)
    }

    /// Returns a backend setting.
    #[must_use]
    pub fn setting(&self, key: &str) -> Option<&serde_json::Value> {
        self.settings.get(key)
    }
}
