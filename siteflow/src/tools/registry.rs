//! Registry of effect tool instances.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::definitions::{EffectTool, ToolId};

/// The tools available to a pipeline, at most one per identifier.
///
/// Tools are constructed once per process and shared between runs.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<ToolId, Arc<dyn EffectTool>>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any tool with the same identifier.
    pub fn register(&mut self, tool: Arc<dyn EffectTool>) {
        self.tools.insert(tool.id(), tool);
    }

    /// Registers a tool, builder style.
    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn EffectTool>) -> Self {
        self.register(tool);
        self
    }

    /// Returns the tool for `id`.
    #[must_use]
    pub fn get(&self, id: ToolId) -> Option<Arc<dyn EffectTool>> {
        self.tools.get(&id).cloned()
    }

    /// Returns true if a tool is registered for `id`.
    #[must_use]
    pub fn contains(&self, id: ToolId) -> bool {
        self.tools.contains_key(&id)
    }

    /// Returns the registered identifiers in order.
    #[must_use]
    pub fn ids(&self) -> Vec<ToolId> {
        self.tools.keys().copied().collect()
    }

    /// Returns the number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns true if no tool is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.ids())
            .finish()
    }
}
