//! Read-only view of the outputs a stage depends on.

use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

use crate::core::StageName;
use crate::errors::StageError;

/// Copies of the outputs a stage declared as inputs.
///
/// Built by [`RunContext::inputs_for`](super::RunContext::inputs_for). The
/// values are owned JSON copies, so nothing a provider does with them can
/// reach the run context.
#[derive(Debug, Clone, PartialEq)]
pub struct StageInputs {
    stage: StageName,
    values: BTreeMap<StageName, serde_json::Value>,
}

impl StageInputs {
    /// Creates an empty view for `stage`.
    #[must_use]
    pub fn new(stage: StageName) -> Self {
        Self {
            stage,
            values: BTreeMap::new(),
        }
    }

    /// Adds the output of a dependency.
    pub fn insert(&mut self, dependency: StageName, value: serde_json::Value) {
        self.values.insert(dependency, value);
    }

    /// Returns the stage these inputs were built for.
    #[must_use]
    pub const fn stage(&self) -> StageName {
        self.stage
    }

    /// Returns the output of a declared dependency.
    ///
    /// Undeclared stages always return `None`.
    #[must_use]
    pub fn get(&self, dependency: StageName) -> Option<&serde_json::Value> {
        if !self.stage.requires().contains(&dependency) {
            return None;
        }
        self.values.get(&dependency)
    }

    /// Deserializes the output of a declared dependency.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, dependency: StageName) -> Option<T> {
        self.decode(dependency).ok()
    }

    /// Deserializes the output of a declared dependency, reporting why it
    /// could not be read.
    pub fn decode<T: DeserializeOwned>(&self, dependency: StageName) -> Result<T, StageError> {
        let value = self
            .get(dependency)
            .ok_or(StageError::MissingDependency { missing: dependency })?;
        serde_json::from_value(value.clone()).map_err(|e| StageError::InputDecode {
            dependency,
            reason: e.to_string(),
        })
    }

    /// Returns true if the dependency is present.
    #[must_use]
    pub fn contains(&self, dependency: StageName) -> bool {
        self.get(dependency).is_some()
    }

    /// Returns the inputs as one JSON object keyed by wire id.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(stage, value)| (stage.as_str().to_string(), value.clone()))
            .collect();
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::QuestionList;
    use serde_json::json;

    #[test]
    fn test_get_declared_dependency() {
        let mut inputs = StageInputs::new(StageName::Research);
        inputs.insert(StageName::QuestionGeneration, json!({"questions": ["q1"]}));

        let questions: QuestionList = inputs.get_as(StageName::QuestionGeneration).unwrap();
        assert_eq!(questions.questions, vec!["q1".to_string()]);
        assert!(inputs.contains(StageName::QuestionGeneration));
    }

    #[test]
    fn test_decode_reports_malformed_payload() {
        let mut inputs = StageInputs::new(StageName::Research);
        inputs.insert(StageName::QuestionGeneration, json!({"questions": "not a list"}));

        let err = inputs
            .decode::<QuestionList>(StageName::QuestionGeneration)
            .unwrap_err();
        assert_eq!(err.kind(), "input_decode");
        assert!(matches!(
            err,
            StageError::InputDecode {
                dependency: StageName::QuestionGeneration,
                ..
            }
        ));
        assert!(inputs.get_as::<QuestionList>(StageName::QuestionGeneration).is_none());
    }

    #[test]
    fn test_decode_missing_dependency() {
        let inputs = StageInputs::new(StageName::Research);
        let err = inputs
            .decode::<QuestionList>(StageName::QuestionGeneration)
            .unwrap_err();
        assert_eq!(
            err,
            StageError::MissingDependency {
                missing: StageName::QuestionGeneration
            }
        );
    }

    #[test]
    fn test_undeclared_dependency_is_hidden() {
        let mut inputs = StageInputs::new(StageName::Design);
        inputs.insert(StageName::QuestionGeneration, json!({"questions": ["q1"]}));
        assert!(inputs.get(StageName::QuestionGeneration).is_none());
    }

    #[test]
    fn test_to_json_uses_wire_ids() {
        let mut inputs = StageInputs::new(StageName::Design);
        inputs.insert(StageName::Requirements, json!({"title": "Site"}));
        assert_eq!(inputs.to_json(), json!({"requirements": {"title": "Site"}}));
    }
}
