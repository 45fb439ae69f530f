//! The closed set of pipeline stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A stage of the website generation pipeline.
///
/// The set is closed and the order is fixed; see [`StageName::ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Turns the user's description into research questions.
    QuestionGeneration,
    /// Fans out one research task per question.
    Research,
    /// Refines the research into follow-up queries.
    QueryRefinement,
    /// Writes the requirements document.
    Requirements,
    /// Produces the visual design specification.
    Design,
    /// Generates source files and applies effect tools.
    CodeGeneration,
}

impl StageName {
    /// Canonical execution order.
    pub const ORDER: [Self; 6] = [
        Self::QuestionGeneration,
        Self::Research,
        Self::QueryRefinement,
        Self::Requirements,
        Self::Design,
        Self::CodeGeneration,
    ];

    /// Returns the wire identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QuestionGeneration => "question_generation",
            Self::Research => "research",
            Self::QueryRefinement => "query_refinement",
            Self::Requirements => "requirements",
            Self::Design => "design",
            Self::CodeGeneration => "code_generation",
        }
    }

    /// Returns the zero-based position in [`StageName::ORDER`].
    #[must_use]
    pub const fn position(self) -> usize {
        self as usize
    }

    /// Returns the stage that runs after this one, if any.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::ORDER.get(self.position() + 1).copied()
    }

    /// Returns the stages whose outputs this stage reads.
    #[must_use]
    pub const fn requires(self) -> &'static [Self] {
        match self {
            Self::QuestionGeneration => &[],
            Self::Research => &[Self::QuestionGeneration],
            Self::QueryRefinement => &[Self::QuestionGeneration, Self::Research],
            Self::Requirements => &[Self::Research, Self::QueryRefinement],
            Self::Design => &[Self::Requirements],
            Self::CodeGeneration => &[Self::Requirements, Self::Design],
        }
    }

    /// Returns true for the fan-out slot.
    #[must_use]
    pub const fn is_fan_out(self) -> bool {
        matches!(self, Self::Research)
    }

    /// Returns true for the stage that is handed the effect tools.
    #[must_use]
    pub const fn uses_tools(self) -> bool {
        matches!(self, Self::CodeGeneration)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown stage name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown stage: {0}")]
pub struct UnknownStageError(pub String);

impl FromStr for StageName {
    type Err = UnknownStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDER
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStageError(s.to_string()))
    }
}
