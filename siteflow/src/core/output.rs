//! Typed stage payloads.
//!
//! Each stage produces exactly one payload type. [`StageOutput`] is the
//! tagged union recorded in the run context; payloads are built from raw
//! provider JSON through [`StageOutput::from_provider`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::schema::{
    parse, require_hex_color, require_items, require_relative_path, require_text, SchemaViolation,
    Validate,
};
use super::stage::StageName;
use crate::tools::ToolOutcome;

/// Research questions produced by the first stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionList {
    /// One question per research task.
    pub questions: Vec<String>,
}

impl Validate for QuestionList {
    fn validate(&self) -> Result<(), SchemaViolation> {
        require_items("questions", &self.questions)?;
        for (i, question) in self.questions.iter().enumerate() {
            require_text(&format!("questions[{i}]"), question)?;
        }
        Ok(())
    }
}

/// The answer to one research query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Position of the query in the question list.
    #[serde(default)]
    pub index: usize,
    /// The query that was researched.
    #[serde(default)]
    pub query: String,
    /// Condensed research result.
    pub summary: String,
    /// References backing the summary.
    #[serde(default)]
    pub sources: Vec<String>,
}

impl Validate for Finding {
    fn validate(&self) -> Result<(), SchemaViolation> {
        require_text("summary", &self.summary)
    }
}

/// A research query that did not produce a finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedQuery {
    /// Position of the query in the question list.
    pub index: usize,
    /// The query text.
    pub query: String,
    /// Root error kind, e.g. `timeout`.
    pub error_kind: String,
    /// Human-readable failure description.
    pub message: String,
    /// Provider invocations made for this query.
    pub attempts: u32,
}

/// Merged output of the research fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchFindings {
    /// Successful findings ordered by query index.
    pub findings: Vec<Finding>,
    /// Queries that failed, ordered by query index.
    #[serde(default)]
    pub failed: Vec<FailedQuery>,
    /// True when at least one query failed.
    pub partial: bool,
}

impl ResearchFindings {
    /// Returns the finding for a query, if it succeeded.
    #[must_use]
    pub fn for_query(&self, query: &str) -> Option<&Finding> {
        self.findings.iter().find(|f| f.query == query)
    }
}

impl Validate for ResearchFindings {
    fn validate(&self) -> Result<(), SchemaViolation> {
        require_items("findings", &self.findings)?;
        if self.partial == self.failed.is_empty() {
            return Err(SchemaViolation::for_field(
                "partial",
                "must be true exactly when failed queries are present",
            ));
        }
        self.findings.iter().try_for_each(Validate::validate)
    }
}

/// Follow-up queries distilled from the research.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinedQueries {
    /// Refined queries.
    pub queries: Vec<String>,
    /// Optional note on how the queries were chosen.
    #[serde(default)]
    pub rationale: Option<String>,
}

impl Validate for RefinedQueries {
    fn validate(&self) -> Result<(), SchemaViolation> {
        require_items("queries", &self.queries)?;
        for (i, query) in self.queries.iter().enumerate() {
            require_text(&format!("queries[{i}]"), query)?;
        }
        Ok(())
    }
}

/// Requirements for one page of the site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequirement {
    /// Page name, e.g. `Home`.
    pub name: String,
    /// What the page is for.
    pub purpose: String,
    /// Content sections on the page.
    #[serde(default)]
    pub sections: Vec<String>,
}

/// The requirements document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementsDocument {
    /// Site title.
    pub title: String,
    /// One-paragraph summary of the site.
    pub summary: String,
    /// Pages of the site.
    pub pages: Vec<PageRequirement>,
    /// Cross-cutting features, e.g. a contact form.
    #[serde(default)]
    pub features: Vec<String>,
}

impl Validate for RequirementsDocument {
    fn validate(&self) -> Result<(), SchemaViolation> {
        require_text("title", &self.title)?;
        require_text("summary", &self.summary)?;
        require_items("pages", &self.pages)?;
        for (i, page) in self.pages.iter().enumerate() {
            require_text(&format!("pages[{i}].name"), &page.name)?;
            require_text(&format!("pages[{i}].purpose"), &page.purpose)?;
        }
        Ok(())
    }
}

fn default_base_size_px() -> u32 {
    16
}

/// Typography choices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typography {
    /// Font family for headings.
    pub heading_font: String,
    /// Font family for body text.
    pub body_font: String,
    /// Base font size in pixels.
    #[serde(default = "default_base_size_px")]
    pub base_size_px: u32,
}

/// Color palette, every entry in `#rrggbb` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorPalette {
    /// Primary brand color.
    pub primary: String,
    /// Secondary color.
    pub secondary: String,
    /// Page background.
    pub background: String,
    /// Body text color.
    pub text: String,
    /// Optional accent color.
    #[serde(default)]
    pub accent: Option<String>,
}

/// A reusable UI component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Component name, e.g. `Gallery`.
    pub name: String,
    /// What the component shows and how it behaves.
    pub description: String,
}

/// Page layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSpec {
    /// Overall structure, e.g. `single column with sticky header`.
    pub structure: String,
    /// Section order.
    #[serde(default)]
    pub sections: Vec<String>,
}

/// The visual design specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignSpecification {
    /// Fonts and sizes.
    pub typography: Typography,
    /// Color palette.
    pub colors: ColorPalette,
    /// UI components.
    pub components: Vec<ComponentSpec>,
    /// Page layout.
    pub layout: LayoutSpec,
}

impl Validate for DesignSpecification {
    fn validate(&self) -> Result<(), SchemaViolation> {
        require_text("typography.heading_font", &self.typography.heading_font)?;
        require_text("typography.body_font", &self.typography.body_font)?;
        if !(8..=72).contains(&self.typography.base_size_px) {
            return Err(SchemaViolation::for_field(
                "typography.base_size_px",
                "must be between 8 and 72",
            ));
        }
        require_hex_color("colors.primary", &self.colors.primary)?;
        require_hex_color("colors.secondary", &self.colors.secondary)?;
        require_hex_color("colors.background", &self.colors.background)?;
        require_hex_color("colors.text", &self.colors.text)?;
        if let Some(ref accent) = self.colors.accent {
            require_hex_color("colors.accent", accent)?;
        }
        require_items("components", &self.components)?;
        for (i, component) in self.components.iter().enumerate() {
            require_text(&format!("components[{i}].name"), &component.name)?;
        }
        require_text("layout.structure", &self.layout.structure)
    }
}

/// Generated source files plus the effects applied while producing them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFileSet {
    /// Path to content, ordered by path.
    pub files: BTreeMap<String, String>,
    /// Tool invocations made by the final stage.
    #[serde(default)]
    pub tool_outcomes: Vec<ToolOutcome>,
}

impl Validate for GeneratedFileSet {
    fn validate(&self) -> Result<(), SchemaViolation> {
        if self.files.is_empty() {
            return Err(SchemaViolation::for_field("files", "must contain at least one file"));
        }
        for path in self.files.keys() {
            require_relative_path("files", path)?;
        }
        Ok(())
    }
}

/// The output recorded for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum StageOutput {
    /// Output of [`StageName::QuestionGeneration`].
    Questions(QuestionList),
    /// Output of [`StageName::Research`].
    Research(ResearchFindings),
    /// Output of [`StageName::QueryRefinement`].
    RefinedQueries(RefinedQueries),
    /// Output of [`StageName::Requirements`].
    Requirements(RequirementsDocument),
    /// Output of [`StageName::Design`].
    Design(DesignSpecification),
    /// Output of [`StageName::CodeGeneration`].
    Files(GeneratedFileSet),
    /// Recorded in place of an optional stage that failed.
    Skipped {
        /// Why the stage was skipped.
        reason: String,
    },
}

impl StageOutput {
    /// Validates raw provider output against the schema of `stage`.
    pub fn from_provider(stage: StageName, raw: serde_json::Value) -> Result<Self, SchemaViolation> {
        Ok(match stage {
            StageName::QuestionGeneration => Self::Questions(parse(raw)?),
            StageName::Research => Self::Research(parse(raw)?),
            StageName::QueryRefinement => Self::RefinedQueries(parse(raw)?),
            StageName::Requirements => Self::Requirements(parse(raw)?),
            StageName::Design => Self::Design(parse(raw)?),
            StageName::CodeGeneration => Self::Files(parse(raw)?),
        })
    }

    /// Returns the stable kind string of the variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Questions(_) => "questions",
            Self::Research(_) => "research",
            Self::RefinedQueries(_) => "refined_queries",
            Self::Requirements(_) => "requirements",
            Self::Design(_) => "design",
            Self::Files(_) => "files",
            Self::Skipped { .. } => "skipped",
        }
    }

    /// Returns true if this output may be recorded for `stage`.
    #[must_use]
    pub const fn belongs_to(&self, stage: StageName) -> bool {
        matches!(
            (self, stage),
            (Self::Questions(_), StageName::QuestionGeneration)
                | (Self::Research(_), StageName::Research)
                | (Self::RefinedQueries(_), StageName::QueryRefinement)
                | (Self::Requirements(_), StageName::Requirements)
                | (Self::Design(_), StageName::Design)
                | (Self::Files(_), StageName::CodeGeneration)
                | (Self::Skipped { .. }, _)
        )
    }

    /// Returns true if the stage was skipped.
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    /// Returns the question list, if this is one.
    #[must_use]
    pub const fn as_questions(&self) -> Option<&QuestionList> {
        match self {
            Self::Questions(q) => Some(q),
            _ => None,
        }
    }

    /// Returns the research findings, if this is one.
    #[must_use]
    pub const fn as_research(&self) -> Option<&ResearchFindings> {
        match self {
            Self::Research(r) => Some(r),
            _ => None,
        }
    }

    /// Returns the requirements document, if this is one.
    #[must_use]
    pub const fn as_requirements(&self) -> Option<&RequirementsDocument> {
        match self {
            Self::Requirements(r) => Some(r),
            _ => None,
        }
    }

    /// Returns the design specification, if this is one.
    #[must_use]
    pub const fn as_design(&self) -> Option<&DesignSpecification> {
        match self {
            Self::Design(d) => Some(d),
            _ => None,
        }
    }

    /// Returns the generated file set, if this is one.
    #[must_use]
    pub const fn as_files(&self) -> Option<&GeneratedFileSet> {
        match self {
            Self::Files(f) => Some(f),
            _ => None,
        }
    }

    /// Returns the JSON form of the payload handed to later stages.
    #[must_use]
    pub fn payload_json(&self) -> serde_json::Value {
        let value = match self {
            Self::Questions(p) => serde_json::to_value(p),
            Self::Research(p) => serde_json::to_value(p),
            Self::RefinedQueries(p) => serde_json::to_value(p),
            Self::Requirements(p) => serde_json::to_value(p),
            Self::Design(p) => serde_json::to_value(p),
            Self::Files(p) => serde_json::to_value(p),
            Self::Skipped { reason } => Ok(serde_json::json!({ "skipped": true, "reason": reason })),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}
