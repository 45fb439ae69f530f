//! Payload fixtures and a ready-made provider set.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::mocks::{FileWritingGenerator, ResearchProvider, ScriptedProvider};
use crate::config::RunConfig;
use crate::pipeline::PipelineBuilder;
use crate::stages::RetryConfig;

/// Questions payload for the first stage.
#[must_use]
pub fn questions_payload(questions: &[&str]) -> Value {
    json!({ "questions": questions })
}

/// A single research finding.
#[must_use]
pub fn finding_payload(summary: &str) -> Value {
    json!({ "summary": summary, "sources": ["https://example.com"] })
}

/// Refined queries payload.
#[must_use]
pub fn refined_queries_payload() -> Value {
    json!({
        "queries": ["portfolio gallery layouts", "booking form best practices"],
        "rationale": "Focus on showcasing work and converting visitors",
    })
}

/// A small requirements document.
#[must_use]
pub fn requirements_payload() -> Value {
    json!({
        "title": "Studio Portfolio",
        "summary": "A portfolio site for a freelance photographer.",
        "pages": [
            {"name": "Home", "purpose": "Introduce the photographer", "sections": ["hero", "featured"]},
            {"name": "Gallery", "purpose": "Show recent work", "sections": ["grid"]},
            {"name": "Contact", "purpose": "Collect booking requests"}
        ],
        "features": ["contact form", "image lightbox"],
    })
}

/// A design specification that passes validation.
#[must_use]
pub fn design_payload() -> Value {
    json!({
        "typography": {"heading_font": "Playfair Display", "body_font": "Inter", "base_size_px": 16},
        "colors": {
            "primary": "#1a1a1a",
            "secondary": "#c9a227",
            "background": "#ffffff",
            "text": "#222222",
            "accent": "#e63946"
        },
        "components": [
            {"name": "Hero", "description": "Full-width cover image with title"},
            {"name": "Gallery", "description": "Masonry grid with lightbox"}
        ],
        "layout": {"structure": "single column with sticky header", "sections": ["hero", "gallery", "contact"]},
    })
}

/// Generated files payload.
#[must_use]
pub fn files_payload(files: &[(&str, &str)]) -> Value {
    let map: serde_json::Map<String, Value> = files
        .iter()
        .map(|(path, content)| ((*path).to_string(), json!(content)))
        .collect();
    json!({ "files": map })
}

/// Default generated site.
pub const SITE_FILES: [(&str, &str); 2] = [
    ("index.html", "<!doctype html><h1>Studio Portfolio</h1>"),
    ("styles.css", "body { font-family: Inter; }"),
];

/// A configuration with short timeouts and near-instant retries.
#[must_use]
pub fn fast_config() -> RunConfig {
    RunConfig::default()
        .with_stage_timeout(Duration::from_secs(5))
        .with_phase_timeout(Duration::from_secs(10))
        .with_retry(
            RetryConfig::new()
                .with_max_attempts(3)
                .with_base_delay_ms(1)
                .with_max_delay_ms(5),
        )
}

/// One provider per stage, kept for inspection after a run.
#[derive(Debug, Clone)]
pub struct PipelineFixture {
    /// Question generation provider.
    pub questions: Arc<ScriptedProvider>,
    /// Research provider.
    pub research: Arc<ResearchProvider>,
    /// Query refinement provider.
    pub refiner: Arc<ScriptedProvider>,
    /// Requirements provider.
    pub requirements: Arc<ScriptedProvider>,
    /// Design provider.
    pub designer: Arc<ScriptedProvider>,
    /// Code generation provider.
    pub generator: Arc<FileWritingGenerator>,
}

impl PipelineFixture {
    /// Creates a fixture asking `questions` where every stage succeeds.
    #[must_use]
    pub fn new(questions: &[&str]) -> Self {
        Self::with_research(questions, ResearchProvider::new())
    }

    /// Creates a fixture with a custom research provider.
    #[must_use]
    pub fn with_research(questions: &[&str], research: ResearchProvider) -> Self {
        Self {
            questions: Arc::new(ScriptedProvider::always(
                "questions",
                questions_payload(questions),
            )),
            research: Arc::new(research),
            refiner: Arc::new(ScriptedProvider::always("refiner", refined_queries_payload())),
            requirements: Arc::new(ScriptedProvider::always(
                "requirements",
                requirements_payload(),
            )),
            designer: Arc::new(ScriptedProvider::always("designer", design_payload())),
            generator: Arc::new(FileWritingGenerator::new(SITE_FILES)),
        }
    }

    /// Replaces the design provider.
    #[must_use]
    pub fn with_designer(mut self, designer: ScriptedProvider) -> Self {
        self.designer = Arc::new(designer);
        self
    }

    /// Replaces the requirements provider.
    #[must_use]
    pub fn with_requirements(mut self, requirements: ScriptedProvider) -> Self {
        self.requirements = Arc::new(requirements);
        self
    }

    /// Replaces the code generation provider.
    #[must_use]
    pub fn with_generator(mut self, generator: FileWritingGenerator) -> Self {
        self.generator = Arc::new(generator);
        self
    }

    /// Returns a builder wired to the fixture's providers and [`fast_config`].
    #[must_use]
    pub fn builder(&self) -> PipelineBuilder {
        PipelineBuilder::new()
            .question_generator(self.questions.clone())
            .researcher(self.research.clone())
            .query_refiner(self.refiner.clone())
            .requirements_writer(self.requirements.clone())
            .designer(self.designer.clone())
            .code_generator(self.generator.clone())
            .config(fast_config())
    }
}
