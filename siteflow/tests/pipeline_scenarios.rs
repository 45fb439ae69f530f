//! End-to-end runs of the website generation pipeline.

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use siteflow::cancellation::CancellationToken;
use siteflow::context::RunContext;
use siteflow::core::{RunStatus, StageName, StageOutput};
use siteflow::errors::{FanOutError, PipelineError, ProviderError, StageError, StageFailure};
use siteflow::events::CollectingEventSink;
use siteflow::testing::{
    assert_emitted_before, assert_prefix_order, assert_recorded, assert_stage_events,
    design_payload, fast_config, requirements_payload, PipelineFixture, QueryBehavior,
    ResearchProvider, ScriptedProvider, SITE_FILES,
};

const PHOTOGRAPHER: &str = "a portfolio site for a photographer";

const FIVE_QUESTIONS: [&str; 5] = [
    "What do photographers show on a portfolio home page?",
    "How are photo galleries usually organised?",
    "Which booking flows convert best for freelancers?",
    "What typography suits photography sites?",
    "How do portfolio sites handle client testimonials?",
];

#[tokio::test]
async fn test_full_run_completes_in_order() {
    let fixture = PipelineFixture::new(&FIVE_QUESTIONS);
    let sink = Arc::new(CollectingEventSink::new());
    let pipeline = fixture.builder().event_sink(sink.clone()).build().unwrap();

    let mut ctx = RunContext::new(PHOTOGRAPHER);
    let artifact = assert_ok!(
        pipeline
            .execute_with(&mut ctx, Arc::new(CancellationToken::new()))
            .await
    );

    assert_eq!(ctx.status(), RunStatus::Completed);
    assert_recorded(&ctx, &StageName::ORDER);
    assert!(ctx.ended_at().is_some());

    assert_eq!(artifact.run_id, ctx.run_id());
    assert_eq!(artifact.stages, StageName::ORDER.to_vec());
    assert!(!artifact.research_partial);
    assert_eq!(artifact.files.len(), SITE_FILES.len());
    assert_eq!(artifact.file("index.html"), Some(SITE_FILES[0].1));
    assert_eq!(artifact.requirements.as_ref().unwrap().title, "Studio Portfolio");
    assert_eq!(artifact.design.as_ref().unwrap().colors.primary, "#1a1a1a");

    assert_stage_events(&sink, "stage.completed", &StageName::ORDER);
    assert_emitted_before(&sink, "pipeline.started", "stage.started");
    assert_emitted_before(&sink, "fanout.completed", "pipeline.completed");
    assert_eq!(sink.count("fanout.task_completed"), 5);
    assert!(sink
        .events()
        .iter()
        .all(|(_, data)| data.as_ref().is_some_and(|d| d.get("run_id").is_some())));
}

#[tokio::test]
async fn test_stages_receive_their_dependencies() {
    let fixture = PipelineFixture::new(&["q1", "q2"]);
    let pipeline = fixture.builder().build().unwrap();

    assert_ok!(pipeline.execute(PHOTOGRAPHER).await);

    let refiner_call = &fixture.refiner.calls()[0];
    assert_eq!(refiner_call.inputs["question_generation"]["questions"], json!(["q1", "q2"]));
    assert_eq!(
        refiner_call.inputs["research"]["findings"][1]["summary"],
        json!(ResearchProvider::summary_for("q2"))
    );

    let design_call = &fixture.designer.calls()[0];
    assert!(design_call.inputs.get("requirements").is_some());
    assert!(design_call.inputs.get("research").is_none());
}

#[tokio::test]
async fn test_photographer_scenario_completes_with_partial_research() {
    let research = ResearchProvider::new().when(
        "booking flows",
        QueryBehavior::Sequence(vec![
            ProviderError::timeout(Duration::from_secs(60)),
            ProviderError::timeout(Duration::from_secs(60)),
            ProviderError::unavailable("research backend refused the query"),
        ]),
    );
    let fixture = PipelineFixture::with_research(&FIVE_QUESTIONS, research);
    let sink = Arc::new(CollectingEventSink::new());
    let pipeline = fixture.builder().event_sink(sink.clone()).build().unwrap();

    let mut ctx = RunContext::new(PHOTOGRAPHER);
    let artifact = assert_ok!(
        pipeline
            .execute_with(&mut ctx, Arc::new(CancellationToken::new()))
            .await
    );

    assert_eq!(ctx.status(), RunStatus::Completed);
    let findings = ctx
        .get(StageName::Research)
        .and_then(StageOutput::as_research)
        .unwrap();
    assert!(findings.partial);
    assert_eq!(findings.findings.len(), 4);
    assert_eq!(findings.failed.len(), 1);
    assert_eq!(findings.failed[0].index, 2);
    assert_eq!(findings.failed[0].error_kind, "unavailable");
    assert_eq!(findings.failed[0].attempts, 3);
    assert_eq!(fixture.research.calls_for(FIVE_QUESTIONS[2]), 3);

    assert!(artifact.research_partial);
    assert_eq!(artifact.failed_queries, findings.failed);
    assert_eq!(artifact.files.len(), SITE_FILES.len());
    assert_eq!(sink.count("fanout.task_failed"), 1);
    assert_eq!(sink.count("stage.retrying"), 2);
}

#[tokio::test]
async fn test_all_research_failing_aborts_run() {
    let research = ResearchProvider::new().fail_when("", ProviderError::unavailable("offline"));
    let fixture = PipelineFixture::with_research(&["q1", "q2", "q3"], research);
    let pipeline = fixture.builder().build().unwrap();

    let mut ctx = RunContext::new(PHOTOGRAPHER);
    let err = assert_err!(
        pipeline
            .execute_with(&mut ctx, Arc::new(CancellationToken::new()))
            .await
    );

    match &err {
        PipelineError::StageFailed {
            stage,
            cause: StageFailure::FanOut(FanOutError::AllFailed { failures }),
        } => {
            assert_eq!(*stage, StageName::Research);
            assert_eq!(failures.len(), 3);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.root_kind(), "all_failed");
    assert_eq!(ctx.status(), RunStatus::Failed);
    assert_recorded(&ctx, &[StageName::QuestionGeneration]);
    let failure = ctx.failure().unwrap();
    assert_eq!(failure.stage, Some(StageName::Research));
    assert_eq!(failure.kind, "all_failed");
    assert_eq!(fixture.refiner.call_count(), 0);
}

#[tokio::test]
async fn test_stage_failure_stops_later_stages() {
    let fixture = PipelineFixture::new(&["q1"]).with_requirements(
        ScriptedProvider::new("requirements").then_err(ProviderError::unavailable("quota")),
    );
    let pipeline = fixture.builder().build().unwrap();

    let mut ctx = RunContext::new(PHOTOGRAPHER);
    let err = assert_err!(
        pipeline
            .execute_with(&mut ctx, Arc::new(CancellationToken::new()))
            .await
    );

    assert_eq!(err.stage(), Some(StageName::Requirements));
    assert_eq!(err.root_kind(), "unavailable");
    assert_prefix_order(&ctx);
    assert_eq!(ctx.completed_stages().len(), 3);
    assert_eq!(fixture.requirements.call_count(), 1);
    assert_eq!(fixture.designer.call_count(), 0);
    assert_eq!(fixture.generator.call_count(), 0);
}

#[tokio::test]
async fn test_transient_retries_yield_same_output() {
    let clean = PipelineFixture::new(&["q1"]);
    let flaky = PipelineFixture::new(&["q1"]).with_requirements(
        ScriptedProvider::new("requirements")
            .then_err(ProviderError::timeout(Duration::from_secs(60)))
            .then_err(ProviderError::rate_limited(None))
            .with_fallback(requirements_payload()),
    );

    let mut clean_ctx = RunContext::new(PHOTOGRAPHER);
    let mut flaky_ctx = RunContext::new(PHOTOGRAPHER);
    let clean_artifact = clean
        .builder()
        .build()
        .unwrap()
        .execute_with(&mut clean_ctx, Arc::new(CancellationToken::new()))
        .await
        .unwrap();
    let flaky_artifact = flaky
        .builder()
        .build()
        .unwrap()
        .execute_with(&mut flaky_ctx, Arc::new(CancellationToken::new()))
        .await
        .unwrap();

    assert_eq!(
        clean_ctx.get(StageName::Requirements),
        flaky_ctx.get(StageName::Requirements)
    );
    assert_eq!(clean_artifact.requirements, flaky_artifact.requirements);
    assert_eq!(clean_artifact.files, flaky_artifact.files);
    assert_eq!(flaky_ctx.records()[3].attempts, 3);
    assert_eq!(clean_ctx.records()[3].attempts, 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_stage() {
    let fixture = PipelineFixture::new(&["q1"]).with_requirements(
        ScriptedProvider::new("requirements")
            .then_err(ProviderError::timeout(Duration::from_secs(60)))
            .then_err(ProviderError::timeout(Duration::from_secs(60)))
            .then_err(ProviderError::timeout(Duration::from_secs(60)))
            .with_fallback(requirements_payload()),
    );
    let pipeline = fixture.builder().build().unwrap();

    let err = pipeline.execute(PHOTOGRAPHER).await.unwrap_err();
    match err {
        PipelineError::StageFailed {
            cause: StageFailure::Stage(StageError::ProviderExhausted { attempts, .. }),
            ..
        } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(fixture.requirements.call_count(), 3);
}

#[tokio::test]
async fn test_schema_violation_gets_one_corrective_attempt() {
    let fixture = PipelineFixture::new(&["q1"]).with_designer(
        ScriptedProvider::new("designer")
            .then_ok(json!({"colors": "dark"}))
            .with_fallback(design_payload()),
    );
    let pipeline = fixture.builder().build().unwrap();

    assert_ok!(pipeline.execute(PHOTOGRAPHER).await);

    let calls = fixture.designer.calls();
    assert_eq!(calls.len(), 2);
    assert!(!calls[0].corrective);
    assert!(calls[1].corrective);
}

#[tokio::test]
async fn test_repeated_schema_violation_fails_validation() {
    let fixture = PipelineFixture::new(&["q1"]).with_designer(ScriptedProvider::always(
        "designer",
        json!({"typography": {}}),
    ));
    let pipeline = fixture.builder().build().unwrap();

    let err = pipeline.execute(PHOTOGRAPHER).await.unwrap_err();
    assert_eq!(err.stage(), Some(StageName::Design));
    assert_eq!(err.root_kind(), "validation_failed");
    assert_eq!(fixture.designer.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_mid_fan_out_discards_research() {
    let research = ResearchProvider::new().hang_when("slow");
    let fixture = PipelineFixture::with_research(&["fast query", "slow query"], research);
    let sink = Arc::new(CollectingEventSink::new());
    let pipeline = fixture.builder().event_sink(sink.clone()).build().unwrap();

    let token = Arc::new(CancellationToken::new());
    let canceller = Arc::clone(&token);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel("user aborted");
    });

    let mut ctx = RunContext::new(PHOTOGRAPHER);
    let err = pipeline.execute_with(&mut ctx, token).await.unwrap_err();

    match err {
        PipelineError::Cancelled { reason } => assert_eq!(reason, "user aborted"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(ctx.status(), RunStatus::Failed);
    assert_recorded(&ctx, &[StageName::QuestionGeneration]);
    assert!(!ctx.contains(StageName::Research));
    assert_eq!(sink.count("pipeline.cancelled"), 1);
    assert_eq!(sink.count("pipeline.completed"), 0);
    assert_eq!(fixture.refiner.call_count(), 0);
}

#[tokio::test]
async fn test_cancelled_before_start_runs_nothing() {
    let fixture = PipelineFixture::new(&["q1"]);
    let pipeline = fixture.builder().build().unwrap();
    let token = Arc::new(CancellationToken::new());
    token.cancel("shutdown");

    let mut ctx = RunContext::new(PHOTOGRAPHER);
    let err = pipeline.execute_with(&mut ctx, token).await.unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled { .. }));
    assert!(ctx.completed_stages().is_empty());
    assert_eq!(fixture.questions.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_phase_timeout_keeps_finished_findings() {
    let research = ResearchProvider::new().hang_when("stuck");
    let fixture = PipelineFixture::with_research(&["first", "stuck query", "third"], research);
    let pipeline = fixture
        .builder()
        .config(fast_config().with_phase_timeout(Duration::from_secs(2)))
        .build()
        .unwrap();

    let artifact = pipeline.execute(PHOTOGRAPHER).await.unwrap();

    assert!(artifact.research_partial);
    assert_eq!(artifact.failed_queries.len(), 1);
    assert_eq!(artifact.failed_queries[0].query, "stuck query");
    assert_eq!(artifact.failed_queries[0].error_kind, "timeout");
}

#[tokio::test(start_paused = true)]
async fn test_run_deadline_cancels_in_flight_stage() {
    let fixture = PipelineFixture::new(&["q1"]).with_designer(
        ScriptedProvider::always("designer", design_payload()).with_delay(Duration::from_secs(30)),
    );
    let pipeline = fixture
        .builder()
        .config(fast_config().with_run_deadline(Duration::from_secs(1)))
        .build()
        .unwrap();

    let mut ctx = RunContext::new(PHOTOGRAPHER);
    let err = pipeline
        .execute_with(&mut ctx, Arc::new(CancellationToken::new()))
        .await
        .unwrap_err();

    match err {
        PipelineError::Deadline { stage, deadline_ms } => {
            assert_eq!(stage, StageName::Design);
            assert_eq!(deadline_ms, 1000);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(ctx.status(), RunStatus::Failed);
    assert_eq!(ctx.failure().unwrap().kind, "deadline");
    assert_eq!(ctx.completed_stages().len(), 4);
}

#[tokio::test]
async fn test_optional_stage_failure_is_skipped() {
    let fixture = PipelineFixture::new(&["q1"])
        .with_designer(ScriptedProvider::new("designer").then_err(ProviderError::unavailable("down")));
    let sink = Arc::new(CollectingEventSink::new());
    let pipeline = fixture
        .builder()
        .config(fast_config().with_optional_stage(StageName::Design))
        .event_sink(sink.clone())
        .build()
        .unwrap();

    let artifact = pipeline.execute(PHOTOGRAPHER).await.unwrap();

    assert_eq!(artifact.skipped_stages, vec![StageName::Design]);
    assert!(artifact.design.is_none());
    assert_eq!(artifact.files.len(), SITE_FILES.len());
    assert_eq!(sink.count("stage.skipped"), 1);
}

#[tokio::test]
async fn test_research_respects_concurrency_ceiling() {
    let questions = ["a", "b", "c", "d", "e", "f"];
    let research = ResearchProvider::new().when("", QueryBehavior::Delay(Duration::from_millis(20)));
    let fixture = PipelineFixture::with_research(&questions, research);
    let pipeline = fixture
        .builder()
        .config(fast_config().with_max_concurrency(2).with_max_questions(6))
        .build()
        .unwrap();

    let artifact = pipeline.execute(PHOTOGRAPHER).await.unwrap();

    assert!(!artifact.research_partial);
    assert_eq!(fixture.research.total_calls(), 6);
    assert!(fixture.research.peak_in_flight() <= 2);
}

#[tokio::test]
async fn test_generated_questions_are_capped() {
    let questions = ["q1", "q2", "q3", "q4", "q5", "q6", "q7"];
    let fixture = PipelineFixture::new(&questions);
    let pipeline = fixture.builder().build().unwrap();

    let mut ctx = RunContext::new(PHOTOGRAPHER);
    pipeline
        .execute_with(&mut ctx, Arc::new(CancellationToken::new()))
        .await
        .unwrap();

    let recorded = ctx
        .get(StageName::QuestionGeneration)
        .and_then(StageOutput::as_questions)
        .unwrap();
    assert_eq!(recorded.questions.len(), 5);
    assert_eq!(fixture.research.total_calls(), 5);
    assert_eq!(fixture.research.calls_for("q6"), 0);
}

#[tokio::test]
async fn test_failed_queries_retried_once_when_enabled() {
    let research = ResearchProvider::new().when(
        "second",
        QueryBehavior::Flaky(1, ProviderError::unavailable("cold start")),
    );
    let fixture = PipelineFixture::with_research(&["first", "second"], research);
    let pipeline = fixture
        .builder()
        .config(fast_config().with_retry_failed_queries(true))
        .build()
        .unwrap();

    let artifact = pipeline.execute(PHOTOGRAPHER).await.unwrap();

    assert!(!artifact.research_partial);
    assert_eq!(fixture.research.calls_for("second"), 2);
}

#[tokio::test]
async fn test_empty_input_is_rejected() {
    let fixture = PipelineFixture::new(&["q1"]);
    let pipeline = fixture.builder().build().unwrap();

    let err = pipeline.execute("   ").await.unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
    assert_eq!(fixture.questions.call_count(), 0);
}

#[tokio::test]
async fn test_resume_runs_only_remaining_stages() {
    let fixture = PipelineFixture::new(&["q1"]);
    let pipeline = fixture.builder().build().unwrap();

    let mut ctx = RunContext::new(PHOTOGRAPHER);
    let questions =
        StageOutput::from_provider(StageName::QuestionGeneration, json!({"questions": ["kept"]}))
            .unwrap();
    ctx.record(StageName::QuestionGeneration, questions, 1).unwrap();

    pipeline
        .execute_with(&mut ctx, Arc::new(CancellationToken::new()))
        .await
        .unwrap();

    assert_eq!(fixture.questions.call_count(), 0);
    assert_eq!(fixture.research.calls_for("kept"), 1);
    assert_recorded(&ctx, &StageName::ORDER);
}

#[test]
fn test_missing_dependency_is_an_error() {
    let ctx = RunContext::new(PHOTOGRAPHER);
    let err = ctx.inputs_for(StageName::Design).unwrap_err();
    assert_eq!(
        err,
        StageError::MissingDependency {
            missing: StageName::Requirements
        }
    );
}
