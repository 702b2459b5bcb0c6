use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use futures::poll;
use groundcheck_core::fakes::{
    FailingGenerator, FailingRetrieval, MemoryPreferenceStore, ScriptedGenerator, StubAgent,
};
use groundcheck_core::quality::{Coherence, FactCheck, Validation};
use groundcheck_core::retrieval::{Claim, Concept};
use groundcheck_core::{
    AnswerPipeline, AnswerRequest, AnswerStatus, CitationKind, CitationToken, FailureKind,
    GenerationError, GenerationResponse, GenerationService, KeywordChunkScorer, PipelineConfig, Preferences,
    QualityConfig, QualityOrchestra, RetrievalService, RetrievedEvidence, StaticRetrieval,
};

const GOOD: &str = "Paris is the capital of France. [Claim: c1]";

fn evidence() -> Arc<StaticRetrieval> {
    Arc::new(StaticRetrieval::new(RetrievedEvidence {
        claims: vec![Claim {
            id: "c1".into(),
            statement: "Paris is the capital of France.".into(),
        }],
        concepts: vec![Concept {
            name: "Capital city".into(),
            description: "The seat of a country's government.".into(),
        }],
        ..RetrievedEvidence::default()
    }))
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.quality.enabled = false;
    config
}

fn pipeline(
    generator: Arc<dyn GenerationService>,
    retrieval: Arc<dyn RetrievalService>,
) -> AnswerPipeline {
    AnswerPipeline::builder(generator, retrieval)
        .config(config())
        .scorer(Arc::new(KeywordChunkScorer))
        .build()
}

fn question() -> AnswerRequest {
    AnswerRequest::new("What is the capital of France?")
}

#[tokio::test]
async fn grounded_answer_passes_without_regeneration() {
    let generator = Arc::new(ScriptedGenerator::new().then_text(GOOD));
    let pipeline = pipeline(generator.clone(), evidence());

    let response = pipeline.answer(question()).await;

    assert_eq!(response.status, AnswerStatus::Ok);
    assert_eq!(response.answer, GOOD);
    assert!(!response.regenerated);
    assert!(response.warning.is_none());
    assert_eq!(
        response.citations,
        vec![CitationToken::new(CitationKind::Claim, "c1")]
    );
    assert_eq!(response.selection.candidates, 2);
    assert_eq!(generator.calls(), 1);
    assert!(generator.requests()[0]
        .system_prompt
        .contains("[Claim: c1] Paris is the capital of France."));
    assert!(pipeline.ledger().is_empty());
}

#[tokio::test]
async fn fabricated_citation_is_regenerated_once() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .then_text("Paris is the capital of France. [Claim: c99]")
            .then_text(GOOD),
    );
    let pipeline = pipeline(generator.clone(), evidence());

    let response = pipeline.answer(question()).await;

    assert_eq!(response.status, AnswerStatus::Ok);
    assert!(response.regenerated);
    assert_eq!(response.answer, GOOD);
    assert_eq!(generator.calls(), 2);
    assert_eq!(pipeline.metrics().snapshot().regenerations, 1);
    assert!(pipeline.ledger().is_empty());
}

#[tokio::test]
async fn persistent_fabrication_is_flagged_and_recorded() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .then_text("Paris is the capital of France. [Claim: c99]")
            .then_text("Paris is the capital of France. [Claim: c42]")
            .then_text(GOOD),
    );
    let pipeline = pipeline(generator.clone(), evidence());

    let response = pipeline.answer(question()).await;

    assert_eq!(response.status, AnswerStatus::Flagged);
    assert!(response.regenerated);
    assert_eq!(generator.calls(), 2);
    let banner = &pipeline.config().citation.warning_banner;
    assert!(response.answer.starts_with(banner.as_str()));
    assert!(response.answer.ends_with("[Claim: c42]"));
    assert_eq!(response.warning.as_ref(), Some(banner));

    let records = pipeline.ledger().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failure_kind, FailureKind::InvalidCitations);
    assert_eq!(records[0].failure_details, vec!["invalid citation [Claim: c42]"]);
    assert_eq!(records[0].query, "What is the capital of France?");
}

#[tokio::test]
async fn retrieval_failure_degrades_to_no_evidence() {
    let generator =
        Arc::new(ScriptedGenerator::new().then_text("I could not find evidence about that."));
    let pipeline = pipeline(generator.clone(), Arc::new(FailingRetrieval::new()));

    let response = pipeline.answer(question()).await;

    assert_eq!(response.status, AnswerStatus::Ok);
    assert_eq!(response.selection.candidates, 0);
    assert!(response.citations.is_empty());
    assert!(generator.requests()[0]
        .system_prompt
        .contains("(no evidence was found)"));
}

#[tokio::test(start_paused = true)]
async fn hanging_retrieval_times_out() {
    let generator = Arc::new(ScriptedGenerator::new().then_text("No evidence available."));
    let pipeline = pipeline(generator.clone(), Arc::new(FailingRetrieval::hanging()));

    let response = pipeline.answer(question()).await;

    assert_eq!(response.status, AnswerStatus::Ok);
    assert_eq!(response.selection.candidates, 0);
}

#[tokio::test]
async fn generation_failure_apologizes_and_is_not_cached() {
    let generator = Arc::new(FailingGenerator::new());
    let pipeline = pipeline(generator.clone(), evidence());

    let response = pipeline.answer(question()).await;

    assert_eq!(response.status, AnswerStatus::Error);
    assert!(!response.answer.is_empty());
    assert!(response.citations.is_empty());
    let records = pipeline.ledger().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failure_kind, FailureKind::GenerationFailed);

    let again = pipeline.answer(question()).await;
    assert_eq!(again.status, AnswerStatus::Error);
    assert!(!again.cached);
    assert_eq!(generator.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn late_waiter_on_failed_answer_leaves_retry_in_flight() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .with_delay(Duration::from_millis(50))
            .then_error(GenerationError::Transport("connection reset".into()))
            .then_text(GOOD),
    );
    let pipeline = pipeline(generator.clone(), evidence());

    let mut first = Box::pin(pipeline.answer(question()));
    let mut late = Box::pin(pipeline.answer(question()));
    assert!(poll!(&mut first).is_pending());
    assert!(poll!(&mut late).is_pending());
    assert_eq!(pipeline.cache().in_flight(), 1);

    tokio::time::advance(Duration::from_millis(50)).await;
    let Poll::Ready(failed) = poll!(&mut first) else {
        panic!("first caller should have settled");
    };
    assert_eq!(failed.status, AnswerStatus::Error);
    assert_eq!(pipeline.cache().in_flight(), 0);

    // a retry registers a fresh computation before the late waiter resumes
    let mut retry = Box::pin(pipeline.answer(question()));
    assert!(poll!(&mut retry).is_pending());
    assert_eq!(pipeline.cache().in_flight(), 1);

    let Poll::Ready(stale) = poll!(&mut late) else {
        panic!("late waiter shares the settled computation");
    };
    assert_eq!(stale.status, AnswerStatus::Error);
    assert_eq!(pipeline.cache().in_flight(), 1);

    let (retried, joined) = tokio::join!(retry, pipeline.answer(question()));
    assert_eq!(retried.status, AnswerStatus::Ok);
    assert_eq!(joined.request_id, retried.request_id);
    assert_eq!(generator.calls(), 2);

    let cached = pipeline.answer(question()).await;
    assert!(cached.cached);
    assert_eq!(cached.answer, GOOD);
}

#[tokio::test]
async fn empty_completion_is_a_generation_failure() {
    let generator = Arc::new(ScriptedGenerator::new().then_text("   "));
    let pipeline = pipeline(generator, evidence());

    let response = pipeline.answer(question()).await;

    assert_eq!(response.status, AnswerStatus::Error);
    assert_eq!(
        pipeline.ledger().records()[0].failure_kind,
        FailureKind::GenerationFailed
    );
}

#[tokio::test]
async fn repeated_question_is_served_from_cache() {
    let generator = Arc::new(ScriptedGenerator::new().then_text(GOOD));
    let pipeline = pipeline(generator.clone(), evidence());

    let first = pipeline.answer(question()).await;
    let second = pipeline
        .answer(AnswerRequest::new("  what is the CAPITAL of   France? "))
        .await;

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.answer, first.answer);
    assert_eq!(second.request_id, first.request_id);
    assert_eq!(generator.calls(), 1);

    let metrics = pipeline.metrics().snapshot();
    assert_eq!(metrics.requests, 2);
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.cache_misses, 1);
}

#[tokio::test]
async fn strictness_is_part_of_the_cache_key() {
    let generator = Arc::new(ScriptedGenerator::new().then_text(GOOD).then_text(GOOD));
    let pipeline = pipeline(generator.clone(), evidence());

    pipeline.answer(question()).await;
    let strict = pipeline.answer(question().strict()).await;

    assert!(!strict.cached);
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn disabled_cache_always_recomputes() {
    let generator = Arc::new(ScriptedGenerator::new().then_text(GOOD).then_text(GOOD));
    let mut config = config();
    config.cache.enabled = false;
    let pipeline = AnswerPipeline::builder(generator.clone(), evidence())
        .config(config)
        .scorer(Arc::new(KeywordChunkScorer))
        .build();

    pipeline.answer(question()).await;
    let second = pipeline.answer(question()).await;

    assert!(!second.cached);
    assert_eq!(generator.calls(), 2);
    assert!(pipeline.cache().is_empty());
}

#[tokio::test]
async fn truncated_draft_is_reported() {
    let generator =
        Arc::new(ScriptedGenerator::new().then_response(GenerationResponse::truncated(GOOD)));
    let pipeline = pipeline(generator, evidence());

    let response = pipeline.answer(question()).await;

    assert!(response.truncated);
    assert_eq!(response.status, AnswerStatus::Ok);
}

#[tokio::test]
async fn session_preferences_shape_prompt_and_interaction_is_recorded() {
    let store = Arc::new(MemoryPreferenceStore::new().with(
        "s1",
        Preferences {
            tone: Some("friendly".into()),
            ..Preferences::default()
        },
    ));
    let generator = Arc::new(ScriptedGenerator::new().then_text(GOOD));
    let pipeline = AnswerPipeline::builder(generator.clone(), evidence())
        .config(config())
        .scorer(Arc::new(KeywordChunkScorer))
        .preferences(store.clone())
        .build();

    pipeline.answer(question().with_session("s1")).await;

    assert!(generator.requests()[0]
        .system_prompt
        .contains("Tone: friendly."));

    tokio::time::timeout(Duration::from_secs(5), async {
        while store.interactions().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("interaction recorded");
    let interactions = store.interactions();
    assert_eq!(interactions[0].session_id, "s1");
    assert_eq!(interactions[0].answer, GOOD);
    assert_eq!(interactions[0].quality_score, None);
}

#[tokio::test]
async fn failing_preference_store_does_not_fail_the_request() {
    let generator = Arc::new(ScriptedGenerator::new().then_text(GOOD));
    let pipeline = AnswerPipeline::builder(generator, evidence())
        .config(config())
        .scorer(Arc::new(KeywordChunkScorer))
        .preferences(Arc::new(MemoryPreferenceStore::failing()))
        .build();

    let response = pipeline.answer(question().with_session("s1")).await;
    assert_eq!(response.status, AnswerStatus::Ok);
}

#[tokio::test]
async fn low_quality_answer_is_recorded_once() {
    let generator = Arc::new(ScriptedGenerator::new().then_text(GOOD));
    let quality = QualityOrchestra::new(
        Arc::new(FailingGenerator::new()),
        QualityConfig {
            refine: false,
            ..QualityConfig::default()
        },
    )
    .with_fact_checker(Arc::new(StubAgent::<FactCheck>::failing(
        0.3,
        &["Unsupported detail"],
    )))
    .with_coherence(Arc::new(StubAgent::<Coherence>::failing(0.4, &["Choppy"])))
    .with_validation(Arc::new(StubAgent::<Validation>::passing(0.9)));

    let mut config = config();
    config.quality.enabled = true;
    let pipeline = AnswerPipeline::builder(generator, evidence())
        .config(config)
        .scorer(Arc::new(KeywordChunkScorer))
        .quality(quality)
        .build();

    let response = pipeline.answer(question()).await;

    assert_eq!(response.status, AnswerStatus::Ok);
    let report = response.quality.expect("quality ran");
    assert!(!report.all_passed());

    let records = pipeline.ledger().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failure_kind, FailureKind::FactualGrounding);
    assert_eq!(records[0].agent_scores.fact_check, Some(0.3));
    assert_eq!(records[0].failure_details, vec!["Unsupported detail", "Choppy"]);
    assert_eq!(
        records[0].context["failure_kinds"],
        serde_json::json!(["factual_grounding", "coherence"])
    );
}

#[tokio::test]
async fn scorer_outage_is_not_recorded_as_a_quality_failure() {
    let generator = Arc::new(ScriptedGenerator::new().then_text(GOOD));
    let mut config = config();
    config.quality.enabled = true;
    let pipeline = AnswerPipeline::builder(generator, evidence())
        .config(config)
        .scorer(Arc::new(KeywordChunkScorer))
        .quality(QualityOrchestra::new(
            Arc::new(FailingGenerator::new()),
            QualityConfig::default(),
        ))
        .build();

    let response = pipeline.answer(question()).await;

    assert_eq!(response.status, AnswerStatus::Ok);
    let report = response.quality.expect("quality ran");
    assert!(report.fact_check.is_degraded());
    assert!(report.coherence.is_degraded());
    assert!(report.validation.is_degraded());
    assert!(pipeline.ledger().is_empty());
    assert_eq!(pipeline.ledger().stats().total_failures, 0);
}

#[tokio::test]
async fn only_scorers_that_ran_contribute_to_the_record() {
    let generator = Arc::new(ScriptedGenerator::new().then_text(GOOD));
    let quality = QualityOrchestra::new(
        Arc::new(FailingGenerator::new()),
        QualityConfig {
            refine: false,
            ..QualityConfig::default()
        },
    )
    .with_fact_checker(Arc::new(StubAgent::<FactCheck>::failing(
        0.3,
        &["Unsupported detail"],
    )));

    let mut config = config();
    config.quality.enabled = true;
    let pipeline = AnswerPipeline::builder(generator, evidence())
        .config(config)
        .scorer(Arc::new(KeywordChunkScorer))
        .quality(quality)
        .build();

    pipeline.answer(question()).await;

    let records = pipeline.ledger().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failure_kind, FailureKind::FactualGrounding);
    assert_eq!(records[0].agent_scores.fact_check, Some(0.3));
    assert_eq!(records[0].agent_scores.coherence, None);
    assert_eq!(records[0].agent_scores.validation, None);
    assert_eq!(
        records[0].context["failure_kinds"],
        serde_json::json!(["factual_grounding"])
    );

    let stats = pipeline.ledger().stats();
    assert_eq!(stats.mean_scores.coherence, None);
}
