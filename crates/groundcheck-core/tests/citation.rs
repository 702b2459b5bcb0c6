use std::sync::Arc;

use groundcheck_core::citation::{citation_density, CitationGuard};
use groundcheck_core::fakes::{FailingGenerator, ScriptedGenerator};
use groundcheck_core::{
    verify, verify_with, Allowlist, ChunkKind, CitationConfig, CitationKind, CitationToken,
    EvidenceChunk, GenerationRequest, GenerationResponse, VerifyOptions,
};

fn allowlist() -> Allowlist {
    Allowlist::from_chunks(&[
        EvidenceChunk::new(ChunkKind::Claim, "Paris is the capital of France.").with_id("c1"),
        EvidenceChunk::new(ChunkKind::Quote, "\"Paris is always a good idea\"").with_id("q1"),
        EvidenceChunk::new(ChunkKind::Source, "Paris").with_id("https://example.org/paris"),
        EvidenceChunk::new(ChunkKind::Concept, "Capital city").with_id("concept-1"),
    ])
}

fn original() -> GenerationRequest {
    GenerationRequest::new("You answer questions using only the evidence.", "Capital of France?")
}

#[test]
fn answer_without_tokens_verifies() {
    let v = verify("Paris is lovely in spring.", &allowlist());
    assert!(v.ok);
    assert!(v.citations.is_empty());
}

#[test]
fn unknown_identifier_fails_and_is_listed() {
    let v = verify(
        "Paris is the capital of France. [Claim: c1] It has 2 million people. [Claim: c99]",
        &allowlist(),
    );
    assert!(!v.ok);
    assert_eq!(v.invalid.claims, vec!["c99"]);
    assert_eq!(v.citations.len(), 2);
}

#[test]
fn each_kind_is_checked_against_its_own_set() {
    let list = allowlist();
    assert!(verify("[Quote: q1] [Source: https://example.org/paris]", &list).ok);
    // right id, wrong kind
    let v = verify("[Quote: c1]", &list);
    assert_eq!(v.invalid.quotes, vec!["c1"]);
    // non-citable chunk ids never reach the allowlist
    assert!(!verify("[Claim: concept-1]", &list).ok);
}

#[test]
fn verify_is_pure() {
    let list = allowlist();
    let text = "Paris. [Claim: c1] [Claim: c2]";
    let first = verify(text, &list);
    let second = verify(text, &list);
    assert_eq!(first, second);
    assert_eq!(list, allowlist());
}

#[test]
fn density_counts_cited_sentences() {
    let report = citation_density(
        "Paris is the capital of France. [Claim: c1] It hosted the 1900 Olympics. \
         The city is pleasant.",
        0.5,
    );
    assert_eq!(report.total_sentences, 3);
    assert_eq!(report.cited_sentences, 1);
    assert!(!report.uncited_requiring.is_empty());
}

#[test]
fn strict_mode_applies_density_only_when_asked() {
    let text = "Paris is the capital of France. Berlin is the capital of Germany.";
    let list = allowlist();
    let lenient = verify_with(text, &list, VerifyOptions::default(), 0.5);
    assert!(lenient.ok);
    assert!(lenient.density.is_none());

    let strict = verify_with(
        text,
        &list,
        VerifyOptions {
            strict: true,
            truncated: false,
        },
        0.5,
    );
    assert!(!strict.ok);

    let truncated = verify_with(
        text,
        &list,
        VerifyOptions {
            strict: true,
            truncated: true,
        },
        0.5,
    );
    assert!(truncated.ok);
}

#[tokio::test]
async fn valid_draft_needs_no_regeneration() {
    let generator = Arc::new(ScriptedGenerator::new());
    let guard = CitationGuard::new(generator.clone(), CitationConfig::default());
    let outcome = guard
        .enforce(
            GenerationResponse::stop("Paris is the capital of France. [Claim: c1]"),
            &allowlist(),
            &original(),
            false,
        )
        .await;
    assert!(outcome.report.ok);
    assert_eq!(outcome.regenerations, 0);
    assert!(outcome.warning.is_none());
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn invalid_draft_is_regenerated_once() {
    let generator = Arc::new(
        ScriptedGenerator::new().then_text("Paris is the capital of France. [Claim: c1]"),
    );
    let guard = CitationGuard::new(generator.clone(), CitationConfig::default());
    let outcome = guard
        .enforce(
            GenerationResponse::stop("Paris is the capital of France. [Claim: c99]"),
            &allowlist(),
            &original(),
            false,
        )
        .await;
    assert!(outcome.report.ok);
    assert_eq!(outcome.regenerations, 1);
    assert!(outcome.warning.is_none());
    assert!(!outcome.initial_report.unwrap().ok);

    let requests = generator.requests();
    assert_eq!(requests.len(), 1);
    let reminder = requests[0].last_user_message().unwrap();
    assert!(reminder.contains("[Claim: c99]"));
    assert!(reminder.contains("[Claim: c1]"));
}

#[tokio::test]
async fn second_failure_is_flagged_not_retried() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .then_text("Still wrong. [Claim: c42]")
            .then_text("Would be a third attempt. [Claim: c1]"),
    );
    let guard = CitationGuard::new(generator.clone(), CitationConfig::default());
    let outcome = guard
        .enforce(
            GenerationResponse::stop("Wrong. [Claim: c99]"),
            &allowlist(),
            &original(),
            false,
        )
        .await;
    assert!(!outcome.report.ok);
    assert_eq!(outcome.regenerations, 1);
    assert_eq!(generator.calls(), 1);
    assert_eq!(generator.remaining(), 1);
    assert_eq!(outcome.answer, "Still wrong. [Claim: c42]");
    assert!(outcome.rendered().starts_with(&CitationConfig::default().warning_banner));
    assert_eq!(
        outcome.report.verification.invalid.tokens(),
        vec![CitationToken::new(CitationKind::Claim, "c42")]
    );
}

#[tokio::test]
async fn failed_regeneration_keeps_first_draft_with_banner() {
    let generator = Arc::new(FailingGenerator::new());
    let guard = CitationGuard::new(generator.clone(), CitationConfig::default());
    let outcome = guard
        .enforce(
            GenerationResponse::stop("Wrong. [Claim: c99]"),
            &allowlist(),
            &original(),
            false,
        )
        .await;
    assert_eq!(outcome.answer, "Wrong. [Claim: c99]");
    assert_eq!(outcome.regenerations, 1);
    assert_eq!(generator.calls(), 1);
    assert!(outcome.warning.is_some());
}

#[tokio::test]
async fn strict_density_failure_triggers_regeneration() {
    let generator = Arc::new(ScriptedGenerator::new().then_text(
        "Paris is the capital of France. [Claim: c1] It sits on the Seine. [Claim: c1]",
    ));
    let guard = CitationGuard::new(generator.clone(), CitationConfig::default());
    let outcome = guard
        .enforce(
            GenerationResponse::stop(
                "Paris is the capital of France. It sits on the Seine. Paris is old.",
            ),
            &allowlist(),
            &original(),
            true,
        )
        .await;
    assert_eq!(outcome.regenerations, 1);
    assert!(outcome.report.ok);
    let reminder = generator.requests()[0]
        .last_user_message()
        .unwrap()
        .to_string();
    assert!(reminder.contains("sentences carried a citation"));
}
