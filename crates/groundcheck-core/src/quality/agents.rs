//! Quality agents backed by the generation service.
//!
//! Each agent sends one prompt, decodes the reply through
//! [`crate::decode`], and fills whatever the reply left out: a missing score
//! is scanned from prose (`score: 0.8`), then derived from the payload, then
//! defaulted to neutral. Transport errors are returned to the orchestra,
//! which turns them into a neutral result.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{AgentResult, Coherence, DraftContext, FactCheck, Summary, Validation, NEUTRAL_SCORE};
use crate::decode::{self, DecodeStrategy};
use crate::domain::GenerationError;
use crate::generation::{GenerationRequest, GenerationService};

/// A scorer that reads a draft and returns a typed verdict.
#[async_trait]
pub trait QualityAgent: Send + Sync {
    type Payload: Default + Send;

    fn name(&self) -> &'static str;

    async fn evaluate(
        &self,
        draft: &DraftContext<'_>,
    ) -> Result<AgentResult<Self::Payload>, GenerationError>;
}

/// Input to the single refinement pass.
#[derive(Debug, Clone, Copy)]
pub struct RefinementRequest<'a> {
    pub draft: DraftContext<'a>,
    pub issues: &'a [String],
}

/// Rewrites an answer to address scorer feedback.
#[async_trait]
pub trait Refiner: Send + Sync {
    async fn refine(&self, request: &RefinementRequest<'_>) -> Result<String, GenerationError>;
}

const FACT_CHECK_PROMPT: &str = "You check answers against evidence. List every factual claim \
in the answer as verified (directly supported by the evidence), unverified (not addressed by the \
evidence) or contradiction (conflicts with the evidence). Reply with JSON only: \
{\"score\": 0-1, \"confidence\": 0-1, \"verified_claims\": [], \"unverified_claims\": [], \
\"contradictions\": [], \"feedback\": []}";

const COHERENCE_PROMPT: &str = "You review answers for logical consistency and flow. Reply with \
JSON only: {\"score\": 0-1, \"confidence\": 0-1, \"flow_score\": 0-1, \"issues\": [], \
\"feedback\": []}";

const VALIDATION_PROMPT: &str = "You validate answers for completeness against the question and \
for accurate use of citations such as [Claim: id], [Quote: id] and [Source: url]. Reply with \
JSON only: {\"score\": 0-1, \"confidence\": 0-1, \"completeness_score\": 0-1, \
\"accuracy_score\": 0-1, \"citation_issues\": [], \"feedback\": []}";

const SUMMARY_PROMPT: &str = "Summarize the answer in two sentences and list its key points. \
Reply with JSON only: {\"summary\": \"...\", \"key_points\": []}";

const REFINE_PROMPT: &str = "You revise answers. Address every listed issue using only the \
evidence provided. Keep existing citation tokens that are still correct and do not invent new \
identifiers. Reply with the revised answer text only.";

fn draft_prompt(draft: &DraftContext<'_>) -> String {
    let mut prompt = format!("Question: {}\n\nEvidence:\n", draft.question);
    if draft.evidence_context.trim().is_empty() {
        prompt.push_str("(none)\n");
    } else {
        prompt.push_str(draft.evidence_context);
        prompt.push('\n');
    }
    prompt.push_str("\nAnswer:\n");
    prompt.push_str(draft.answer);
    prompt
}

fn unit(value: f64) -> Option<f64> {
    value.is_finite().then(|| value.clamp(0.0, 1.0))
}

/// Resolve a score: explicit field, then labelled prose, then `derived`.
fn resolve_score(explicit: Option<f64>, text: &str, derived: Option<f64>) -> f64 {
    explicit
        .and_then(unit)
        .or_else(|| decode::scan_labelled_score(text, "score"))
        .or_else(|| derived.and_then(unit))
        .unwrap_or(NEUTRAL_SCORE)
}

/// Confidence defaults lower when the reply was not structured at all.
fn resolve_confidence(explicit: Option<f64>, strategy: DecodeStrategy) -> f64 {
    explicit.and_then(unit).unwrap_or(if strategy.is_structured() {
        0.6
    } else {
        0.3
    })
}

fn push_unique(feedback: &mut Vec<String>, item: String) {
    let item = item.trim().to_string();
    if !item.is_empty() && !feedback.contains(&item) {
        feedback.push(item);
    }
}

async fn ask(
    generator: &dyn GenerationService,
    system: &str,
    user: String,
    max_tokens: u32,
) -> Result<String, GenerationError> {
    let request = GenerationRequest::new(system, user)
        .with_temperature(0.0)
        .with_max_tokens(max_tokens);
    Ok(generator.generate(request).await?.text)
}

// ---------------------------------------------------------------------------
// FactCheckAgent
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FactCheckReply {
    score: Option<f64>,
    confidence: Option<f64>,
    verified_claims: Vec<String>,
    unverified_claims: Vec<String>,
    contradictions: Vec<String>,
    feedback: Vec<String>,
}

pub struct FactCheckAgent {
    generator: Arc<dyn GenerationService>,
    pass_threshold: f64,
}

impl FactCheckAgent {
    pub fn new(generator: Arc<dyn GenerationService>, pass_threshold: f64) -> Self {
        Self {
            generator,
            pass_threshold,
        }
    }
}

#[async_trait]
impl QualityAgent for FactCheckAgent {
    type Payload = FactCheck;

    fn name(&self) -> &'static str {
        "fact_check"
    }

    async fn evaluate(
        &self,
        draft: &DraftContext<'_>,
    ) -> Result<AgentResult<FactCheck>, GenerationError> {
        let text = ask(
            self.generator.as_ref(),
            FACT_CHECK_PROMPT,
            draft_prompt(draft),
            800,
        )
        .await?;
        let decoded = decode::decode_or_default::<FactCheckReply>(&text);
        let reply = decoded.value;

        let total =
            reply.verified_claims.len() + reply.unverified_claims.len() + reply.contradictions.len();
        let derived = (total > 0).then(|| reply.verified_claims.len() as f64 / total as f64);
        let score = resolve_score(reply.score, &text, derived);

        let mut feedback = Vec::new();
        for item in reply.feedback {
            push_unique(&mut feedback, item);
        }
        for c in &reply.contradictions {
            push_unique(&mut feedback, format!("Contradicted by the evidence: {c}"));
        }
        for u in &reply.unverified_claims {
            push_unique(&mut feedback, format!("Not supported by the evidence: {u}"));
        }

        Ok(AgentResult {
            success: score >= self.pass_threshold,
            score,
            confidence: resolve_confidence(reply.confidence, decoded.strategy),
            feedback,
            payload: FactCheck {
                verified_claims: reply.verified_claims,
                unverified_claims: reply.unverified_claims,
                contradictions: reply.contradictions,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// CoherenceAgent
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CoherenceReply {
    score: Option<f64>,
    confidence: Option<f64>,
    flow_score: Option<f64>,
    issues: Vec<String>,
    feedback: Vec<String>,
}

pub struct CoherenceAgent {
    generator: Arc<dyn GenerationService>,
    pass_threshold: f64,
}

impl CoherenceAgent {
    pub fn new(generator: Arc<dyn GenerationService>, pass_threshold: f64) -> Self {
        Self {
            generator,
            pass_threshold,
        }
    }
}

#[async_trait]
impl QualityAgent for CoherenceAgent {
    type Payload = Coherence;

    fn name(&self) -> &'static str {
        "coherence"
    }

    async fn evaluate(
        &self,
        draft: &DraftContext<'_>,
    ) -> Result<AgentResult<Coherence>, GenerationError> {
        let text = ask(
            self.generator.as_ref(),
            COHERENCE_PROMPT,
            draft_prompt(draft),
            600,
        )
        .await?;
        let decoded = decode::decode_or_default::<CoherenceReply>(&text);
        let reply = decoded.value;

        let flow_score = reply
            .flow_score
            .and_then(unit)
            .or_else(|| decode::scan_labelled_score(&text, "flow"));
        let score = resolve_score(reply.score, &text, flow_score);

        let mut feedback = Vec::new();
        for item in reply.feedback.into_iter().chain(reply.issues.iter().cloned()) {
            push_unique(&mut feedback, item);
        }

        Ok(AgentResult {
            success: score >= self.pass_threshold,
            score,
            confidence: resolve_confidence(reply.confidence, decoded.strategy),
            feedback,
            payload: Coherence {
                issues: reply.issues,
                flow_score: flow_score.unwrap_or(score),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// ValidationAgent
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ValidationReply {
    score: Option<f64>,
    confidence: Option<f64>,
    completeness_score: Option<f64>,
    accuracy_score: Option<f64>,
    citation_issues: Vec<String>,
    feedback: Vec<String>,
}

pub struct ValidationAgent {
    generator: Arc<dyn GenerationService>,
    pass_threshold: f64,
}

impl ValidationAgent {
    pub fn new(generator: Arc<dyn GenerationService>, pass_threshold: f64) -> Self {
        Self {
            generator,
            pass_threshold,
        }
    }
}

#[async_trait]
impl QualityAgent for ValidationAgent {
    type Payload = Validation;

    fn name(&self) -> &'static str {
        "validation"
    }

    async fn evaluate(
        &self,
        draft: &DraftContext<'_>,
    ) -> Result<AgentResult<Validation>, GenerationError> {
        let text = ask(
            self.generator.as_ref(),
            VALIDATION_PROMPT,
            draft_prompt(draft),
            600,
        )
        .await?;
        let decoded = decode::decode_or_default::<ValidationReply>(&text);
        let reply = decoded.value;

        let completeness = reply
            .completeness_score
            .and_then(unit)
            .or_else(|| decode::scan_labelled_score(&text, "completeness"));
        let accuracy = reply
            .accuracy_score
            .and_then(unit)
            .or_else(|| decode::scan_labelled_score(&text, "accuracy"));
        let derived = match (completeness, accuracy) {
            (Some(c), Some(a)) => Some((c + a) / 2.0),
            (one, other) => one.or(other),
        };
        let score = resolve_score(reply.score, &text, derived);

        let mut feedback = Vec::new();
        for item in reply.feedback {
            push_unique(&mut feedback, item);
        }
        for issue in &reply.citation_issues {
            push_unique(&mut feedback, format!("Citation issue: {issue}"));
        }
        if let Some(c) = completeness.filter(|c| *c < self.pass_threshold) {
            push_unique(
                &mut feedback,
                format!("The answer does not fully address the question (completeness {c:.2})."),
            );
        }

        Ok(AgentResult {
            success: score >= self.pass_threshold,
            score,
            confidence: resolve_confidence(reply.confidence, decoded.strategy),
            feedback,
            payload: Validation {
                citation_issues: reply.citation_issues,
                completeness_score: completeness.unwrap_or(score),
                accuracy_score: accuracy.unwrap_or(score),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// SummarizationAgent
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SummaryReply {
    summary: String,
    key_points: Vec<String>,
}

pub struct SummarizationAgent {
    generator: Arc<dyn GenerationService>,
}

impl SummarizationAgent {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl QualityAgent for SummarizationAgent {
    type Payload = Summary;

    fn name(&self) -> &'static str {
        "summarization"
    }

    async fn evaluate(
        &self,
        draft: &DraftContext<'_>,
    ) -> Result<AgentResult<Summary>, GenerationError> {
        let text = ask(
            self.generator.as_ref(),
            SUMMARY_PROMPT,
            format!("Answer:\n{}", draft.answer),
            300,
        )
        .await?;
        let decoded = decode::decode_or_default::<SummaryReply>(&text);
        let mut reply = decoded.value;
        // Unstructured reply: the prose itself is the summary.
        if !decoded.strategy.is_structured() {
            reply.summary = text.trim().to_string();
        }
        let produced = !reply.summary.trim().is_empty();

        Ok(AgentResult {
            success: produced,
            score: if produced { 1.0 } else { 0.0 },
            confidence: resolve_confidence(None, decoded.strategy),
            feedback: Vec::new(),
            payload: Summary {
                summary: reply.summary.trim().to_string(),
                key_points: reply.key_points,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// LlmRefiner
// ---------------------------------------------------------------------------

pub struct LlmRefiner {
    generator: Arc<dyn GenerationService>,
    max_tokens: u32,
}

impl LlmRefiner {
    pub fn new(generator: Arc<dyn GenerationService>, max_tokens: u32) -> Self {
        Self {
            generator,
            max_tokens,
        }
    }
}

#[async_trait]
impl Refiner for LlmRefiner {
    async fn refine(&self, request: &RefinementRequest<'_>) -> Result<String, GenerationError> {
        let mut prompt = draft_prompt(&request.draft);
        prompt.push_str("\n\nIssues to address:\n");
        for issue in request.issues {
            prompt.push_str("- ");
            prompt.push_str(issue);
            prompt.push('\n');
        }
        let text = ask(
            self.generator.as_ref(),
            REFINE_PROMPT,
            prompt,
            self.max_tokens,
        )
        .await?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Preferences;
    use crate::fakes::ScriptedGenerator;

    fn draft<'a>(prefs: &'a Preferences) -> DraftContext<'a> {
        DraftContext {
            answer: "Paris is the capital of France. [Claim: c1]",
            question: "What is the capital of France?",
            evidence_context: "[Claim: c1] Paris is the capital of France.",
            preferences: prefs,
        }
    }

    #[tokio::test]
    async fn test_fact_check_derives_score_from_claims() {
        let generator = Arc::new(ScriptedGenerator::new().then_text(
            r#"{"verified_claims": ["a", "b", "c"], "unverified_claims": ["d"]}"#,
        ));
        let agent = FactCheckAgent::new(generator, 0.7);
        let prefs = Preferences::default();
        let result = agent.evaluate(&draft(&prefs)).await.unwrap();
        assert!((result.score - 0.75).abs() < 1e-9);
        assert!(result.success);
        assert_eq!(result.feedback, vec!["Not supported by the evidence: d"]);
    }

    #[tokio::test]
    async fn test_coherence_scans_prose_score() {
        let generator =
            Arc::new(ScriptedGenerator::new().then_text("Overall score: 40/100. Jumps around."));
        let agent = CoherenceAgent::new(generator, 0.7);
        let prefs = Preferences::default();
        let result = agent.evaluate(&draft(&prefs)).await.unwrap();
        assert!((result.score - 0.4).abs() < 1e-9);
        assert!(!result.success);
        assert!((result.confidence - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_validation_flags_incomplete_answer() {
        let generator = Arc::new(ScriptedGenerator::new().then_text(
            "```json\n{\"completeness_score\": 0.4, \"accuracy_score\": 0.9, \
             \"citation_issues\": [\"c2 unused\"]}\n```",
        ));
        let agent = ValidationAgent::new(generator, 0.7);
        let prefs = Preferences::default();
        let result = agent.evaluate(&draft(&prefs)).await.unwrap();
        assert!((result.score - 0.65).abs() < 1e-9);
        assert_eq!(result.feedback.len(), 2);
        assert_eq!(result.payload.citation_issues, vec!["c2 unused"]);
    }

    #[tokio::test]
    async fn test_summary_falls_back_to_prose() {
        let generator = Arc::new(ScriptedGenerator::new().then_text("Paris is the capital."));
        let agent = SummarizationAgent::new(generator);
        let prefs = Preferences::default();
        let result = agent.evaluate(&draft(&prefs)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.payload.summary, "Paris is the capital.");
    }
}
