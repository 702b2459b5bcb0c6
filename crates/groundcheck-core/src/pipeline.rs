//! The answer pipeline: selection, generation, citation enforcement,
//! quality scoring, failure recording and caching, in that order.
//!
//! [`AnswerPipeline::answer`] never returns an error. Collaborator failures
//! degrade the input (no evidence, default preferences, neutral scores);
//! only a failed primary generation produces an apologetic answer with
//! [`AnswerStatus::Error`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{warn, Instrument};
use uuid::Uuid;

use crate::cache::{cache_key, ResponseCache};
use crate::citation::{extract_citations, CitationGuard, GuardOutcome};
use crate::config::PipelineConfig;
use crate::domain::{
    Allowlist, AnswerRequest, CitationToken, EvidenceChunk, GenerationError, Preferences,
};
use crate::generation::{generate_with_timeout, GenerationRequest, GenerationService};
use crate::ledger::{AgentScores, FailureKind, FailureLedger, FailureRecord};
use crate::metrics::Metrics;
use crate::obs::{self, RequestSpan};
use crate::preferences::{Interaction, NoopPreferenceStore, PreferenceStore};
use crate::prompts;
use crate::quality::{QualityOrchestra, QualityReport};
use crate::retrieval::{RetrievalQuery, RetrievalService};
use crate::selector::{ChunkScorer, EvidenceSelector, LlmChunkScorer, Selection};

const APOLOGY: &str = "I'm sorry, I couldn't produce an answer right now. Please try again in a \
                       moment.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerStatus {
    Ok,
    /// Delivered with a warning banner: citations still failed verification.
    Flagged,
    /// Primary generation failed; `answer` is an apology.
    Error,
}

impl AnswerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Flagged => "flagged",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionStats {
    pub candidates: usize,
    pub selected: usize,
    pub excluded: usize,
    pub total_tokens: usize,
    pub used_fallback: bool,
    pub forced: bool,
}

impl SelectionStats {
    fn from_selection(candidates: usize, selection: &Selection) -> Self {
        Self {
            candidates,
            selected: selection.selected.len(),
            excluded: selection.excluded.len(),
            total_tokens: selection.total_tokens,
            used_fallback: selection.used_fallback,
            forced: selection.forced,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub request_id: String,
    /// Final text, warning banner included.
    pub answer: String,
    pub status: AnswerStatus,
    /// Citation tokens in the final text, in order of appearance.
    pub citations: Vec<CitationToken>,
    pub regenerated: bool,
    pub warning: Option<String>,
    pub quality: Option<QualityReport>,
    pub selection: SelectionStats,
    /// The accepted draft hit the output token limit.
    pub truncated: bool,
    /// Served from the response cache.
    #[serde(default)]
    pub cached: bool,
}

struct PipelineInner {
    generator: Arc<dyn GenerationService>,
    retrieval: Arc<dyn RetrievalService>,
    preferences: Arc<dyn PreferenceStore>,
    selector: EvidenceSelector,
    guard: CitationGuard,
    quality: QualityOrchestra,
    ledger: Arc<FailureLedger>,
    cache: ResponseCache<AnswerResponse>,
    metrics: Arc<Metrics>,
    config: PipelineConfig,
}

/// Cloning is cheap; clones share ledger, cache and metrics.
#[derive(Clone)]
pub struct AnswerPipeline {
    inner: Arc<PipelineInner>,
}

/// Assembles an [`AnswerPipeline`]; anything not set gets a default built
/// from the generator and config.
pub struct PipelineBuilder {
    generator: Arc<dyn GenerationService>,
    retrieval: Arc<dyn RetrievalService>,
    config: PipelineConfig,
    preferences: Option<Arc<dyn PreferenceStore>>,
    scorer: Option<Arc<dyn ChunkScorer>>,
    quality: Option<QualityOrchestra>,
    ledger: Option<Arc<FailureLedger>>,
    cache: Option<ResponseCache<AnswerResponse>>,
    metrics: Option<Arc<Metrics>>,
}

impl PipelineBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn preferences(mut self, store: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = Some(store);
        self
    }

    pub fn scorer(mut self, scorer: Arc<dyn ChunkScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn quality(mut self, orchestra: QualityOrchestra) -> Self {
        self.quality = Some(orchestra);
        self
    }

    pub fn ledger(mut self, ledger: Arc<FailureLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn cache(mut self, cache: ResponseCache<AnswerResponse>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> AnswerPipeline {
        let config = self.config;
        let scorer = self.scorer.unwrap_or_else(|| {
            Arc::new(LlmChunkScorer::new(
                self.generator.clone(),
                Duration::from_millis(config.selector.scoring_timeout_ms),
            ))
        });
        let quality = self.quality.unwrap_or_else(|| {
            QualityOrchestra::new(self.generator.clone(), config.quality.clone())
        });

        AnswerPipeline {
            inner: Arc::new(PipelineInner {
                selector: EvidenceSelector::new(scorer, config.selector.clone()),
                guard: CitationGuard::new(self.generator.clone(), config.citation.clone()),
                quality,
                preferences: self
                    .preferences
                    .unwrap_or_else(|| Arc::new(NoopPreferenceStore)),
                ledger: self
                    .ledger
                    .unwrap_or_else(|| Arc::new(FailureLedger::new(config.ledger.clone()))),
                cache: self
                    .cache
                    .unwrap_or_else(|| ResponseCache::new(&config.cache)),
                metrics: self.metrics.unwrap_or_default(),
                generator: self.generator,
                retrieval: self.retrieval,
                config,
            }),
        }
    }
}

impl AnswerPipeline {
    pub fn builder(
        generator: Arc<dyn GenerationService>,
        retrieval: Arc<dyn RetrievalService>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            generator,
            retrieval,
            config: PipelineConfig::default(),
            preferences: None,
            scorer: None,
            quality: None,
            ledger: None,
            cache: None,
            metrics: None,
        }
    }

    pub fn ledger(&self) -> &Arc<FailureLedger> {
        &self.inner.ledger
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn cache(&self) -> &ResponseCache<AnswerResponse> {
        &self.inner.cache
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Answer `request`, serving from and filling the response cache.
    pub async fn answer(&self, request: AnswerRequest) -> AnswerResponse {
        let inner = &self.inner;
        inner.metrics.inc_requests();
        if !inner.config.cache.enabled {
            return inner.run(request).await;
        }

        let key = cache_key(&request);
        if let Some(mut hit) = inner.cache.get(&key) {
            inner.metrics.inc_cache_hits();
            obs::emit_cache_hit(&key);
            hit.cached = true;
            return hit;
        }
        inner.metrics.inc_cache_misses();
        obs::emit_cache_miss(&key);

        let shared = Arc::clone(inner);
        let pending = request.clone();
        let computed = inner
            .cache
            .get_or_create_if(
                &key,
                move || async move { Ok(shared.run(pending).await) },
                None,
                |response: &AnswerResponse| response.status != AnswerStatus::Error,
            )
            .await;
        match computed {
            Ok(response) => response,
            Err(e) => {
                // `run` never returns an error, so this branch is not expected.
                warn!(error = %e, "cached answer computation failed, answering directly");
                inner.run(request).await
            }
        }
    }
}

impl PipelineInner {
    async fn run(&self, request: AnswerRequest) -> AnswerResponse {
        let request_id = Uuid::new_v4().to_string();
        let span = RequestSpan::span(&request_id);
        self.run_request(request, request_id).instrument(span).await
    }

    async fn run_request(&self, request: AnswerRequest, request_id: String) -> AnswerResponse {
        let started = Instant::now();
        let strict = request.strict_citations || self.config.citation.strict_by_default;
        obs::emit_request_started(&request_id, request.mode.as_str(), strict);

        let (chunks, stored) =
            tokio::join!(self.retrieve(&request), self.load_preferences(&request));
        let preferences = request.preferences.clone().merged_with(stored);

        let budget = request
            .token_budget
            .unwrap_or(self.config.generation.default_token_budget);
        let selection = self.selector.select(&chunks, &request.question, budget).await;
        let selection_stats = SelectionStats::from_selection(chunks.len(), &selection);
        obs::emit_selection(
            chunks.len(),
            selection.selected.len(),
            selection.total_tokens,
            selection.used_fallback,
        );

        let allowlist = Allowlist::from_selected(&selection.selected);
        let generation =
            self.generation_request(&request, &selection, &allowlist, &preferences, strict);
        let timeout = Duration::from_millis(self.config.timeouts.generation_ms);

        let attempt =
            generate_with_timeout(self.generator.as_ref(), generation.clone(), timeout).await;
        let draft = match attempt {
            Ok(draft) if !draft.text.trim().is_empty() => draft,
            Ok(_) => {
                let e = GenerationError::Malformed("empty completion".into());
                return self.failed(&request, request_id, selection_stats, e, started);
            }
            Err(e) => return self.failed(&request, request_id, selection_stats, e, started),
        };

        let outcome = self.guard.enforce(draft, &allowlist, &generation, strict).await;
        if outcome.regenerations > 0 {
            self.metrics.inc_regenerations();
        }

        let quality = if self.config.quality.enabled {
            let context = prompts::evidence_context(&selection.selected);
            let report = self
                .quality
                .run_quality(
                    &outcome.answer,
                    &request.question,
                    &context,
                    &preferences,
                    Some(&allowlist),
                )
                .await;
            if report.refined {
                self.metrics.inc_refinements();
            }
            Some(report)
        } else {
            None
        };

        let body = quality
            .as_ref()
            .map(|q| q.answer.clone())
            .unwrap_or_else(|| outcome.answer.clone());
        self.record_failures(
            &request,
            &request_id,
            &body,
            &outcome,
            quality.as_ref(),
            &selection_stats,
        );

        let status = if outcome.warning.is_some() {
            AnswerStatus::Flagged
        } else {
            AnswerStatus::Ok
        };
        let answer = match &outcome.warning {
            Some(banner) => format!("{banner}\n\n{body}"),
            None => body.clone(),
        };

        self.spawn_interaction(&request, &body, quality.as_ref());
        obs::emit_request_finished(&request_id, status.as_str(), elapsed_ms(started));
        self.metrics.flush();

        AnswerResponse {
            request_id,
            citations: extract_citations(&body),
            answer,
            status,
            regenerated: outcome.regenerations > 0,
            warning: outcome.warning,
            quality,
            selection: selection_stats,
            truncated: outcome.truncated,
            cached: false,
        }
    }

    /// Evidence chunks, or none when retrieval fails or times out.
    async fn retrieve(&self, request: &AnswerRequest) -> Vec<EvidenceChunk> {
        let query = RetrievalQuery {
            question: request.question.clone(),
            session_id: request.session_id.clone(),
            graph_id: request.graph_id.clone(),
        };
        let timeout = Duration::from_millis(self.config.timeouts.retrieval_ms);
        match tokio::time::timeout(timeout, self.retrieval.retrieve(&query)).await {
            Ok(Ok(evidence)) => evidence.into_chunks(),
            Ok(Err(e)) => {
                obs::emit_stage_degraded("retrieval", &e);
                Vec::new()
            }
            Err(_elapsed) => {
                obs::emit_stage_degraded("retrieval", &"timed out");
                Vec::new()
            }
        }
    }

    /// Stored preferences for the session, or defaults.
    async fn load_preferences(&self, request: &AnswerRequest) -> Preferences {
        let Some(session_id) = request.session_id.as_deref() else {
            return Preferences::default();
        };
        let timeout = Duration::from_millis(self.config.timeouts.preferences_ms);
        match tokio::time::timeout(timeout, self.preferences.load(session_id)).await {
            Ok(Ok(preferences)) => preferences,
            Ok(Err(e)) => {
                obs::emit_stage_degraded("preferences", &e);
                Preferences::default()
            }
            Err(_elapsed) => {
                obs::emit_stage_degraded("preferences", &"timed out");
                Preferences::default()
            }
        }
    }

    fn generation_request(
        &self,
        request: &AnswerRequest,
        selection: &Selection,
        allowlist: &Allowlist,
        preferences: &Preferences,
        strict: bool,
    ) -> GenerationRequest {
        let system = prompts::system_prompt(
            &selection.selected,
            allowlist,
            request.mode,
            preferences,
            strict,
        );
        let max_tokens =
            (self.config.generation.max_tokens as f32 * request.mode.max_tokens_factor()).round();
        GenerationRequest::new(system, request.question.clone())
            .with_temperature(self.config.generation.temperature)
            .with_max_tokens((max_tokens as u32).max(64))
    }

    fn failed(
        &self,
        request: &AnswerRequest,
        request_id: String,
        selection: SelectionStats,
        error: GenerationError,
        started: Instant,
    ) -> AnswerResponse {
        obs::emit_stage_degraded("generation", &error);
        self.ledger.record(
            FailureRecord::new(&request.question, "", FailureKind::GenerationFailed)
                .with_details(vec![error.to_string()])
                .with_context(serde_json::json!({
                    "request_id": request_id,
                    "mode": request.mode.as_str(),
                    "evidence_selected": selection.selected,
                })),
        );
        self.metrics.inc_failures_recorded();
        obs::emit_request_finished(&request_id, AnswerStatus::Error.as_str(), elapsed_ms(started));
        self.metrics.flush();

        AnswerResponse {
            request_id,
            answer: APOLOGY.to_string(),
            status: AnswerStatus::Error,
            citations: Vec::new(),
            regenerated: false,
            warning: None,
            quality: None,
            selection,
            truncated: false,
            cached: false,
        }
    }

    /// One ledger record per request, keyed by its most severe failure.
    fn record_failures(
        &self,
        request: &AnswerRequest,
        request_id: &str,
        body: &str,
        outcome: &GuardOutcome,
        quality: Option<&QualityReport>,
        selection: &SelectionStats,
    ) {
        let mut kinds = Vec::new();
        let mut details = Vec::new();

        if !outcome.report.ok {
            let invalid = outcome.report.verification.invalid.tokens();
            if invalid.is_empty() {
                kinds.push(FailureKind::CitationDensity);
            } else {
                kinds.push(FailureKind::InvalidCitations);
                details.extend(invalid.iter().map(|t| format!("invalid citation {t}")));
            }
            if let Some(density) = outcome.report.density.as_ref().filter(|d| !d.passes) {
                if !kinds.contains(&FailureKind::CitationDensity) {
                    kinds.push(FailureKind::CitationDensity);
                }
                details.push(format!(
                    "{} of {} sentences cited",
                    density.cited_sentences, density.total_sentences
                ));
            }
        }

        let mut scores = AgentScores::default();
        if let Some(report) = quality {
            scores = AgentScores {
                fact_check: report.fact_check.measured_score(),
                coherence: report.coherence.measured_score(),
                validation: report.validation.measured_score(),
            };
            // A scorer that errored or timed out is an outage, not a verdict.
            let fact_check = scores.fact_check.map(|_| report.fact_check.success);
            let coherence = scores.coherence.map(|_| report.coherence.success);
            let validation = scores.validation.map(|_| report.validation.success);
            for (verdict, kind) in [
                (fact_check, FailureKind::FactualGrounding),
                (coherence, FailureKind::Coherence),
                (validation, FailureKind::Completeness),
            ] {
                if verdict == Some(false) {
                    kinds.push(kind);
                }
            }
            details.extend(report.residual_feedback.iter().cloned());
        }

        let Some(primary) = kinds.first().copied() else {
            return;
        };
        self.ledger.record(
            FailureRecord::new(&request.question, body, primary)
                .with_details(details)
                .with_scores(scores)
                .with_context(serde_json::json!({
                    "request_id": request_id,
                    "mode": request.mode.as_str(),
                    "strict": request.strict_citations,
                    "failure_kinds": kinds,
                    "regenerations": outcome.regenerations,
                    "refined": quality.map(|q| q.refined).unwrap_or(false),
                    "evidence_selected": selection.selected,
                    "evidence_fallback": selection.used_fallback,
                })),
        );
        self.metrics.inc_failures_recorded();
    }

    /// Best-effort feedback to the preference store; never awaited.
    fn spawn_interaction(
        &self,
        request: &AnswerRequest,
        body: &str,
        quality: Option<&QualityReport>,
    ) {
        let Some(session_id) = request.session_id.clone() else {
            return;
        };
        let store = Arc::clone(&self.preferences);
        let interaction = Interaction {
            session_id,
            question: request.question.clone(),
            answer: body.to_string(),
            quality_score: quality.map(QualityReport::overall_score),
            timestamp: chrono::Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = store.record_interaction(interaction).await {
                warn!(error = %e, "recording interaction failed");
            }
        });
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
