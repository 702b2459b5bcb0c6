//! Evidence chunk selection under a token budget.
//!
//! Every candidate chunk is scored for relevance to the question from a
//! fixed-length preview, sorted by score (stable), and greedily packed until
//! 90% of the token budget is used. Scoring failures degrade to a neutral
//! score for every chunk; selection itself never fails.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::decode;
use crate::domain::{ChunkKind, EvidenceChunk, GenerationError, ScoredChunk};
use crate::generation::{generate_with_timeout, GenerationRequest, GenerationService};

/// Selector tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Characters of content shown to the scorer per chunk.
    pub preview_chars: usize,
    /// Fraction of the token budget evidence may occupy.
    pub budget_ratio: f64,
    /// Score assigned to every chunk when scoring fails.
    pub neutral_score: f64,
    pub scoring_timeout_ms: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            preview_chars: 200,
            budget_ratio: 0.9,
            neutral_score: 0.5,
            scoring_timeout_ms: 15_000,
        }
    }
}

/// What the scorer sees of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPreview {
    pub index: usize,
    pub kind: ChunkKind,
    pub text: String,
}

/// Score assigned to the chunk at `index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkScore {
    pub index: usize,
    pub score: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Errors a scorer may report. The selector absorbs all of them.
#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    #[error("scoring generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("malformed scoring output: {0}")]
    Malformed(String),
}

/// Relevance scorer for evidence previews.
#[async_trait]
pub trait ChunkScorer: Send + Sync {
    async fn score(
        &self,
        query: &str,
        previews: &[ChunkPreview],
    ) -> Result<Vec<ChunkScore>, ScoringError>;
}

/// Output of one selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Chosen chunks, highest score first.
    pub selected: Vec<ScoredChunk>,
    /// Estimated tokens of `selected`.
    pub total_tokens: usize,
    /// Chunks that did not fit, in score order.
    pub excluded: Vec<ScoredChunk>,
    /// Scores are the neutral fallback rather than scorer output.
    pub used_fallback: bool,
    /// The single top chunk was accepted despite exceeding the budget.
    pub forced: bool,
}

impl Selection {
    pub fn selected_chunks(&self) -> impl Iterator<Item = &EvidenceChunk> {
        self.selected.iter().map(|s| &s.chunk)
    }
}

/// Scores and packs evidence for one request.
pub struct EvidenceSelector {
    scorer: Arc<dyn ChunkScorer>,
    config: SelectorConfig,
}

impl EvidenceSelector {
    pub fn new(scorer: Arc<dyn ChunkScorer>, config: SelectorConfig) -> Self {
        Self { scorer, config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Select chunks for `query` within `token_budget`.
    ///
    /// Never empty for non-empty input.
    pub async fn select(
        &self,
        chunks: &[EvidenceChunk],
        query: &str,
        token_budget: usize,
    ) -> Selection {
        if chunks.is_empty() {
            return Selection::default();
        }

        let previews: Vec<ChunkPreview> = chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| ChunkPreview {
                index,
                kind: chunk.kind,
                text: chunk.preview(self.config.preview_chars),
            })
            .collect();

        let timeout = Duration::from_millis(self.config.scoring_timeout_ms);
        let outcome = match tokio::time::timeout(timeout, self.scorer.score(query, &previews)).await
        {
            Ok(Ok(scores)) => apply_scores(chunks, scores).map_err(ScoringError::Malformed),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Err(ScoringError::Generation(GenerationError::Timeout {
                timeout_ms: self.config.scoring_timeout_ms,
            })),
        };

        let (scored, used_fallback) = match outcome {
            Ok(scored) => (scored, false),
            Err(e) => {
                warn!(
                    error = %e,
                    chunks = chunks.len(),
                    "chunk scoring failed, using neutral scores"
                );
                (neutral_scores(chunks, self.config.neutral_score), true)
            }
        };

        let mut selection = pack_within_budget(scored, token_budget, self.config.budget_ratio);
        selection.used_fallback = used_fallback;
        debug!(
            selected = selection.selected.len(),
            excluded = selection.excluded.len(),
            total_tokens = selection.total_tokens,
            forced = selection.forced,
            "evidence selected"
        );
        selection
    }
}

/// Attach scores to chunks and sort descending (stable).
///
/// Rejects output that does not score every chunk exactly once.
fn apply_scores(
    chunks: &[EvidenceChunk],
    scores: Vec<ChunkScore>,
) -> Result<Vec<ScoredChunk>, String> {
    if scores.len() != chunks.len() {
        return Err(format!(
            "expected {} scores, got {}",
            chunks.len(),
            scores.len()
        ));
    }

    let mut seen = HashSet::new();
    let mut slots: Vec<Option<ChunkScore>> = vec![None; chunks.len()];
    for score in scores {
        if score.index >= chunks.len() {
            return Err(format!("score index {} out of range", score.index));
        }
        if !score.score.is_finite() {
            return Err(format!("non-finite score for index {}", score.index));
        }
        if !seen.insert(score.index) {
            return Err(format!("duplicate score for index {}", score.index));
        }
        let index = score.index;
        slots[index] = Some(score);
    }

    let mut scored: Vec<ScoredChunk> = chunks
        .iter()
        .zip(slots)
        .filter_map(|(chunk, slot)| {
            slot.map(|s| ScoredChunk {
                chunk: chunk.clone(),
                score: s.score.clamp(0.0, 1.0),
                reasoning: s.reasoning,
            })
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    Ok(scored)
}

fn neutral_scores(chunks: &[EvidenceChunk], neutral: f64) -> Vec<ScoredChunk> {
    chunks
        .iter()
        .map(|chunk| ScoredChunk {
            chunk: chunk.clone(),
            score: neutral,
            reasoning: "scoring unavailable; neutral priority".to_string(),
        })
        .collect()
}

/// Greedily pack `scored` (already in priority order) into `ratio * budget` tokens.
///
/// Chunks that don't fit are excluded and packing continues with the next
/// one. When nothing fits, the top chunk is accepted on its own.
pub fn pack_within_budget(scored: Vec<ScoredChunk>, budget: usize, ratio: f64) -> Selection {
    let limit = (budget as f64 * ratio).floor() as usize;
    let mut selected = Vec::new();
    let mut excluded = Vec::new();
    let mut total_tokens = 0usize;

    for chunk in scored {
        let tokens = chunk.estimated_tokens();
        if total_tokens + tokens <= limit {
            total_tokens += tokens;
            selected.push(chunk);
        } else {
            excluded.push(chunk);
        }
    }

    let mut forced = false;
    if selected.is_empty() && !excluded.is_empty() {
        let top = excluded.remove(0);
        total_tokens = top.estimated_tokens();
        selected.push(top);
        forced = true;
    }

    Selection {
        selected,
        total_tokens,
        excluded,
        used_fallback: false,
        forced,
    }
}

const SCORER_SYSTEM_PROMPT: &str = "You rate how relevant each evidence snippet is to a \
user question. Reply with only a JSON array, one object per snippet: \
[{\"index\": <n>, \"score\": <0.0-1.0>, \"reasoning\": \"<one line>\"}].";

#[derive(Deserialize)]
#[serde(untagged)]
enum ScoreEnvelope {
    List(Vec<ChunkScore>),
    Wrapped { scores: Vec<ChunkScore> },
}

/// Scores chunks by asking the generation service.
pub struct LlmChunkScorer {
    generator: Arc<dyn GenerationService>,
    timeout: Duration,
}

impl LlmChunkScorer {
    pub fn new(generator: Arc<dyn GenerationService>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    fn prompt(query: &str, previews: &[ChunkPreview]) -> String {
        let mut prompt = format!("Question: {query}\n\nSnippets:\n");
        for p in previews {
            prompt.push_str(&format!("[{}] ({}) {}\n", p.index, p.kind, p.text));
        }
        prompt
    }
}

#[async_trait]
impl ChunkScorer for LlmChunkScorer {
    async fn score(
        &self,
        query: &str,
        previews: &[ChunkPreview],
    ) -> Result<Vec<ChunkScore>, ScoringError> {
        let request = GenerationRequest::new(SCORER_SYSTEM_PROMPT, Self::prompt(query, previews))
            .with_temperature(0.0)
            .with_max_tokens((previews.len() as u32).saturating_mul(40).max(64));

        let response = generate_with_timeout(self.generator.as_ref(), request, self.timeout).await?;
        match decode::decode::<ScoreEnvelope>(&response.text) {
            Some(decoded) => Ok(match decoded.value {
                ScoreEnvelope::List(scores) | ScoreEnvelope::Wrapped { scores } => scores,
            }),
            None => Err(ScoringError::Malformed(
                response.text.chars().take(120).collect(),
            )),
        }
    }
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "what", "who", "how", "why", "when", "which", "with",
    "does", "did", "this", "that", "from", "into", "about", "is", "of", "a", "an", "in", "on",
    "to", "it",
];

/// Deterministic query-term overlap scorer; needs no network.
#[derive(Debug, Clone, Default)]
pub struct KeywordChunkScorer;

impl KeywordChunkScorer {
    fn terms(query: &str) -> Vec<String> {
        let mut terms: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|w| w.len() >= 2 && !STOPWORDS.contains(&w.as_str()))
            .collect();
        terms.sort();
        terms.dedup();
        terms
    }
}

#[async_trait]
impl ChunkScorer for KeywordChunkScorer {
    async fn score(
        &self,
        query: &str,
        previews: &[ChunkPreview],
    ) -> Result<Vec<ChunkScore>, ScoringError> {
        let terms = Self::terms(query);
        Ok(previews
            .iter()
            .map(|p| {
                if terms.is_empty() {
                    return ChunkScore {
                        index: p.index,
                        score: 0.5,
                        reasoning: "query has no content terms".to_string(),
                    };
                }
                let haystack = p.text.to_lowercase();
                let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                ChunkScore {
                    index: p.index,
                    score: matched as f64 / terms.len() as f64,
                    reasoning: format!("matched {matched} of {} query terms", terms.len()),
                }
            })
            .collect())
    }
}
