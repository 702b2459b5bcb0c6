//! Groundcheck core library
//!
//! Answer-quality pipeline for retrieval-augmented assistants: evidence
//! selection under a token budget, citation verification against a
//! per-request allowlist, concurrent quality scoring with one refinement
//! pass, a bounded failure ledger, and a short-TTL response cache.

pub mod cache;
pub mod citation;
pub mod config;
pub mod decode;
pub mod domain;
pub mod fakes;
pub mod generation;
pub mod ledger;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod preferences;
pub mod prompts;
pub mod quality;
pub mod retrieval;
pub mod selector;
pub mod telemetry;

pub use domain::{
    Allowlist, AnswerMode, AnswerRequest, CacheError, ChunkKind, CitationKind, CitationToken,
    EvidenceChunk, GenerationError, GroundcheckError, LedgerError, PreferenceError, Preferences,
    Result, RetrievalError, ScoredChunk,
};

pub use cache::{cache_key, normalize_question, CacheConfig, ResponseCache};
pub use citation::{
    extract_citations, verify, verify_with, CitationConfig, CitationGuard, CitationReport,
    GuardOutcome, Verification, VerifyOptions,
};
pub use config::{GenerationConfig, PipelineConfig, TimeoutConfig};
pub use generation::openai::{OpenAiCompatConfig, OpenAiCompatGenerator};
pub use generation::{FinishReason, GenerationRequest, GenerationResponse, GenerationService};
pub use ledger::{
    mine, AgentScores, FailureKind, FailureLedger, FailurePattern, FailureRecord, LedgerConfig,
    LedgerStats,
};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pipeline::{AnswerPipeline, AnswerResponse, AnswerStatus, PipelineBuilder, SelectionStats};
pub use preferences::{Interaction, PreferenceStore};
pub use quality::{AgentResult, QualityAgent, QualityConfig, QualityOrchestra, QualityReport};
pub use retrieval::{RetrievalQuery, RetrievalService, RetrievedEvidence, StaticRetrieval};
pub use selector::{
    ChunkScorer, EvidenceSelector, KeywordChunkScorer, LlmChunkScorer, Selection, SelectorConfig,
};
