//! Quality Agent Orchestra.
//!
//! Three scorers (fact-check, coherence, validation) read the same draft
//! concurrently; if any of them returns feedback, a single refinement pass
//! rewrites the answer. Nothing here loops: residual issues are reported for
//! the failure ledger, not retried.
//!
//! # Module layout
//!
//! - [`agents`]: `QualityAgent` trait and the generation-backed scorers
//! - [`orchestra`]: `QualityOrchestra::run_quality`, refinement

pub mod agents;
pub mod orchestra;

use serde::{Deserialize, Serialize};

use crate::domain::Preferences;

pub use agents::{
    CoherenceAgent, FactCheckAgent, LlmRefiner, QualityAgent, RefinementRequest, Refiner,
    SummarizationAgent, ValidationAgent,
};
pub use orchestra::QualityOrchestra;

/// Quality stage tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub enabled: bool,
    /// Minimum score for an agent to pass.
    pub pass_threshold: f64,
    pub agent_timeout_ms: u64,
    /// Allow the single refinement pass.
    pub refine: bool,
    pub refinement_timeout_ms: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pass_threshold: 0.7,
            agent_timeout_ms: 30_000,
            refine: true,
            refinement_timeout_ms: 60_000,
        }
    }
}

/// Score assigned when an agent could not produce one.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Outcome of one quality agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult<P> {
    /// `score >= pass_threshold`
    pub success: bool,
    /// 0.0 - 1.0
    pub score: f64,
    /// 0.0 - 1.0; zero when the agent failed to run
    pub confidence: f64,
    pub feedback: Vec<String>,
    pub payload: P,
}

impl<P: Default> AgentResult<P> {
    /// Degraded result for an agent that errored or timed out.
    pub fn neutral() -> Self {
        Self {
            success: false,
            score: NEUTRAL_SCORE,
            confidence: 0.0,
            feedback: Vec::new(),
            payload: P::default(),
        }
    }
}

impl<P> AgentResult<P> {
    /// True for a neutral stand-in: the agent never produced a verdict.
    pub fn is_degraded(&self) -> bool {
        self.confidence <= 0.0
    }

    /// Score, or `None` when the agent did not run.
    pub fn measured_score(&self) -> Option<f64> {
        (!self.is_degraded()).then_some(self.score)
    }
}

/// Claims in the draft, bucketed by how the evidence treats them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactCheck {
    /// Directly supported by the evidence.
    pub verified_claims: Vec<String>,
    /// Not addressed by the evidence. Not presumed false.
    pub unverified_claims: Vec<String>,
    /// Conflict with the evidence.
    pub contradictions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coherence {
    pub issues: Vec<String>,
    /// Reads-well sub-metric, reported separately from the pass/fail score.
    pub flow_score: f64,
}

impl Default for Coherence {
    fn default() -> Self {
        Self {
            issues: Vec::new(),
            flow_score: NEUTRAL_SCORE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub citation_issues: Vec<String>,
    pub completeness_score: f64,
    pub accuracy_score: f64,
}

impl Default for Validation {
    fn default() -> Self {
        Self {
            citation_issues: Vec::new(),
            completeness_score: NEUTRAL_SCORE,
            accuracy_score: NEUTRAL_SCORE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub summary: String,
    pub key_points: Vec<String>,
}

/// Everything the scorers read.
#[derive(Debug, Clone, Copy)]
pub struct DraftContext<'a> {
    pub answer: &'a str,
    pub question: &'a str,
    pub evidence_context: &'a str,
    pub preferences: &'a Preferences,
}

/// Output of [`QualityOrchestra::run_quality`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub fact_check: AgentResult<FactCheck>,
    pub coherence: AgentResult<Coherence>,
    pub validation: AgentResult<Validation>,
    pub summarization: Option<AgentResult<Summary>>,
    /// Answer after the optional refinement pass.
    pub answer: String,
    pub refined: bool,
    /// Aggregated scorer feedback handed to refinement.
    pub issues: Vec<String>,
    /// Feedback from scorers that did not pass; recorded, never retried.
    pub residual_feedback: Vec<String>,
}

impl QualityReport {
    pub fn all_passed(&self) -> bool {
        self.fact_check.success && self.coherence.success && self.validation.success
    }

    /// Mean of the three scorer scores.
    pub fn overall_score(&self) -> f64 {
        (self.fact_check.score + self.coherence.score + self.validation.score) / 3.0
    }

    /// Names of scorers below the pass threshold.
    pub fn failing_agents(&self) -> Vec<&'static str> {
        let mut failing = Vec::new();
        if !self.fact_check.success {
            failing.push("fact_check");
        }
        if !self.coherence.success {
            failing.push("coherence");
        }
        if !self.validation.success {
            failing.push("validation");
        }
        failing
    }
}
