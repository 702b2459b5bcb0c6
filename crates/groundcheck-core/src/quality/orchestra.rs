//! Concurrent scoring and the single refinement pass.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::agents::{
    CoherenceAgent, FactCheckAgent, LlmRefiner, QualityAgent, RefinementRequest, Refiner,
    SummarizationAgent, ValidationAgent,
};
use super::{
    AgentResult, Coherence, DraftContext, FactCheck, QualityConfig, QualityReport, Summary,
    Validation,
};
use crate::citation::verify;
use crate::domain::{Allowlist, Preferences};
use crate::generation::GenerationService;
use crate::obs;

const REFINE_MAX_TOKENS: u32 = 2048;

/// Runs the three scorers, then refines once if they left feedback.
pub struct QualityOrchestra {
    fact_check: Arc<dyn QualityAgent<Payload = FactCheck>>,
    coherence: Arc<dyn QualityAgent<Payload = Coherence>>,
    validation: Arc<dyn QualityAgent<Payload = Validation>>,
    summarizer: Arc<dyn QualityAgent<Payload = Summary>>,
    refiner: Arc<dyn Refiner>,
    config: QualityConfig,
}

impl QualityOrchestra {
    /// All agents backed by `generator`.
    pub fn new(generator: Arc<dyn GenerationService>, config: QualityConfig) -> Self {
        let threshold = config.pass_threshold;
        Self {
            fact_check: Arc::new(FactCheckAgent::new(generator.clone(), threshold)),
            coherence: Arc::new(CoherenceAgent::new(generator.clone(), threshold)),
            validation: Arc::new(ValidationAgent::new(generator.clone(), threshold)),
            summarizer: Arc::new(SummarizationAgent::new(generator.clone())),
            refiner: Arc::new(LlmRefiner::new(generator, REFINE_MAX_TOKENS)),
            config,
        }
    }

    pub fn with_fact_checker(mut self, agent: Arc<dyn QualityAgent<Payload = FactCheck>>) -> Self {
        self.fact_check = agent;
        self
    }

    pub fn with_coherence(mut self, agent: Arc<dyn QualityAgent<Payload = Coherence>>) -> Self {
        self.coherence = agent;
        self
    }

    pub fn with_validation(mut self, agent: Arc<dyn QualityAgent<Payload = Validation>>) -> Self {
        self.validation = agent;
        self
    }

    pub fn with_summarizer(mut self, agent: Arc<dyn QualityAgent<Payload = Summary>>) -> Self {
        self.summarizer = agent;
        self
    }

    pub fn with_refiner(mut self, refiner: Arc<dyn Refiner>) -> Self {
        self.refiner = refiner;
        self
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Score `answer`, refine at most once, and summarize if asked.
    ///
    /// Never fails: a scorer that errors or times out contributes a neutral
    /// result. When `allowlist` is given, a refinement that cites anything
    /// outside it is discarded and the original answer kept.
    pub async fn run_quality(
        &self,
        answer: &str,
        question: &str,
        evidence_context: &str,
        preferences: &Preferences,
        allowlist: Option<&Allowlist>,
    ) -> QualityReport {
        let draft = DraftContext {
            answer,
            question,
            evidence_context,
            preferences,
        };

        let (fact_check, coherence, validation) = tokio::join!(
            self.run_agent(self.fact_check.as_ref(), &draft),
            self.run_agent(self.coherence.as_ref(), &draft),
            self.run_agent(self.validation.as_ref(), &draft),
        );
        obs::emit_quality_scored(
            fact_check.score,
            coherence.score,
            validation.score,
            fact_check.success && coherence.success && validation.success,
        );

        let mut issues = Vec::new();
        for item in fact_check
            .feedback
            .iter()
            .chain(&coherence.feedback)
            .chain(&validation.feedback)
        {
            if !issues.contains(item) {
                issues.push(item.clone());
            }
        }

        let (final_answer, refined) = if self.config.refine && !issues.is_empty() {
            self.refine_once(&draft, &issues, allowlist).await
        } else {
            (answer.to_string(), false)
        };

        let summarization = if preferences.want_summary {
            let summary_draft = DraftContext {
                answer: &final_answer,
                ..draft
            };
            self.run_optional(self.summarizer.as_ref(), &summary_draft)
                .await
        } else {
            None
        };

        let mut residual_feedback = Vec::new();
        for result in [
            (fact_check.success, &fact_check.feedback),
            (coherence.success, &coherence.feedback),
            (validation.success, &validation.feedback),
        ] {
            if let (false, feedback) = result {
                residual_feedback.extend(feedback.iter().cloned());
            }
        }

        QualityReport {
            fact_check,
            coherence,
            validation,
            summarization,
            answer: final_answer,
            refined,
            issues,
            residual_feedback,
        }
    }

    async fn refine_once(
        &self,
        draft: &DraftContext<'_>,
        issues: &[String],
        allowlist: Option<&Allowlist>,
    ) -> (String, bool) {
        let request = RefinementRequest {
            draft: *draft,
            issues,
        };
        let timeout = Duration::from_millis(self.config.refinement_timeout_ms);
        let outcome = tokio::time::timeout(timeout, self.refiner.refine(&request)).await;

        let rewritten = match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => text,
            Ok(Ok(_)) => {
                warn!("refinement returned empty text, keeping draft");
                obs::emit_refinement(issues.len(), false);
                return (draft.answer.to_string(), false);
            }
            Ok(Err(e)) => {
                obs::emit_stage_degraded("refinement", &e);
                obs::emit_refinement(issues.len(), false);
                return (draft.answer.to_string(), false);
            }
            Err(_elapsed) => {
                obs::emit_stage_degraded("refinement", &"timed out");
                obs::emit_refinement(issues.len(), false);
                return (draft.answer.to_string(), false);
            }
        };

        if let Some(allowlist) = allowlist {
            let check = verify(&rewritten, allowlist);
            if !check.ok {
                warn!(
                    invalid = check.invalid.len(),
                    "refinement introduced unknown citations, keeping draft"
                );
                obs::emit_refinement(issues.len(), false);
                return (draft.answer.to_string(), false);
            }
        }

        obs::emit_refinement(issues.len(), true);
        (rewritten, true)
    }

    async fn run_agent<P: Default + Send>(
        &self,
        agent: &dyn QualityAgent<Payload = P>,
        draft: &DraftContext<'_>,
    ) -> AgentResult<P> {
        self.run_optional(agent, draft)
            .await
            .unwrap_or_else(AgentResult::neutral)
    }

    async fn run_optional<P: Default + Send>(
        &self,
        agent: &dyn QualityAgent<Payload = P>,
        draft: &DraftContext<'_>,
    ) -> Option<AgentResult<P>> {
        let timeout = Duration::from_millis(self.config.agent_timeout_ms);
        match tokio::time::timeout(timeout, agent.evaluate(draft)).await {
            Ok(Ok(mut result)) => {
                result.score = result.score.clamp(0.0, 1.0);
                result.confidence = result.confidence.clamp(0.0, 1.0);
                Some(result)
            }
            Ok(Err(e)) => {
                obs::emit_stage_degraded(agent.name(), &e);
                None
            }
            Err(_elapsed) => {
                obs::emit_stage_degraded(agent.name(), &"timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FailingGenerator, StubAgent, StubRefiner};

    fn orchestra() -> QualityOrchestra {
        QualityOrchestra::new(Arc::new(FailingGenerator::new()), QualityConfig::default())
    }

    #[tokio::test]
    async fn test_failing_generator_yields_neutral_results() {
        let report = orchestra()
            .run_quality("answer", "q", "", &Preferences::default(), None)
            .await;
        assert_eq!(report.fact_check.score, 0.5);
        assert_eq!(report.fact_check.confidence, 0.0);
        assert!(report.issues.is_empty());
        assert!(!report.refined);
        assert_eq!(report.answer, "answer");
    }

    #[tokio::test]
    async fn test_passing_agents_skip_refinement() {
        let refiner = Arc::new(StubRefiner::returning("rewritten"));
        let report = orchestra()
            .with_fact_checker(Arc::new(StubAgent::<FactCheck>::passing(0.9)))
            .with_coherence(Arc::new(StubAgent::<Coherence>::passing(0.8)))
            .with_validation(Arc::new(StubAgent::<Validation>::passing(0.95)))
            .with_refiner(refiner.clone())
            .run_quality("answer", "q", "", &Preferences::default(), None)
            .await;
        assert!(report.all_passed());
        assert!(!report.refined);
        assert_eq!(refiner.calls(), 0);
    }
}
