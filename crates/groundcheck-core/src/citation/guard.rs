//! Bounded citation enforcement: verify, regenerate at most once, then flag.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::verify::{verify_with, CitationReport, VerifyOptions};
use crate::domain::Allowlist;
use crate::generation::{
    generate_with_timeout, ChatMessage, GenerationRequest, GenerationResponse, GenerationService,
};
use crate::obs;

/// Citation enforcement tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationConfig {
    /// Apply the density check even when the request doesn't ask for it.
    pub strict_by_default: bool,
    /// Share of sentences that must carry a citation in strict mode.
    pub min_cited_ratio: f64,
    /// Issue the single corrective regeneration on failure.
    pub regenerate_on_failure: bool,
    pub regeneration_timeout_ms: u64,
    /// Prepended to answers that still fail after regeneration.
    pub warning_banner: String,
}

impl Default for CitationConfig {
    fn default() -> Self {
        Self {
            strict_by_default: false,
            min_cited_ratio: 0.5,
            regenerate_on_failure: true,
            regeneration_timeout_ms: 60_000,
            warning_banner: "⚠️ Some statements in this answer could not be matched to the \
                             evidence provided. Please double-check before relying on them."
                .to_string(),
        }
    }
}

/// Result of enforcing citations on one draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardOutcome {
    /// Answer body, without any banner.
    pub answer: String,
    /// Report for `answer`.
    pub report: CitationReport,
    /// Report for the first draft when a regeneration happened.
    pub initial_report: Option<CitationReport>,
    /// Number of regeneration calls issued (0 or 1).
    pub regenerations: u32,
    /// Banner to prepend, when verification still fails.
    pub warning: Option<String>,
    /// The accepted answer hit the output token limit.
    pub truncated: bool,
}

impl GuardOutcome {
    /// Answer with the warning banner prepended, if any.
    pub fn rendered(&self) -> String {
        match &self.warning {
            Some(banner) => format!("{banner}\n\n{}", self.answer),
            None => self.answer.clone(),
        }
    }
}

/// Verifies drafts and drives the one-shot regeneration.
pub struct CitationGuard {
    generator: Arc<dyn GenerationService>,
    config: CitationConfig,
}

impl CitationGuard {
    pub fn new(generator: Arc<dyn GenerationService>, config: CitationConfig) -> Self {
        Self { generator, config }
    }

    pub fn config(&self) -> &CitationConfig {
        &self.config
    }

    fn check(
        &self,
        draft: &GenerationResponse,
        allowlist: &Allowlist,
        strict: bool,
    ) -> CitationReport {
        verify_with(
            &draft.text,
            allowlist,
            VerifyOptions {
                strict: strict || self.config.strict_by_default,
                truncated: draft.finish_reason.is_truncated(),
            },
            self.config.min_cited_ratio,
        )
    }

    /// Verify `draft`; on failure regenerate once with a corrective reminder.
    ///
    /// Never issues more than one regeneration call. If the second attempt
    /// still fails (or the call itself fails) the outcome carries a warning
    /// banner instead of retrying.
    pub async fn enforce(
        &self,
        draft: GenerationResponse,
        allowlist: &Allowlist,
        original: &GenerationRequest,
        strict: bool,
    ) -> GuardOutcome {
        let report = self.check(&draft, allowlist, strict);
        obs::emit_citations_verified(
            report.ok,
            report.verification.citations.len(),
            report.verification.invalid.len(),
        );
        if report.ok {
            return GuardOutcome {
                answer: draft.text,
                report,
                initial_report: None,
                regenerations: 0,
                warning: None,
                truncated: draft.finish_reason.is_truncated(),
            };
        }

        if !self.config.regenerate_on_failure {
            return self.flagged(draft, report, None, 0);
        }

        let reminder = corrective_reminder(&report, allowlist);
        obs::emit_regeneration(&reminder);
        let mut request = original.clone();
        request.messages.push(ChatMessage::assistant(draft.text.clone()));
        request.messages.push(ChatMessage::user(reminder));

        let timeout = Duration::from_millis(self.config.regeneration_timeout_ms);
        match generate_with_timeout(self.generator.as_ref(), request, timeout).await {
            Ok(second) if !second.text.trim().is_empty() => {
                let second_report = self.check(&second, allowlist, strict);
                obs::emit_citations_verified(
                    second_report.ok,
                    second_report.verification.citations.len(),
                    second_report.verification.invalid.len(),
                );
                if second_report.ok {
                    GuardOutcome {
                        truncated: second.finish_reason.is_truncated(),
                        answer: second.text,
                        report: second_report,
                        initial_report: Some(report),
                        regenerations: 1,
                        warning: None,
                    }
                } else {
                    self.flagged(second, second_report, Some(report), 1)
                }
            }
            Ok(_) => {
                warn!("regeneration returned empty text, keeping first draft");
                self.flagged(draft, report.clone(), Some(report), 1)
            }
            Err(e) => {
                warn!(error = %e, "citation regeneration failed, keeping first draft");
                self.flagged(draft, report.clone(), Some(report), 1)
            }
        }
    }

    fn flagged(
        &self,
        draft: GenerationResponse,
        report: CitationReport,
        initial_report: Option<CitationReport>,
        regenerations: u32,
    ) -> GuardOutcome {
        GuardOutcome {
            truncated: draft.finish_reason.is_truncated(),
            answer: draft.text,
            report,
            initial_report,
            regenerations,
            warning: Some(self.config.warning_banner.clone()),
        }
    }
}

const MAX_LISTED: usize = 20;

/// Instruction naming the offending identifiers or the density shortfall.
pub fn corrective_reminder(report: &CitationReport, allowlist: &Allowlist) -> String {
    let mut parts = Vec::new();

    let offending = report.verification.invalid.tokens();
    if !offending.is_empty() {
        let listed: Vec<String> = offending.iter().map(ToString::to_string).collect();
        parts.push(format!(
            "Your previous answer cited identifiers that are not in the provided evidence: {}. \
             Remove or replace them.",
            listed.join(", ")
        ));
    }

    if let Some(density) = report.density.as_ref().filter(|d| !d.passes) {
        let mut msg = format!(
            "Only {} of {} sentences carried a citation.",
            density.cited_sentences, density.total_sentences
        );
        if !density.uncited_requiring.is_empty() {
            msg.push_str(" These statements need a citation: ");
            let quoted: Vec<String> = density
                .uncited_requiring
                .iter()
                .take(5)
                .map(|s| format!("\"{s}\""))
                .collect();
            msg.push_str(&quoted.join("; "));
            msg.push('.');
        }
        parts.push(msg);
    }

    let allowed: Vec<String> = crate::domain::CitationKind::ALL
        .into_iter()
        .flat_map(|kind| {
            allowlist
                .set(kind)
                .iter()
                .map(move |id| crate::domain::CitationToken::new(kind, id.clone()).to_string())
        })
        .take(MAX_LISTED)
        .collect();
    if allowed.is_empty() {
        parts.push(
            "No citable evidence was provided, so do not include any citation tokens.".to_string(),
        );
    } else {
        parts.push(format!("Only cite from: {}.", allowed.join(", ")));
    }

    parts.push("Rewrite the full answer.".to_string());
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::citation::verify::verify;

    #[test]
    fn test_reminder_names_offending_ids_and_allowed_set() {
        let allowlist = Allowlist::default().with_claim("c1");
        let report = CitationReport {
            ok: false,
            verification: verify("Paris. [Claim: c99]", &allowlist),
            density: None,
        };
        let reminder = corrective_reminder(&report, &allowlist);
        assert!(reminder.contains("[Claim: c99]"));
        assert!(reminder.contains("Only cite from: [Claim: c1]"));
    }

    #[test]
    fn test_rendered_prepends_banner() {
        let allowlist = Allowlist::default();
        let outcome = GuardOutcome {
            answer: "body".into(),
            report: verify_with("body", &allowlist, VerifyOptions::default(), 0.5),
            initial_report: None,
            regenerations: 1,
            warning: Some("WARN".into()),
            truncated: false,
        };
        assert_eq!(outcome.rendered(), "WARN\n\nbody");
    }
}
