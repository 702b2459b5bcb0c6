//! Structured events for the answer pipeline.
//!
//! Every stage reports through one of the `emit_*` functions below so log
//! lines carry a stable `event` field. Wrap request handling in a
//! [`RequestSpan`] to tag everything it logs with the request id.
//!
//! Events are emitted at `info!` level unless noted (filter with `RUST_LOG`).

use tracing::{info, warn};

/// RAII guard that enters a request-scoped span.
///
/// ```ignore
/// let _span = RequestSpan::enter("6f1c...");
/// // tracing calls here carry request_id = "6f1c..."
/// ```
pub struct RequestSpan {
    _span: tracing::span::EnteredSpan,
}

impl RequestSpan {
    pub fn enter(request_id: &str) -> Self {
        Self {
            _span: Self::span(request_id).entered(),
        }
    }

    /// The span itself, for `Instrument`-ing futures (an entered guard
    /// must not be held across an await).
    pub fn span(request_id: &str) -> tracing::Span {
        tracing::info_span!("groundcheck.request", request_id = %request_id)
    }
}

pub fn emit_request_started(request_id: &str, mode: &str, strict: bool) {
    info!(event = "request.started", request_id = %request_id, mode = %mode, strict = strict);
}

pub fn emit_request_finished(request_id: &str, status: &str, duration_ms: u64) {
    info!(
        event = "request.finished",
        request_id = %request_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

/// Evidence selection finished.
pub fn emit_selection(candidates: usize, selected: usize, total_tokens: usize, fallback: bool) {
    info!(
        event = "selection.done",
        candidates = candidates,
        selected = selected,
        total_tokens = total_tokens,
        fallback = fallback,
    );
}

pub fn emit_citations_verified(ok: bool, citations: usize, invalid: usize) {
    info!(event = "citations.verified", ok = ok, citations = citations, invalid = invalid);
}

/// The single corrective regeneration was issued.
pub fn emit_regeneration(reminder: &str) {
    warn!(event = "citations.regenerate", reminder_chars = reminder.len());
}

pub fn emit_quality_scored(fact_check: f64, coherence: f64, validation: f64, passed: bool) {
    info!(
        event = "quality.scored",
        fact_check = fact_check,
        coherence = coherence,
        validation = validation,
        passed = passed,
    );
}

pub fn emit_refinement(issues: usize, applied: bool) {
    info!(event = "quality.refinement", issues = issues, applied = applied);
}

pub fn emit_failure_recorded(kind: &str, details: usize) {
    info!(event = "ledger.recorded", kind = %kind, details = details);
}

pub fn emit_cache_hit(key: &str) {
    info!(event = "cache.hit", key = %key);
}

pub fn emit_cache_miss(key: &str) {
    info!(event = "cache.miss", key = %key);
}

/// A stage fell back to its degraded path (warning level).
pub fn emit_stage_degraded(stage: &str, error: &dyn std::fmt::Display) {
    warn!(event = "stage.degraded", stage = %stage, error = %error);
}
