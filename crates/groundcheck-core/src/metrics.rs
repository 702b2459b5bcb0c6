//! Atomic counters for the answer pipeline.
//!
//! One [`Metrics`] lives inside each pipeline (shared through `Arc`).
//! Increments are silent; [`Metrics::flush`] logs every counter as a
//! single `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    regenerations: AtomicU64,
    refinements: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    failures_recorded: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub regenerations: u64,
    pub refinements: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failures_recorded: u64,
}

impl Metrics {
    pub fn inc_requests(&self) {
        bump(&self.requests, "requests");
    }

    pub fn inc_regenerations(&self) {
        bump(&self.regenerations, "regenerations");
    }

    pub fn inc_refinements(&self) {
        bump(&self.refinements, "refinements");
    }

    pub fn inc_cache_hits(&self) {
        bump(&self.cache_hits, "cache_hits");
    }

    pub fn inc_cache_misses(&self) {
        bump(&self.cache_misses, "cache_misses");
    }

    pub fn inc_failures_recorded(&self) {
        bump(&self.failures_recorded, "failures_recorded");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            regenerations: self.regenerations.load(Ordering::Relaxed),
            refinements: self.refinements.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            failures_recorded: self.failures_recorded.load(Ordering::Relaxed),
        }
    }

    /// Emit all counters as one `info!` event.
    ///
    /// Call at natural boundaries (end of a request, CLI exit), not on
    /// every increment.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            requests = s.requests,
            regenerations = s.regenerations,
            refinements = s.refinements,
            cache_hits = s.cache_hits,
            cache_misses = s.cache_misses,
            failures_recorded = s.failures_recorded,
        );
    }
}

fn bump(counter: &AtomicU64, name: &'static str) {
    counter.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(metric = name, "counter incremented");
}
