//! Failure ledger: a bounded, in-memory record of answers that fell short.
//!
//! Records go into a fixed-capacity ring buffer (oldest evicted first).
//! [`mining::mine`] groups them into advisory patterns on demand; nothing
//! here changes pipeline behaviour. [`snapshot`] optionally persists the
//! buffer with a SHA-256 digest.

pub mod mining;
pub mod snapshot;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::obs;

pub use mining::{classify_query, mine, mine_with, FailurePattern, QueryShape};
pub use snapshot::{read_snapshot, write_snapshot, LedgerSnapshot};

/// Ledger tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub capacity: usize,
    /// Mining returns nothing below this many records.
    pub min_records_for_mining: usize,
    /// Smallest group reported as a pattern.
    pub min_pattern_frequency: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            min_records_for_mining: mining::MIN_RECORDS,
            min_pattern_frequency: mining::MIN_FREQUENCY,
        }
    }
}

/// Why an answer was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Cited identifiers outside the allowlist, even after regeneration.
    InvalidCitations,
    /// Too few cited sentences in strict mode.
    CitationDensity,
    /// Fact-check below the pass threshold.
    FactualGrounding,
    Coherence,
    /// Validation below the pass threshold.
    Completeness,
    /// Primary generation failed outright.
    GenerationFailed,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCitations => "invalid_citations",
            Self::CitationDensity => "citation_density",
            Self::FactualGrounding => "factual_grounding",
            Self::Coherence => "coherence",
            Self::Completeness => "completeness",
            Self::GenerationFailed => "generation_failed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scorer results at the time of failure; `None` when a scorer didn't run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentScores {
    pub fact_check: Option<f64>,
    pub coherence: Option<f64>,
    pub validation: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub response: String,
    pub failure_kind: FailureKind,
    pub failure_details: Vec<String>,
    pub agent_scores: AgentScores,
    /// Free-form request context (mode, evidence counts, ids).
    #[serde(default)]
    pub context: serde_json::Value,
}

impl FailureRecord {
    pub fn new(
        query: impl Into<String>,
        response: impl Into<String>,
        failure_kind: FailureKind,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            query: query.into(),
            response: response.into(),
            failure_kind,
            failure_details: Vec::new(),
            agent_scores: AgentScores::default(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.failure_details = details;
        self
    }

    pub fn with_scores(mut self, scores: AgentScores) -> Self {
        self.agent_scores = scores;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// Aggregate view returned by [`FailureLedger::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_failures: usize,
    pub by_kind: BTreeMap<FailureKind, usize>,
    /// Mean of each scorer over the records where it ran.
    pub mean_scores: AgentScores,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Fixed-capacity FIFO of failure records.
#[derive(Debug)]
pub struct FailureLedger {
    records: Mutex<VecDeque<FailureRecord>>,
    config: LedgerConfig,
}

impl Default for FailureLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl FailureLedger {
    pub fn new(config: LedgerConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            config: LedgerConfig { capacity, ..config },
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(LedgerConfig {
            capacity,
            ..LedgerConfig::default()
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<FailureRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `record`, evicting the oldest entry when full.
    pub fn record(&self, record: FailureRecord) {
        obs::emit_failure_recorded(record.failure_kind.as_str(), record.failure_details.len());
        let mut records = self.lock();
        while records.len() >= self.config.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Replace the buffer contents, keeping the most recent `capacity`.
    pub fn restore(&self, restored: Vec<FailureRecord>) {
        let skip = restored.len().saturating_sub(self.config.capacity);
        let mut records = self.lock();
        records.clear();
        records.extend(restored.into_iter().skip(skip));
    }

    /// Copy of every record, oldest first.
    pub fn records(&self) -> Vec<FailureRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> LedgerStats {
        let records = self.lock();
        let mut stats = LedgerStats {
            total_failures: records.len(),
            oldest: records.front().map(|r| r.timestamp),
            newest: records.back().map(|r| r.timestamp),
            ..LedgerStats::default()
        };

        let mut sums = [(0.0_f64, 0_usize); 3];
        for record in records.iter() {
            *stats.by_kind.entry(record.failure_kind).or_insert(0) += 1;
            let s = record.agent_scores;
            for (slot, score) in sums.iter_mut().zip([s.fact_check, s.coherence, s.validation]) {
                if let Some(score) = score {
                    slot.0 += score;
                    slot.1 += 1;
                }
            }
        }
        let mean = |(sum, n): (f64, usize)| (n > 0).then(|| sum / n as f64);
        stats.mean_scores = AgentScores {
            fact_check: mean(sums[0]),
            coherence: mean(sums[1]),
            validation: mean(sums[2]),
        };
        stats
    }

    /// Mine the current buffer with this ledger's thresholds.
    pub fn mine(&self) -> Vec<FailurePattern> {
        mine_with(
            &self.records(),
            self.config.min_records_for_mining,
            self.config.min_pattern_frequency,
        )
    }
}
