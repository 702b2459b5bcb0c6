//! On-demand pattern mining over ledger records.
//!
//! Records are bucketed by (query shape, failure kind). Buckets that recur
//! become [`FailurePattern`]s with a suggested prompt change. Results are
//! recomputed on every call and never stored.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{FailureKind, FailureRecord};

/// Minimum corpus before mining says anything.
pub const MIN_RECORDS: usize = 5;
/// Smallest bucket reported as a pattern.
pub const MIN_FREQUENCY: usize = 2;

const COMMON_FAILURES: usize = 3;

/// Coarse question category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryShape {
    Definition,
    Comparison,
    HowTo,
    Why,
    List,
    Numeric,
    Other,
}

impl QueryShape {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Definition => "definition",
            Self::Comparison => "comparison",
            Self::HowTo => "how-to",
            Self::Why => "why",
            Self::List => "list",
            Self::Numeric => "numeric",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for QueryShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket a question by its leading words.
pub fn classify_query(query: &str) -> QueryShape {
    let q = query.trim().to_lowercase();
    let starts = |prefixes: &[&str]| prefixes.iter().any(|p| q.starts_with(p));

    if q.contains(" vs ")
        || q.contains(" vs. ")
        || q.contains("versus")
        || q.contains("difference between")
        || starts(&["compare", "contrast"])
    {
        QueryShape::Comparison
    } else if starts(&["how many", "how much", "how long", "how often", "what percentage"]) {
        QueryShape::Numeric
    } else if starts(&["how "]) {
        QueryShape::HowTo
    } else if starts(&["why"]) {
        QueryShape::Why
    } else if starts(&["list", "what are the", "which are", "name the", "give me examples"]) {
        QueryShape::List
    } else if starts(&["what is", "what's", "what are", "who is", "who was", "define"])
        || q.contains("meaning of")
    {
        QueryShape::Definition
    } else {
        QueryShape::Other
    }
}

/// A recurring (query shape, failure kind) combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub pattern: String,
    pub frequency: usize,
    /// Most frequent failure details in the bucket.
    pub common_failures: Vec<String>,
    /// Advisory only; never applied automatically.
    pub suggested_fix: String,
    /// 0.0 - 1.0
    pub confidence: f64,
}

/// Mine with the default thresholds.
pub fn mine(records: &[FailureRecord]) -> Vec<FailurePattern> {
    mine_with(records, MIN_RECORDS, MIN_FREQUENCY)
}

/// Patterns sorted by frequency, then confidence (both descending).
pub fn mine_with(
    records: &[FailureRecord],
    min_records: usize,
    min_frequency: usize,
) -> Vec<FailurePattern> {
    if records.len() < min_records.max(1) {
        return Vec::new();
    }

    let mut buckets: BTreeMap<(QueryShape, FailureKind), Vec<&FailureRecord>> = BTreeMap::new();
    for record in records {
        buckets
            .entry((classify_query(&record.query), record.failure_kind))
            .or_default()
            .push(record);
    }

    let total = records.len() as f64;
    let mut patterns: Vec<FailurePattern> = buckets
        .into_iter()
        .filter(|(_, group)| group.len() >= min_frequency.max(1))
        .map(|((shape, kind), group)| {
            let frequency = group.len();
            let (common_failures, top_count) = common_details(&group);
            let share = frequency as f64 / total;
            let consistency = if top_count == 0 {
                0.5
            } else {
                top_count as f64 / frequency as f64
            };
            FailurePattern {
                pattern: format!("{shape} questions failing on {kind}"),
                frequency,
                common_failures,
                suggested_fix: suggested_fix(shape, kind),
                confidence: ((share + consistency) / 2.0).clamp(0.0, 1.0),
            }
        })
        .collect();

    patterns.sort_by(|a, b| {
        b.frequency
            .cmp(&a.frequency)
            .then(b.confidence.total_cmp(&a.confidence))
    });
    patterns
}

/// Top details by count (ties alphabetical) and the top count.
fn common_details(group: &[&FailureRecord]) -> (Vec<String>, usize) {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in group {
        for detail in &record.failure_details {
            *counts.entry(detail.as_str()).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    let top = ranked.first().map(|(_, n)| *n).unwrap_or(0);
    let details = ranked
        .into_iter()
        .take(COMMON_FAILURES)
        .map(|(d, _)| d.to_string())
        .collect();
    (details, top)
}

fn suggested_fix(shape: QueryShape, kind: FailureKind) -> String {
    let fix = match kind {
        FailureKind::InvalidCitations => {
            "List the allowed citation identifiers explicitly in the system prompt and instruct \
             the model to copy them verbatim"
        }
        FailureKind::CitationDensity => {
            "Ask for one citation per factual sentence and show an example answer with inline \
             citations"
        }
        FailureKind::FactualGrounding => {
            "Instruct the model to state only what the evidence supports and to say when the \
             evidence is silent"
        }
        FailureKind::Coherence => {
            "Ask for a short outline first, then an answer that follows it in order"
        }
        FailureKind::Completeness => {
            "Restate every part of the question in the prompt and ask the model to address each \
             one"
        }
        FailureKind::GenerationFailed => {
            "Shorten the evidence context or raise the generation timeout"
        }
    };
    format!("For {shape} questions: {fix}.")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(query: &str, kind: FailureKind, details: &[&str]) -> FailureRecord {
        FailureRecord::new(query, "answer", kind)
            .with_details(details.iter().map(|d| d.to_string()).collect())
    }

    #[test]
    fn test_classify_query() {
        assert_eq!(classify_query("What is a monad?"), QueryShape::Definition);
        assert_eq!(classify_query("Rust vs Go for CLIs"), QueryShape::Comparison);
        assert_eq!(classify_query("How do I pin a dependency?"), QueryShape::HowTo);
        assert_eq!(classify_query("How many moons does Mars have?"), QueryShape::Numeric);
        assert_eq!(classify_query("Why is the sky blue?"), QueryShape::Why);
        assert_eq!(classify_query("What are the main causes?"), QueryShape::List);
        assert_eq!(classify_query("Tell me about Paris"), QueryShape::Other);
    }

    #[test]
    fn test_below_minimum_corpus_yields_nothing() {
        let records: Vec<_> = (0..4)
            .map(|_| record("Why?", FailureKind::Coherence, &[]))
            .collect();
        assert!(mine(&records).is_empty());
    }

    #[test]
    fn test_groups_recurring_shape_and_kind() {
        let records = vec![
            record("Why is X?", FailureKind::FactualGrounding, &["unsupported: a"]),
            record("Why does Y?", FailureKind::FactualGrounding, &["unsupported: a"]),
            record("Why not Z?", FailureKind::FactualGrounding, &["unsupported: b"]),
            record("What is X?", FailureKind::InvalidCitations, &["[Claim: c9]"]),
            record("How do I X?", FailureKind::Coherence, &[]),
        ];
        let patterns = mine(&records);
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.frequency, 3);
        assert_eq!(p.pattern, "why questions failing on factual_grounding");
        assert_eq!(p.common_failures[0], "unsupported: a");
        assert!(p.suggested_fix.starts_with("For why questions"));
        // share 0.6, consistency 2/3
        assert!((p.confidence - (0.6 + 2.0 / 3.0) / 2.0).abs() < 1e-9);
    }
}
