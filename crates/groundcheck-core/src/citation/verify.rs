//! Pure citation verification against a request allowlist.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::scanner::{scan, CitationSpan};
use crate::domain::{Allowlist, CitationKind, CitationToken};

/// Identifiers cited in the answer but absent from the allowlist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidCitations {
    pub claims: Vec<String>,
    pub quotes: Vec<String>,
    pub sources: Vec<String>,
}

impl InvalidCitations {
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty() && self.quotes.is_empty() && self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.claims.len() + self.quotes.len() + self.sources.len()
    }

    /// Offending identifiers rendered back into wire-format tokens.
    pub fn tokens(&self) -> Vec<CitationToken> {
        let of = |kind: CitationKind, ids: &[String]| {
            ids.iter()
                .map(move |id| CitationToken::new(kind, id.clone()))
                .collect::<Vec<_>>()
        };
        let mut tokens = of(CitationKind::Claim, &self.claims);
        tokens.extend(of(CitationKind::Quote, &self.quotes));
        tokens.extend(of(CitationKind::Source, &self.sources));
        tokens
    }
}

/// Outcome of allowlist verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub ok: bool,
    pub invalid: InvalidCitations,
    /// Every citation found, in order of appearance.
    pub citations: Vec<CitationToken>,
}

/// Check every cited identifier against `allowlist`.
///
/// Pure: identical inputs always yield identical output. Text without
/// citations passes vacuously.
pub fn verify(answer: &str, allowlist: &Allowlist) -> Verification {
    let spans = scan(answer);
    let mut invalid: [BTreeSet<String>; 3] = Default::default();

    for span in &spans {
        let token = &span.token;
        if !allowlist.contains(token.kind, &token.id) {
            let slot = match token.kind {
                CitationKind::Claim => 0,
                CitationKind::Quote => 1,
                CitationKind::Source => 2,
            };
            invalid[slot].insert(token.id.clone());
        }
    }

    let [claims, quotes, sources] = invalid;
    let invalid = InvalidCitations {
        claims: claims.into_iter().collect(),
        quotes: quotes.into_iter().collect(),
        sources: sources.into_iter().collect(),
    };

    Verification {
        ok: invalid.is_empty(),
        invalid,
        citations: spans.into_iter().map(|s| s.token).collect(),
    }
}

/// Sentence-level citation coverage of an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityReport {
    pub total_sentences: usize,
    pub cited_sentences: usize,
    /// Sentences with a number, date, or mid-sentence proper noun.
    pub requiring_citation: usize,
    pub requiring_cited: usize,
    /// Text of sentences that need a citation and have none.
    pub uncited_requiring: Vec<String>,
    pub passes: bool,
}

impl DensityReport {
    pub fn cited_ratio(&self) -> f64 {
        if self.total_sentences == 0 {
            1.0
        } else {
            self.cited_sentences as f64 / self.total_sentences as f64
        }
    }
}

/// Verification options for one answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Also require citation density.
    pub strict: bool,
    /// The answer was cut off at the token limit; density is not checked.
    pub truncated: bool,
}

/// Allowlist verification plus the optional strict density check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationReport {
    pub ok: bool,
    pub verification: Verification,
    /// Present when the density check ran.
    pub density: Option<DensityReport>,
}

/// Verify `answer` under `options`.
pub fn verify_with(
    answer: &str,
    allowlist: &Allowlist,
    options: VerifyOptions,
    min_cited_ratio: f64,
) -> CitationReport {
    let verification = verify(answer, allowlist);
    let density = (options.strict && !options.truncated)
        .then(|| citation_density(answer, min_cited_ratio));
    let ok = verification.ok && density.as_ref().map(|d| d.passes).unwrap_or(true);

    CitationReport {
        ok,
        verification,
        density,
    }
}

#[derive(Debug)]
struct Sentence {
    text: String,
    citations: usize,
}

/// Measure citation coverage per sentence.
///
/// Passes when at least `min_cited_ratio` of sentences carry a citation, or
/// when every sentence that requires one has one.
pub fn citation_density(answer: &str, min_cited_ratio: f64) -> DensityReport {
    let sentences = split_sentences(answer);

    let total_sentences = sentences.len();
    let cited_sentences = sentences.iter().filter(|s| s.citations > 0).count();
    let mut requiring_citation = 0;
    let mut requiring_cited = 0;
    let mut uncited_requiring = Vec::new();

    for sentence in &sentences {
        if !requires_citation(&sentence.text) {
            continue;
        }
        requiring_citation += 1;
        if sentence.citations > 0 {
            requiring_cited += 1;
        } else {
            uncited_requiring.push(sentence.text.trim().to_string());
        }
    }

    let ratio = if total_sentences == 0 {
        1.0
    } else {
        cited_sentences as f64 / total_sentences as f64
    };
    let passes = ratio >= min_cited_ratio || requiring_cited == requiring_citation;

    DensityReport {
        total_sentences,
        cited_sentences,
        requiring_citation,
        requiring_cited,
        uncited_requiring,
        passes,
    }
}

/// Split into sentences, attributing citations to the sentence they follow.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace, or at a
/// newline. Citation tokens that open a segment (e.g. the `[Claim: c1]` in
/// `France. [Claim: c1] Next`) belong to the previous sentence.
fn split_sentences(text: &str) -> Vec<Sentence> {
    let spans = scan(text);
    let mut sentences: Vec<Sentence> = Vec::new();

    for range in segment_ranges(text, &spans) {
        let inside: Vec<&CitationSpan> = spans
            .iter()
            .filter(|s| s.range.start >= range.start && s.range.end <= range.end)
            .collect();

        let mut body = String::new();
        let mut first_word_at: Option<usize> = None;
        let mut pos = range.start;
        for span in &inside {
            let chunk = &text[pos..span.range.start];
            if first_word_at.is_none() {
                if let Some(i) = chunk.find(char::is_alphanumeric) {
                    first_word_at = Some(pos + i);
                }
            }
            body.push_str(chunk);
            pos = span.range.end;
        }
        let tail = &text[pos..range.end];
        if first_word_at.is_none() {
            if let Some(i) = tail.find(char::is_alphanumeric) {
                first_word_at = Some(pos + i);
            }
        }
        body.push_str(tail);

        let Some(at) = first_word_at else {
            // Citation-only segment: credit the previous sentence.
            if let Some(prev) = sentences.last_mut() {
                prev.citations += inside.len();
            }
            continue;
        };

        let leading = inside.iter().filter(|s| s.range.start < at).count();
        let own = match sentences.last_mut() {
            Some(prev) if leading > 0 => {
                prev.citations += leading;
                inside.len() - leading
            }
            _ => inside.len(),
        };
        sentences.push(Sentence {
            text: body,
            citations: own,
        });
    }

    sentences
}

fn segment_ranges(text: &str, spans: &[CitationSpan]) -> Vec<std::ops::Range<usize>> {
    let in_span = |i: usize| spans.iter().any(|s| s.range.contains(&i));
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if in_span(i) {
            continue;
        }
        let end = match c {
            '\n' => Some(i + 1),
            '.' | '!' | '?' => match chars.peek() {
                None => Some(i + 1),
                Some((_, next)) if next.is_whitespace() => Some(i + 1),
                _ => None,
            },
            _ => None,
        };
        if let Some(end) = end {
            if !text[start..end].trim().is_empty() {
                ranges.push(start..end);
            }
            start = end;
        }
    }
    if !text[start..].trim().is_empty() {
        ranges.push(start..text.len());
    }
    ranges
}

const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// A sentence needs a citation if it states a number, a date, or names a
/// proper noun somewhere other than its first word.
pub fn requires_citation(sentence: &str) -> bool {
    if sentence.chars().any(|c| c.is_ascii_digit()) {
        return true;
    }

    let words: Vec<&str> = sentence
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect();

    if words.iter().any(|w| MONTHS.contains(w)) {
        return true;
    }

    words.iter().skip(1).any(|w| {
        let mut chars = w.chars();
        let capitalized = chars.next().map(char::is_uppercase).unwrap_or(false);
        capitalized && *w != "I" && !w.starts_with("I'")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow() -> Allowlist {
        Allowlist::default()
            .with_claim("c1")
            .with_quote("q1")
            .with_source("https://example.org/paris")
    }

    #[test]
    fn test_no_tokens_is_vacuous_pass() {
        let v = verify("Nothing cited here.", &allow());
        assert!(v.ok);
        assert!(v.citations.is_empty());
        assert!(verify("", &Allowlist::default()).ok);
    }

    #[test]
    fn test_unknown_id_is_reported_per_kind() {
        let v = verify(
            "A [Claim: c1]. B [Claim: c99]. C [Quote: q2]. D [Source: https://evil.test].",
            &allow(),
        );
        assert!(!v.ok);
        assert_eq!(v.invalid.claims, vec!["c99".to_string()]);
        assert_eq!(v.invalid.quotes, vec!["q2".to_string()]);
        assert_eq!(v.invalid.sources, vec!["https://evil.test".to_string()]);
        assert_eq!(v.citations.len(), 4);
    }

    #[test]
    fn test_kind_mismatch_is_invalid() {
        // c1 is allowed as a claim, not as a quote
        let v = verify("X [Quote: c1]", &allow());
        assert!(!v.ok);
        assert_eq!(v.invalid.quotes, vec!["c1".to_string()]);
    }

    #[test]
    fn test_trailing_citation_belongs_to_previous_sentence() {
        let d = citation_density("Paris is the capital of France. [Claim: c1]", 0.5);
        assert_eq!(d.total_sentences, 1);
        assert_eq!(d.cited_sentences, 1);
        assert!(d.passes);
    }

    #[test]
    fn test_leading_citation_of_next_segment_credits_previous() {
        let d = citation_density(
            "Paris is in France. [Claim: c1] It is large. It has museums.",
            0.5,
        );
        assert_eq!(d.total_sentences, 3);
        assert_eq!(d.cited_sentences, 1);
        assert_eq!(d.requiring_citation, 1);
        assert_eq!(d.requiring_cited, 1);
        // 1/3 below ratio but every requiring sentence is cited
        assert!(d.passes);
    }

    #[test]
    fn test_density_fails_when_factual_sentence_uncited() {
        let d = citation_density(
            "The tower opened in 1889. It is tall. People like it. [Claim: c1] Views are nice.",
            0.5,
        );
        assert_eq!(d.total_sentences, 4);
        assert_eq!(d.cited_sentences, 1);
        assert_eq!(d.uncited_requiring, vec!["The tower opened in 1889.".to_string()]);
        assert!(!d.passes);
    }

    #[test]
    fn test_requires_citation_heuristics() {
        assert!(requires_citation("It has 3 floors."));
        assert!(requires_citation("It opened in March."));
        assert!(requires_citation("The tower is in Paris."));
        assert!(!requires_citation("Paris is lovely."));
        assert!(!requires_citation("I think it is lovely and I'm sure."));
    }

    #[test]
    fn test_truncated_answer_skips_density() {
        let report = verify_with(
            "The tower opened in 1889. It was",
            &allow(),
            VerifyOptions {
                strict: true,
                truncated: true,
            },
            0.5,
        );
        assert!(report.ok);
        assert!(report.density.is_none());
    }

    #[test]
    fn test_strict_mode_combines_both_checks() {
        let report = verify_with(
            "Paris is the capital of France. [Claim: c1]",
            &allow(),
            VerifyOptions {
                strict: true,
                truncated: false,
            },
            0.5,
        );
        assert!(report.ok);
        assert!(report.density.unwrap().passes);
    }

    #[test]
    fn test_verify_is_deterministic() {
        let text = "A [Claim: zz]. B [Claim: aa]. C [Claim: zz].";
        assert_eq!(verify(text, &allow()), verify(text, &allow()));
        assert_eq!(
            verify(text, &allow()).invalid.claims,
            vec!["aa".to_string(), "zz".to_string()]
        );
    }
}
