//! Fixed-grammar scanner for inline citation tokens.
//!
//! Grammar: `[` Keyword `:` identifier `]` where Keyword is exactly one of
//! `Claim`, `Quote`, `Source`. Anything else between brackets, unterminated
//! brackets, and nested `[` are skipped, never reported as errors.

use std::ops::Range;

use crate::domain::{CitationKind, CitationToken};

/// A citation token and the byte range it occupies in the scanned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CitationSpan {
    pub range: Range<usize>,
    pub token: CitationToken,
}

/// All well-formed citation tokens in `text`, in order of appearance.
pub fn extract_citations(text: &str) -> Vec<CitationToken> {
    scan(text).into_iter().map(|s| s.token).collect()
}

/// All well-formed citation tokens with their byte ranges.
pub fn scan(text: &str) -> Vec<CitationSpan> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = text[cursor..].find('[') {
        let open = cursor + rel;
        let body_start = open + 1;
        let rest = &text[body_start..];

        match rest.find(['[', ']']) {
            Some(j) if rest.as_bytes()[j] == b']' => {
                let close = body_start + j;
                if let Some(token) = parse_body(&text[body_start..close]) {
                    spans.push(CitationSpan {
                        range: open..close + 1,
                        token,
                    });
                    cursor = close + 1;
                } else {
                    cursor = body_start;
                }
            }
            // Another '[' before any ']': restart from the inner bracket.
            Some(j) => cursor = body_start + j,
            None => break,
        }
    }

    spans
}

fn parse_body(body: &str) -> Option<CitationToken> {
    let (keyword, id) = body.split_once(':')?;
    let kind = CitationKind::from_keyword(keyword.trim())?;
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    Some(CitationToken::new(kind, id))
}

/// `text` with every citation token removed.
pub fn strip_citations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for span in scan(text) {
        out.push_str(&text[last..span.range.start]);
        last = span.range.end;
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_all_three_kinds() {
        let text = "Paris [Claim: c1] said [Quote: q-7] per [Source: https://example.org/a?b=c].";
        let tokens = extract_citations(text);
        assert_eq!(
            tokens,
            vec![
                CitationToken::new(CitationKind::Claim, "c1"),
                CitationToken::new(CitationKind::Quote, "q-7"),
                CitationToken::new(CitationKind::Source, "https://example.org/a?b=c"),
            ]
        );
    }

    #[test]
    fn test_ignores_malformed_tokens() {
        let text = "[Claim c1] [claim: c2] [Claim: ] [Fact: f1] [Claim: c3";
        assert!(extract_citations(text).is_empty());
    }

    #[test]
    fn test_nested_bracket_restarts_at_inner() {
        let tokens = extract_citations("[note [Claim: c1] tail]");
        assert_eq!(tokens, vec![CitationToken::new(CitationKind::Claim, "c1")]);
    }

    #[test]
    fn test_ranges_cover_token_text() {
        let text = "x [Quote: q1] y";
        let spans = scan(text);
        assert_eq!(&text[spans[0].range.clone()], "[Quote: q1]");
    }

    #[test]
    fn test_strip_citations() {
        assert_eq!(
            strip_citations("Paris is the capital. [Claim: c1] Yes."),
            "Paris is the capital.  Yes."
        );
    }
}
