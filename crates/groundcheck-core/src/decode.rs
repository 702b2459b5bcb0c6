//! Decode-with-fallback boundary for structured generator output.
//!
//! Generated "JSON" arrives wrapped in prose, fenced in markdown, or not at
//! all. [`decode_or_default`] tries a fixed sequence of strategies and always
//! hands back a typed value, recording which strategy produced it. Parse
//! failures never escape this module.

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which extraction step produced a decoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStrategy {
    /// The whole text parsed as-is.
    Direct,
    /// Parsed from a ```json fenced block.
    Fenced,
    /// Parsed from the outermost `{...}` or `[...]` span.
    Spanned,
    /// Nothing parsed; `T::default()` was returned.
    Default,
}

impl DecodeStrategy {
    pub fn is_structured(self) -> bool {
        !matches!(self, Self::Default)
    }
}

/// A decoded value and the strategy that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub value: T,
    pub strategy: DecodeStrategy,
}

/// Decode `text` as `T`, falling back through the strategies in order.
pub fn decode_or_default<T>(text: &str) -> Decoded<T>
where
    T: DeserializeOwned + Default,
{
    match decode(text) {
        Some(decoded) => decoded,
        None => {
            debug!(
                target_type = std::any::type_name::<T>(),
                preview = %text.chars().take(80).collect::<String>(),
                "structured decode failed, using defaults"
            );
            Decoded {
                value: T::default(),
                strategy: DecodeStrategy::Default,
            }
        }
    }
}

/// Decode `text` as `T`, or `None` when no strategy succeeds.
pub fn decode<T: DeserializeOwned>(text: &str) -> Option<Decoded<T>> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(Decoded {
            value,
            strategy: DecodeStrategy::Direct,
        });
    }

    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(block) {
            return Some(Decoded {
                value,
                strategy: DecodeStrategy::Fenced,
            });
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(span) = outer_span(trimmed, open, close) {
            if let Ok(value) = serde_json::from_str(span) {
                return Some(Decoded {
                    value,
                    strategy: DecodeStrategy::Spanned,
                });
            }
        }
    }

    None
}

/// Contents of the first markdown code fence, language tag stripped.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_ticks = &text[start + 3..];
    let body_start = after_ticks.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_ticks[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn outer_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

fn labelled_number_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"(?i)"?([a-z_ ]+)"?\s*[:=]\s*([0-9]*\.?[0-9]+)"#).ok())
        .as_ref()
}

/// Find `label: <number>` (case-insensitive) in free text, clamped to 0..1.
///
/// Last-resort recovery of a score when no JSON could be decoded.
pub fn scan_labelled_score(text: &str, label: &str) -> Option<f64> {
    let wanted = label.to_ascii_lowercase();
    labelled_number_pattern()?
        .captures_iter(text)
        .find(|caps| {
            caps.get(1)
                .map(|m| {
                    let name = m.as_str().trim().to_ascii_lowercase();
                    name == wanted || name.ends_with(&format!(" {wanted}"))
                })
                .unwrap_or(false)
        })
        .and_then(|caps| caps.get(2)?.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| if v > 1.0 && v <= 100.0 { v / 100.0 } else { v })
        .map(|v| v.clamp(0.0, 1.0))
}
