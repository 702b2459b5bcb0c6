//! Pipeline configuration.
//!
//! Every field has a default, so an empty TOML file is a valid config.
//! `GROUNDCHECK_*` environment variables override individual values after
//! the file is read.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::citation::CitationConfig;
use crate::domain::{GroundcheckError, Result};
use crate::ledger::LedgerConfig;
use crate::quality::QualityConfig;
use crate::selector::SelectorConfig;

/// Timeouts for collaborator calls that are not owned by a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub retrieval_ms: u64,
    pub preferences_ms: u64,
    /// Primary answer generation.
    pub generation_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            retrieval_ms: 10_000,
            preferences_ms: 2_000,
            generation_ms: 60_000,
        }
    }
}

/// Parameters of the primary answer generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    /// Output tokens at `standard` mode; scaled per mode.
    pub max_tokens: u32,
    /// Evidence token budget when the request doesn't set one.
    pub default_token_budget: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 1024,
            default_token_budget: 4000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub selector: SelectorConfig,
    pub citation: CitationConfig,
    pub quality: QualityConfig,
    pub ledger: LedgerConfig,
    pub cache: CacheConfig,
    pub timeouts: TimeoutConfig,
    pub generation: GenerationConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| GroundcheckError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)?.with_env_overrides()
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GROUNDCHECK_STRICT_CITATIONS") {
            self.citation.strict_by_default = parse_bool("GROUNDCHECK_STRICT_CITATIONS", &v)?;
        }
        if let Some(v) = get("GROUNDCHECK_MIN_CITED_RATIO") {
            self.citation.min_cited_ratio = parse("GROUNDCHECK_MIN_CITED_RATIO", &v)?;
        }
        if let Some(v) = get("GROUNDCHECK_PASS_THRESHOLD") {
            self.quality.pass_threshold = parse("GROUNDCHECK_PASS_THRESHOLD", &v)?;
        }
        if let Some(v) = get("GROUNDCHECK_QUALITY_ENABLED") {
            self.quality.enabled = parse_bool("GROUNDCHECK_QUALITY_ENABLED", &v)?;
        }
        if let Some(v) = get("GROUNDCHECK_REFINE") {
            self.quality.refine = parse_bool("GROUNDCHECK_REFINE", &v)?;
        }
        if let Some(v) = get("GROUNDCHECK_CACHE_ENABLED") {
            self.cache.enabled = parse_bool("GROUNDCHECK_CACHE_ENABLED", &v)?;
        }
        if let Some(v) = get("GROUNDCHECK_CACHE_TTL_MS") {
            self.cache.default_ttl_ms = parse("GROUNDCHECK_CACHE_TTL_MS", &v)?;
        }
        if let Some(v) = get("GROUNDCHECK_CACHE_CAPACITY") {
            self.cache.capacity = parse("GROUNDCHECK_CACHE_CAPACITY", &v)?;
        }
        if let Some(v) = get("GROUNDCHECK_LEDGER_CAPACITY") {
            self.ledger.capacity = parse("GROUNDCHECK_LEDGER_CAPACITY", &v)?;
        }
        if let Some(v) = get("GROUNDCHECK_TOKEN_BUDGET") {
            self.generation.default_token_budget = parse("GROUNDCHECK_TOKEN_BUDGET", &v)?;
        }
        if let Some(v) = get("GROUNDCHECK_GENERATION_TIMEOUT_MS") {
            self.timeouts.generation_ms = parse("GROUNDCHECK_GENERATION_TIMEOUT_MS", &v)?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(GroundcheckError::Config(format!(
                    "{name} must be within 0..=1, got {v}"
                )))
            }
        };
        unit("selector.budget_ratio", self.selector.budget_ratio)?;
        unit("selector.neutral_score", self.selector.neutral_score)?;
        unit("citation.min_cited_ratio", self.citation.min_cited_ratio)?;
        unit("quality.pass_threshold", self.quality.pass_threshold)?;
        if self.cache.capacity == 0 {
            return Err(GroundcheckError::Config(
                "cache.capacity must be at least 1".into(),
            ));
        }
        if self.ledger.capacity == 0 {
            return Err(GroundcheckError::Config(
                "ledger.capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| GroundcheckError::Config(format!("{name}={raw:?}: {e}")))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(GroundcheckError::Config(format!(
            "{name}={raw:?}: expected a boolean"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(
            PipelineConfig::from_toml_str("").unwrap(),
            PipelineConfig::default()
        );
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [citation]
            strict_by_default = true

            [cache]
            default_ttl_ms = 1000
            "#,
        )
        .unwrap();
        assert!(config.citation.strict_by_default);
        assert_eq!(config.citation.min_cited_ratio, 0.5);
        assert_eq!(config.cache.default_ttl_ms, 1000);
        assert_eq!(config.cache.capacity, 256);
        assert_eq!(config.ledger.capacity, 1000);
    }

    #[test]
    fn test_env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("GROUNDCHECK_STRICT_CITATIONS", "yes"),
            ("GROUNDCHECK_CACHE_ENABLED", "0"),
            ("GROUNDCHECK_TOKEN_BUDGET", "2048"),
        ]
        .into_iter()
        .collect();
        let config = PipelineConfig::default()
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert!(config.citation.strict_by_default);
        assert!(!config.cache.enabled);
        assert_eq!(config.generation.default_token_budget, 2048);
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let err = PipelineConfig::default()
            .apply_overrides(|name| {
                (name == "GROUNDCHECK_PASS_THRESHOLD").then(|| "high".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, GroundcheckError::Config(_)));
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let err = PipelineConfig::from_toml_str("[quality]\npass_threshold = 7.0").unwrap_err();
        assert!(err.to_string().contains("pass_threshold"));
    }
}
