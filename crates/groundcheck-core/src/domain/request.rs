//! Request-side types: answer requests, modes, and user preferences.

use serde::{Deserialize, Serialize};

/// How much effort the answer should take.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerMode {
    Quick,
    #[default]
    Standard,
    Deep,
}

impl AnswerMode {
    /// Output token cap multiplier relative to the configured default.
    pub fn max_tokens_factor(self) -> f32 {
        match self {
            Self::Quick => 0.5,
            Self::Standard => 1.0,
            Self::Deep => 2.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Deep => "deep",
        }
    }
}

/// Style and focus inputs that shape prompt construction.
///
/// Best-effort: a missing or failing store yields the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub style_examples: Vec<String>,
    pub profile: Option<String>,
    pub focus_areas: Vec<String>,
    pub tone: Option<String>,
    /// Ask the quality stage for a short summary of the final answer.
    pub want_summary: bool,
}

impl Preferences {
    /// Fill fields left empty here from `stored`; explicit values win.
    pub fn merged_with(mut self, stored: Preferences) -> Self {
        if self.style_examples.is_empty() {
            self.style_examples = stored.style_examples;
        }
        if self.profile.is_none() {
            self.profile = stored.profile;
        }
        if self.focus_areas.is_empty() {
            self.focus_areas = stored.focus_areas;
        }
        if self.tone.is_none() {
            self.tone = stored.tone;
        }
        self.want_summary |= stored.want_summary;
        self
    }
}

/// One user question to answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub question: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub mode: AnswerMode,
    #[serde(default)]
    pub preferences: Preferences,
    /// Require citation density on top of allowlist validation.
    #[serde(default)]
    pub strict_citations: bool,
    /// Evidence token budget; the configured default applies when absent.
    #[serde(default)]
    pub token_budget: Option<usize>,
}

impl AnswerRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            session_id: None,
            graph_id: None,
            mode: AnswerMode::default(),
            preferences: Preferences::default(),
            strict_citations: false,
            token_budget: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_graph(mut self, graph_id: impl Into<String>) -> Self {
        self.graph_id = Some(graph_id.into());
        self
    }

    pub fn with_mode(mut self, mode: AnswerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_preferences(mut self, preferences: Preferences) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict_citations = true;
        self
    }

    pub fn with_token_budget(mut self, budget: usize) -> Self {
        self.token_budget = Some(budget);
        self
    }
}
