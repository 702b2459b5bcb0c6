//! Evidence chunks, citation tokens, and the per-request allowlist.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of evidence a chunk carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Session,
    Quote,
    Claim,
    Concept,
    Source,
    Community,
}

impl ChunkKind {
    /// The citation kind a chunk of this kind may be cited as, if any.
    pub fn citation_kind(self) -> Option<CitationKind> {
        match self {
            Self::Claim => Some(CitationKind::Claim),
            Self::Quote => Some(CitationKind::Quote),
            Self::Source => Some(CitationKind::Source),
            Self::Session | Self::Concept | Self::Community => None,
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Session => "session",
            Self::Quote => "quote",
            Self::Claim => "claim",
            Self::Concept => "concept",
            Self::Source => "source",
            Self::Community => "community",
        };
        f.write_str(s)
    }
}

/// A retrievable unit of supporting material. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceChunk {
    pub content: String,
    pub kind: ChunkKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl EvidenceChunk {
    pub fn new(kind: ChunkKind, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Rough token estimate: one token per four characters, rounded up.
    pub fn estimated_tokens(&self) -> usize {
        self.content.chars().count().div_ceil(4)
    }

    /// The first `max_chars` characters of the content, with an ellipsis when cut.
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.content.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{head}…")
        } else {
            head
        }
    }

    /// The inline citation token for this chunk, if it is citable.
    pub fn citation(&self) -> Option<CitationToken> {
        let kind = self.kind.citation_kind()?;
        let id = self.id.as_deref()?.trim();
        if id.is_empty() {
            return None;
        }
        Some(CitationToken::new(kind, id))
    }
}

/// An evidence chunk with its relevance score for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: EvidenceChunk,
    /// Importance score (0.0 - 1.0)
    pub score: f64,
    /// One-line justification for the score
    pub reasoning: String,
}

impl ScoredChunk {
    pub fn estimated_tokens(&self) -> usize {
        self.chunk.estimated_tokens()
    }
}

/// Citable evidence kinds, as they appear in the `[Kind: id]` wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationKind {
    Claim,
    Quote,
    Source,
}

impl CitationKind {
    pub const ALL: [CitationKind; 3] = [Self::Claim, Self::Quote, Self::Source];

    /// Keyword used inside the bracket, e.g. `Claim` in `[Claim: c1]`.
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Claim => "Claim",
            Self::Quote => "Quote",
            Self::Source => "Source",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.keyword() == keyword)
    }
}

/// A citation parsed from generated text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CitationToken {
    pub kind: CitationKind,
    pub id: String,
}

impl CitationToken {
    pub fn new(kind: CitationKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for CitationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}: {}]", self.kind.keyword(), self.id)
    }
}

/// Evidence identifiers actually shown to the generator for one request.
///
/// Built only from selected chunks; citations outside it are fabricated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowlist {
    claim_ids: BTreeSet<String>,
    quote_ids: BTreeSet<String>,
    source_urls: BTreeSet<String>,
}

impl Allowlist {
    /// Build the allowlist from the chunks the selector chose.
    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a EvidenceChunk>) -> Self {
        chunks
            .into_iter()
            .filter_map(EvidenceChunk::citation)
            .fold(Self::default(), |list, token| list.with(token.kind, token.id))
    }

    pub fn from_selected(selected: &[ScoredChunk]) -> Self {
        Self::from_chunks(selected.iter().map(|s| &s.chunk))
    }

    pub fn with(mut self, kind: CitationKind, id: impl Into<String>) -> Self {
        self.set_mut(kind).insert(id.into());
        self
    }

    pub fn with_claim(self, id: impl Into<String>) -> Self {
        self.with(CitationKind::Claim, id)
    }

    pub fn with_quote(self, id: impl Into<String>) -> Self {
        self.with(CitationKind::Quote, id)
    }

    pub fn with_source(self, url: impl Into<String>) -> Self {
        self.with(CitationKind::Source, url)
    }

    pub fn contains(&self, kind: CitationKind, id: &str) -> bool {
        self.set(kind).contains(id)
    }

    pub fn set(&self, kind: CitationKind) -> &BTreeSet<String> {
        match kind {
            CitationKind::Claim => &self.claim_ids,
            CitationKind::Quote => &self.quote_ids,
            CitationKind::Source => &self.source_urls,
        }
    }

    fn set_mut(&mut self, kind: CitationKind) -> &mut BTreeSet<String> {
        match kind {
            CitationKind::Claim => &mut self.claim_ids,
            CitationKind::Quote => &mut self.quote_ids,
            CitationKind::Source => &mut self.source_urls,
        }
    }

    pub fn len(&self) -> usize {
        self.claim_ids.len() + self.quote_ids.len() + self.source_urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
