//! Retrieval collaborator interface.
//!
//! The knowledge backend itself lives elsewhere; the pipeline only needs
//! structured evidence keyed by stable ids, which it flattens into
//! [`EvidenceChunk`]s. Ids that never arrive here can never be cited.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ChunkKind, EvidenceChunk, RetrievalError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub statement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    pub title: String,
    pub summary: String,
}

/// Everything the knowledge store returned for one question.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievedEvidence {
    pub claims: Vec<Claim>,
    pub quotes: Vec<Quote>,
    pub sources: Vec<Source>,
    pub concepts: Vec<Concept>,
    pub communities: Vec<Community>,
    /// Free-text notes from the user's current session.
    pub sessions: Vec<String>,
}

impl RetrievedEvidence {
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
            && self.quotes.is_empty()
            && self.sources.is_empty()
            && self.concepts.is_empty()
            && self.communities.is_empty()
            && self.sessions.is_empty()
    }

    /// Flatten into chunks. Claims, quotes and sources keep their ids.
    pub fn into_chunks(self) -> Vec<EvidenceChunk> {
        let mut chunks = Vec::new();
        for note in self.sessions {
            chunks.push(EvidenceChunk::new(ChunkKind::Session, note));
        }
        for claim in self.claims {
            chunks.push(EvidenceChunk::new(ChunkKind::Claim, claim.statement).with_id(claim.id));
        }
        for quote in self.quotes {
            let content = match quote.speaker {
                Some(speaker) => format!("\"{}\" ({speaker})", quote.text),
                None => format!("\"{}\"", quote.text),
            };
            chunks.push(EvidenceChunk::new(ChunkKind::Quote, content).with_id(quote.id));
        }
        for source in self.sources {
            let content = match (source.title, source.snippet) {
                (Some(title), Some(snippet)) => format!("{title}: {snippet}"),
                (Some(text), None) | (None, Some(text)) => text,
                (None, None) => source.url.clone(),
            };
            chunks.push(EvidenceChunk::new(ChunkKind::Source, content).with_id(source.url));
        }
        for concept in self.concepts {
            let content = if concept.description.is_empty() {
                concept.name
            } else {
                format!("{}: {}", concept.name, concept.description)
            };
            chunks.push(EvidenceChunk::new(ChunkKind::Concept, content));
        }
        for community in self.communities {
            chunks.push(EvidenceChunk::new(
                ChunkKind::Community,
                format!("{}: {}", community.title, community.summary),
            ));
        }
        chunks
    }
}

/// What to retrieve evidence for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalQuery {
    pub question: String,
    pub session_id: Option<String>,
    pub graph_id: Option<String>,
}

/// Knowledge-store collaborator.
#[async_trait]
pub trait RetrievalService: Send + Sync {
    async fn retrieve(&self, query: &RetrievalQuery) -> Result<RetrievedEvidence, RetrievalError>;
}

/// Returns the same evidence for every query.
#[derive(Debug, Clone, Default)]
pub struct StaticRetrieval {
    evidence: RetrievedEvidence,
}

impl StaticRetrieval {
    pub fn new(evidence: RetrievedEvidence) -> Self {
        Self { evidence }
    }

    /// Load evidence from a JSON file shaped like [`RetrievedEvidence`].
    pub fn from_json_file(path: &Path) -> crate::domain::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let evidence = serde_json::from_str(&raw)?;
        Ok(Self { evidence })
    }
}

#[async_trait]
impl RetrievalService for StaticRetrieval {
    async fn retrieve(&self, _query: &RetrievalQuery) -> Result<RetrievedEvidence, RetrievalError> {
        Ok(self.evidence.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_chunks_keeps_citable_ids() {
        let evidence: RetrievedEvidence = serde_json::from_str(
            r#"{
                "claims": [{"id": "c1", "statement": "Paris is the capital of France."}],
                "sources": [{"url": "https://example.org/paris", "title": "Paris"}],
                "concepts": [{"name": "Capital city"}]
            }"#,
        )
        .unwrap();
        let chunks = evidence.into_chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].id.as_deref(), Some("c1"));
        assert_eq!(chunks[1].id.as_deref(), Some("https://example.org/paris"));
        assert_eq!(chunks[1].content, "Paris");
        assert_eq!(chunks[2].id, None);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evidence.json");
        std::fs::write(&path, r#"{"quotes": [{"id": "q1", "text": "Hi"}]}"#).unwrap();
        let retrieval = StaticRetrieval::from_json_file(&path).unwrap();
        assert_eq!(retrieval.evidence.quotes.len(), 1);
    }
}
