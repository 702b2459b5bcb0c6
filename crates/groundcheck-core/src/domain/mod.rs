//! Domain types shared by every pipeline stage.

pub mod error;
pub mod evidence;
pub mod request;

pub use error::{
    CacheError, GenerationError, GroundcheckError, LedgerError, PreferenceError, Result,
    RetrievalError,
};
pub use evidence::{Allowlist, ChunkKind, CitationKind, CitationToken, EvidenceChunk, ScoredChunk};
pub use request::{AnswerMode, AnswerRequest, Preferences};
