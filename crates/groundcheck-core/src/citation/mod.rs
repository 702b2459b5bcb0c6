//! Citation verification.
//!
//! # Module layout
//!
//! - [`scanner`]: `[Kind: id]` token extraction over literal delimiters
//! - [`verify`]: pure allowlist check and strict-mode density check
//! - [`guard`]: one-shot corrective regeneration and warning banner

pub mod guard;
pub mod scanner;
pub mod verify;

pub use guard::{corrective_reminder, CitationConfig, CitationGuard, GuardOutcome};
pub use scanner::{extract_citations, scan, strip_citations, CitationSpan};
pub use verify::{
    citation_density, requires_citation, verify, verify_with, CitationReport, DensityReport,
    InvalidCitations, Verification, VerifyOptions,
};
