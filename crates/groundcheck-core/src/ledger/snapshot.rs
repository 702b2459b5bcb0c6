//! Optional durable snapshot: `<dir>/ledger.json` plus `<dir>/ledger.digest`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{FailureLedger, FailureRecord};
use crate::domain::LedgerError;

const SNAPSHOT_FILE: &str = "ledger.json";
const DIGEST_FILE: &str = "ledger.digest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub written_at: DateTime<Utc>,
    pub capacity: usize,
    /// Oldest first.
    pub records: Vec<FailureRecord>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Persist the ledger's current records. Returns the snapshot path.
pub fn write_snapshot(ledger: &FailureLedger, dir: &Path) -> Result<PathBuf, LedgerError> {
    std::fs::create_dir_all(dir)?;

    let snapshot = LedgerSnapshot {
        written_at: Utc::now(),
        capacity: ledger.capacity(),
        records: ledger.records(),
    };
    let json = serde_json::to_vec_pretty(&snapshot)?;
    let path = dir.join(SNAPSHOT_FILE);

    std::fs::write(&path, &json)?;
    std::fs::write(dir.join(DIGEST_FILE), sha256_hex(&json).as_bytes())?;

    Ok(path)
}

/// Read and verify a snapshot written by [`write_snapshot`].
pub fn read_snapshot(dir: &Path) -> Result<LedgerSnapshot, LedgerError> {
    let json = std::fs::read(dir.join(SNAPSHOT_FILE))?;
    let expected = std::fs::read_to_string(dir.join(DIGEST_FILE))?;
    let actual = sha256_hex(&json);
    if expected.trim() != actual {
        return Err(LedgerError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }
    Ok(serde_json::from_slice(&json)?)
}

impl FailureLedger {
    /// Load `dir`'s snapshot into this ledger, replacing its contents.
    pub fn load_snapshot(&self, dir: &Path) -> Result<usize, LedgerError> {
        let snapshot = read_snapshot(dir)?;
        self.restore(snapshot.records);
        Ok(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::FailureKind;

    #[test]
    fn test_snapshot_restores_records() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FailureLedger::with_capacity(10);
        ledger.record(
            FailureRecord::new("Why?", "because", FailureKind::Coherence)
                .with_details(vec!["jumps between topics".into()])
                .with_context(serde_json::json!({"mode": "quick"})),
        );
        write_snapshot(&ledger, dir.path()).unwrap();

        let restored = FailureLedger::with_capacity(10);
        assert_eq!(restored.load_snapshot(dir.path()).unwrap(), 1);
        assert_eq!(restored.records(), ledger.records());
    }

    #[test]
    fn test_tampered_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FailureLedger::default();
        ledger.record(FailureRecord::new("q", "a", FailureKind::InvalidCitations));
        let path = write_snapshot(&ledger, dir.path()).unwrap();

        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("invalid_citations", "coherence");
        std::fs::write(&path, tampered).unwrap();

        let err = read_snapshot(dir.path()).unwrap_err();
        assert!(matches!(err, LedgerError::DigestMismatch { .. }));
    }
}
