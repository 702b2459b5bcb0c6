//! Preference store collaborator.
//!
//! Best-effort in both directions: a failed load means default preferences,
//! a failed `record_interaction` is logged and dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{PreferenceError, Preferences};

/// One answered question, fed back to the store for profile updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub session_id: String,
    pub question: String,
    pub answer: String,
    pub quality_score: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Preferences, PreferenceError>;

    async fn record_interaction(&self, interaction: Interaction) -> Result<(), PreferenceError>;
}

/// Store that knows nothing and remembers nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPreferenceStore;

#[async_trait]
impl PreferenceStore for NoopPreferenceStore {
    async fn load(&self, _session_id: &str) -> Result<Preferences, PreferenceError> {
        Ok(Preferences::default())
    }

    async fn record_interaction(&self, _interaction: Interaction) -> Result<(), PreferenceError> {
        Ok(())
    }
}
