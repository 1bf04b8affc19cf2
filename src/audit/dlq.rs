//! Dead-letter types and replay accounting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message that could not be processed, parked for replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: String,
    /// Queue discriminator, e.g. `audit.login`
    #[serde(rename = "type")]
    pub entry_type: String,
    pub payload: serde_json::Value,
    pub error_reason: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn new(
        entry_type: impl Into<String>,
        payload: serde_json::Value,
        error_reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entry_type: entry_type.into(),
            payload,
            error_reason: error_reason.into(),
            created_at: Utc::now(),
            replayed_at: None,
        }
    }
}

/// Result of one replay pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayOutcome {
    pub replayed: u32,
    pub failed: u32,
    /// True when the queue had nothing to replay
    pub skipped: bool,
}

impl ReplayOutcome {
    pub fn skipped() -> Self {
        Self {
            replayed: 0,
            failed: 0,
            skipped: true,
        }
    }
}
