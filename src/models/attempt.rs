use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a single try ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::TransientFailure => "transient_failure",
            AttemptOutcome::PermanentFailure => "permanent_failure",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Record of one HTTP try for one URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchAttempt {
    pub url: String,
    /// Masked proxy key, `None` for a direct connection
    pub proxy: Option<String>,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub bytes_transferred: u64,
    /// `None` when the transport failed before a status line arrived
    pub http_status: Option<u16>,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
