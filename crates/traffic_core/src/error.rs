use std::fmt;

use thiserror::Error;

/// Where a previously seen idempotency key stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The keyed operation was applied; retries are reported as already done.
    Completed,
    /// Another request holds the key and has not finished yet.
    InFlight,
    /// The keyed operation failed terminally; the key cannot be reused.
    Failed,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::InFlight => "in flight",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("duplicate request: key {key} already {disposition}")]
    DuplicateRequest { key: String, disposition: Disposition },

    #[error("state conflict: event {event} is not valid from state {state}")]
    StateConflict { state: String, event: String },

    #[error("infrastructure: {0}")]
    Infrastructure(#[from] anyhow::Error),
}

impl TrafficError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Validation(_) => 400,
            Self::DuplicateRequest {
                disposition: Disposition::Completed,
                ..
            } => 208,
            Self::DuplicateRequest { .. } => 409,
            Self::StateConflict { .. } => 409,
            Self::Infrastructure(_) => 500,
        }
    }

    /// Short machine-readable tag used in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::DuplicateRequest { .. } => "duplicate_request",
            Self::StateConflict { .. } => "state_conflict",
            Self::Infrastructure(_) => "infrastructure",
        }
    }

    /// Only infrastructure failures leave a keyed command open for a retry
    /// with the same idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<serde_json::Error> for TrafficError {
    fn from(e: serde_json::Error) -> Self {
        Self::Infrastructure(e.into())
    }
}
