//! Error types for swarmlink
//!
//! Transport-level failures are classified here so the polling loop can
//! decide between retrying and giving up. Chunk-level errors (an agent
//! failing mid-run) never surface as a [`SwarmError`]; the reducer folds
//! them into the ledger and transcript instead.

use thiserror::Error;

/// Errors that can occur while driving an execution session
#[derive(Debug, Error)]
pub enum SwarmError {
    /// The backend no longer knows the session (HTTP 404/410 class)
    ///
    /// Always fatal: the session id will never become valid again, so
    /// retrying only wastes the poll budget.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Server-side failure (HTTP 429/5xx class), retryable with cooldown
    #[error("Server error (HTTP {status}): {body}")]
    TransientServer {
        status: u16,
        body: String,
        /// Server-requested cooldown from a `Retry-After` header, seconds
        retry_after_secs: Option<u64>,
    },

    /// The backend could not be reached at all, retryable with cooldown
    #[error("Connection error: {0}")]
    Connectivity(String),

    /// The overall wall-clock budget for the session expired
    #[error("Session timed out after {waited_secs}s without completing")]
    Timeout { waited_secs: u64 },

    /// Non-retryable HTTP failure outside the known classes (auth, bad request)
    #[error("API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    /// The whole session failed, reported in-band by the chunk feed
    #[error("Session error: {0}")]
    SessionError(String),

    /// The user stopped the session
    #[error("Session stopped by user")]
    Cancelled,

    /// A request was rejected before reaching the backend (e.g. blank task)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SwarmError {
    /// Whether the polling loop may retry after this failure
    ///
    /// Only transient server failures and connectivity failures are
    /// retryable; everything else ends the session on first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwarmError::TransientServer { .. } | SwarmError::Connectivity(_)
        )
    }

    /// Server-requested cooldown, if the failure carried one
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            SwarmError::TransientServer {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SwarmError>;
