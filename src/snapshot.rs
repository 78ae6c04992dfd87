//! Observer-facing session state
//!
//! Presentation layers never see live ledger or transcript references; they
//! receive a [`SessionSnapshot`] clone after each applied batch and can
//! render it without locking or racing the transport loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SwarmError;
use crate::ledger::AgentRecord;
use crate::transcript::TranscriptEntry;

/// Lifecycle of a session as observed by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    /// No execution started yet
    Idle,
    /// `start` request in flight
    Starting,
    /// Accepted by the backend, not yet producing chunks
    Pending,
    /// Chunks flowing
    Running,
    /// The backend is waiting on user input
    WaitingForClarification,
    /// Terminal: clean completion
    Completed,
    /// Terminal: the session failed
    Failed,
    /// Terminal: stopped by the user
    Stopped,
}

impl SessionStatus {
    /// Terminal states accept no further chunks
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Stopped
        )
    }

    /// Whether an execution is underway (terminal and idle excluded)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Starting
                | SessionStatus::Pending
                | SessionStatus::Running
                | SessionStatus::WaitingForClarification
        )
    }
}

/// Why a session ended, as surfaced to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminalReason {
    /// The execution finished normally
    Completed,
    /// The execution failed (in-band error or rejected request)
    Failed,
    /// The backend no longer knows the session
    SessionExpired,
    /// The backend kept failing past the retry ceiling
    ServerError,
    /// The backend could not be reached, or the connection dropped
    ConnectionLost,
    /// The overall wall-clock budget expired
    TimedOut,
    /// The user stopped the session
    Cancelled,
}

impl TerminalReason {
    /// Classify a fatal transport error into a user-facing reason
    pub fn from_error(err: &SwarmError) -> Self {
        match err {
            SwarmError::SessionNotFound(_) => TerminalReason::SessionExpired,
            SwarmError::TransientServer { .. } => TerminalReason::ServerError,
            SwarmError::Connectivity(_) => TerminalReason::ConnectionLost,
            SwarmError::Timeout { .. } => TerminalReason::TimedOut,
            SwarmError::Cancelled => TerminalReason::Cancelled,
            SwarmError::SessionError(_)
            | SwarmError::Api { .. }
            | SwarmError::InvalidRequest(_)
            | SwarmError::Serialization(_) => TerminalReason::Failed,
        }
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TerminalReason::Completed => "completed",
            TerminalReason::Failed => "failed",
            TerminalReason::SessionExpired => "session not found",
            TerminalReason::ServerError => "server error",
            TerminalReason::ConnectionLost => "backend unavailable",
            TerminalReason::TimedOut => "timed out",
            TerminalReason::Cancelled => "stopped by user",
        };
        write!(f, "{text}")
    }
}

/// The single terminal notification attached to an ended session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalNotice {
    pub reason: TerminalReason,
    pub message: String,
}

impl TerminalNotice {
    pub fn completed() -> Self {
        Self {
            reason: TerminalReason::Completed,
            message: "Execution completed".to_string(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            reason: TerminalReason::Cancelled,
            message: "Execution stopped by user".to_string(),
        }
    }

    pub fn from_error(err: &SwarmError) -> Self {
        Self {
            reason: TerminalReason::from_error(err),
            message: err.to_string(),
        }
    }
}

/// Immutable view of a session handed to observers
///
/// A fresh clone is broadcast after every applied batch and every status
/// transition; holding one never blocks the session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Backend session id, absent until `start` succeeds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    pub status: SessionStatus,

    /// Agent records in first-seen order
    pub agents: Vec<AgentRecord>,

    /// Transcript entries in insertion order
    pub transcript: Vec<TranscriptEntry>,

    /// Chunks applied so far (mirrors the transport cursor)
    pub chunks_consumed: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Present exactly once the session is terminal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalNotice>,
}

impl SessionSnapshot {
    /// Snapshot of a session that has not started
    pub fn idle() -> Self {
        Self {
            session_id: None,
            status: SessionStatus::Idle,
            agents: Vec::new(),
            transcript: Vec::new(),
            chunks_consumed: 0,
            started_at: None,
            ended_at: None,
            terminal: None,
        }
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}
