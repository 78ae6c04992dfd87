//! Transport adapters bridging the backend chunk feed to the controller
//!
//! The backend contract is small: start an execution, poll for chunks after
//! a cursor, stop it. [`ExecutionApi`] abstracts that contract so the
//! polling loop, the session controller, and the tests all run against the
//! same interface; [`http::HttpExecutionApi`] is the production
//! implementation and [`MockExecutionApi`] the scripted in-memory one.
//!
//! Two delivery strategies sit on top:
//! - [`poll`] — long-poll loop with cursor, retry ceiling, and budgets
//! - [`socket`] — ordered push feed for short interactions, no cursor

pub mod http;
pub mod poll;
pub mod socket;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::chunk::Chunk;
use crate::error::{Result, SwarmError};

/// Request body for starting an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Natural-language task for the swarm
    pub task: String,

    /// Opaque swarm configuration forwarded verbatim to the backend
    #[serde(default)]
    pub config: serde_json::Value,
}

impl StartRequest {
    pub fn new(task: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            task: task.into(),
            config,
        }
    }
}

/// Response body from starting an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_id: String,
}

/// Server-reported run status carried in poll responses
///
/// The vocabulary is open-ended; values this client does not recognize map
/// to [`RunStatus::Unknown`] and are treated as still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Unknown,
}

impl RunStatus {
    /// Map a wire status string, tolerating dialect variants
    pub fn from_wire(value: &str) -> Self {
        match value {
            "pending" | "queued" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "waiting" | "waitingForClarification" | "waiting-for-clarification" => {
                RunStatus::Waiting
            }
            "completed" | "complete" | "done" | "succeeded" => RunStatus::Completed,
            "failed" | "error" => RunStatus::Failed,
            _ => RunStatus::Unknown,
        }
    }

    /// Whether this status ends the chunk stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus::Unknown
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(RunStatus::from_wire(&value))
    }
}

/// Response body from one poll request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    /// Chunks after the requested cursor, in delivery order
    #[serde(default)]
    pub chunks: Vec<Chunk>,

    /// Run status at the time the poll was answered
    #[serde(default)]
    pub status: RunStatus,

    /// Server-suggested next cursor; advisory, never applied backwards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor_hint: Option<u64>,
}

impl PollResponse {
    /// A still-running response carrying `chunks`
    pub fn running(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks,
            status: RunStatus::Running,
            next_cursor_hint: None,
        }
    }

    /// A terminal completed response carrying the final `chunks`
    pub fn completed(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks,
            status: RunStatus::Completed,
            next_cursor_hint: None,
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_cursor_hint(mut self, hint: u64) -> Self {
        self.next_cursor_hint = Some(hint);
        self
    }
}

/// Backend contract for execution sessions
///
/// Implementations classify failures into [`SwarmError`] so the polling
/// loop can apply its retry policy uniformly.
#[async_trait]
pub trait ExecutionApi: Send + Sync {
    /// Launch an execution and return the backend session id
    async fn start(&self, request: StartRequest) -> Result<StartResponse>;

    /// Long-poll for chunks after `cursor`, holding up to `wait`
    async fn poll(&self, session_id: &str, cursor: u64, wait: Duration) -> Result<PollResponse>;

    /// Best-effort server-side cancellation
    async fn stop(&self, session_id: &str) -> Result<()>;
}

/// Events a transport adapter delivers to the session controller
///
/// Every adapter run that is not cancelled ends with exactly one
/// `Terminal` or `Fatal`; a cancelled run ends silently because the
/// controller already holds the terminal state.
#[derive(Debug)]
pub enum TransportEvent {
    /// A non-empty batch of chunks, in delivery order
    Chunks(Vec<Chunk>),
    /// The server reported a different non-terminal status
    StatusChanged(RunStatus),
    /// The server reported a terminal status; the stream is over
    Terminal(RunStatus),
    /// The transport gave up
    Fatal(SwarmError),
}

/// Scripted in-memory [`ExecutionApi`] for tests and examples
///
/// Poll outcomes are served from a queue in order. Once the queue is empty,
/// polls hold for the full wait budget and return an empty still-running
/// response, like a quiet long-poll endpoint. Calls and cursors are
/// recorded for assertions.
#[derive(Debug, Default)]
pub struct MockExecutionApi {
    session_id: String,
    poll_script: Mutex<VecDeque<Result<PollResponse>>>,
    start_error: Mutex<Option<SwarmError>>,
    poll_delay: Option<Duration>,
    starts: AtomicU32,
    polls: AtomicU32,
    stops: AtomicU32,
    cursors: Mutex<Vec<u64>>,
}

impl MockExecutionApi {
    pub fn new() -> Self {
        Self {
            session_id: "ses-mock".to_string(),
            ..Default::default()
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = id.into();
        self
    }

    /// Delay every scripted poll response, simulating a slow backend
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = Some(delay);
        self
    }

    /// Queue a poll outcome
    pub fn push_response(&self, response: PollResponse) {
        if let Ok(mut script) = self.poll_script.try_lock() {
            script.push_back(Ok(response));
        }
    }

    /// Queue a still-running batch of chunks
    pub fn push_chunks(&self, chunks: Vec<Chunk>) {
        self.push_response(PollResponse::running(chunks));
    }

    /// Queue a poll failure
    pub fn push_failure(&self, error: SwarmError) {
        if let Ok(mut script) = self.poll_script.try_lock() {
            script.push_back(Err(error));
        }
    }

    /// Make the next `start` call fail
    pub fn fail_next_start(&self, error: SwarmError) {
        if let Ok(mut slot) = self.start_error.try_lock() {
            *slot = Some(error);
        }
    }

    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    /// Cursor of every poll made so far, in call order
    pub fn polled_cursors(&self) -> Vec<u64> {
        self.cursors
            .try_lock()
            .map(|cursors| cursors.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionApi for MockExecutionApi {
    async fn start(&self, _request: StartRequest) -> Result<StartResponse> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.start_error.lock().await.take() {
            return Err(err);
        }
        Ok(StartResponse {
            session_id: self.session_id.clone(),
        })
    }

    async fn poll(&self, _session_id: &str, cursor: u64, wait: Duration) -> Result<PollResponse> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().await.push(cursor);

        let next = self.poll_script.lock().await.pop_front();
        match next {
            Some(outcome) => {
                if let Some(delay) = self.poll_delay {
                    tokio::time::sleep(delay).await;
                }
                outcome
            }
            None => {
                // Quiet long-poll: hold the request, then report no news
                tokio::time::sleep(wait).await;
                Ok(PollResponse::running(Vec::new()))
            }
        }
    }

    async fn stop(&self, _session_id: &str) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
