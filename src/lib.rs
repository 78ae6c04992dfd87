//! # swarmlink
//!
//! Client-side reconciliation engine for streamed multi-agent execution sessions.
//!
//! ## Overview
//!
//! `swarmlink` turns a raw stream of execution chunks (tokens, agent
//! lifecycle markers, handoffs, tool calls, errors) into a consistent view
//! of a running swarm: which agents exist and what they are doing, and a
//! transcript with live streaming messages. Delivery strategies (HTTP
//! long-polling, sockets) are pluggable without changing application code.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use swarmlink::{MockExecutionApi, SessionController};
//!
//! # async fn example() -> swarmlink::Result<()> {
//! // Create a controller over any ExecutionApi implementation
//! let api = Arc::new(MockExecutionApi::new());
//! let controller = SessionController::new(api);
//! let mut snapshots = controller.subscribe();
//!
//! // Start an execution; chunks are polled and folded in the background
//! let session_id = controller.start("Summarize this week's incident reports").await?;
//! println!("Started: {session_id}");
//!
//! while let Ok(snapshot) = snapshots.recv().await {
//!     println!("{:?}: {} transcript entries", snapshot.status, snapshot.transcript.len());
//!     if snapshot.status.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery strategies
//!
//! - **polling** — cursor-based HTTP long-polling with bounded retries,
//!   used for long-running executions
//! - **socket** — in-order push over an already-open connection, used for
//!   short interactions; no cursor, no reconnection
//!
//! ## Architecture
//!
//! - **ExecutionApi** trait — backend abstraction the strategies drive
//! - **SessionController** — lifecycle, locking, and snapshot broadcasting
//! - **ExecutionState** — pure reducer folding chunks into ledger + transcript
//! - **SessionSnapshot** — immutable view handed to observers

pub mod chunk;
pub mod error;
pub mod ledger;
pub mod reducer;
pub mod retry;
pub mod session;
pub mod snapshot;
pub mod transcript;
pub mod transport;

// Re-export core types
pub use chunk::Chunk;
pub use error::{Result, SwarmError};
pub use ledger::{AgentLedger, AgentRecord, AgentStatus};
pub use reducer::{ExecutionState, SideEffect};
pub use retry::RetryPolicy;
pub use session::{SessionConfig, SessionController};
pub use snapshot::{SessionSnapshot, SessionStatus, TerminalNotice, TerminalReason};
pub use transcript::{EntryKind, Transcript, TranscriptEntry};
pub use transport::{
    ExecutionApi, MockExecutionApi, PollResponse, RunStatus, StartRequest, StartResponse,
    TransportEvent,
};

// Re-export delivery strategies for convenience
pub use transport::http::HttpExecutionApi;
pub use transport::poll::{PollConfig, PollHandle};
pub use transport::socket::{ChunkSocket, JsonLinesSocket, SocketHandle};
