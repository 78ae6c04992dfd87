//! The chunk reducer: folds stream chunks into session state
//!
//! All view-model mutation happens here, single-threaded, one chunk at a
//! time. The reducer owns no I/O and no clock beyond entry timestamps, so
//! every transition is unit-testable: `(state, chunk) -> side effects`.
//! Malformed payloads (missing agent ids and the like) are logged and
//! skipped rather than failing the batch; unknown chunk types change
//! nothing at all.

use crate::chunk::Chunk;
use crate::ledger::AgentLedger;
use crate::transcript::Transcript;

/// Session-level consequences the controller must act on
///
/// The reducer reports these instead of acting on them itself; the
/// controller owns session lifecycle and external surfaces.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// The execution reported clean completion
    SessionCompleted,
    /// A session-scoped error arrived in-band; the session must terminate
    SessionFailed(String),
    /// A payload for an external canvas/operations surface arrived
    OperationsReceived(serde_json::Value),
}

/// Mutable view-model state of one session
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    pub ledger: AgentLedger,
    pub transcript: Transcript,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a batch of chunks in delivery order
    pub fn apply_batch(&mut self, chunks: &[Chunk]) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        for chunk in chunks {
            effects.extend(self.apply(chunk));
        }
        effects
    }

    /// Fold one chunk into the ledger and transcript
    pub fn apply(&mut self, chunk: &Chunk) -> Vec<SideEffect> {
        let mut effects = Vec::new();

        match chunk {
            Chunk::AgentStart { agent: Some(id) } => {
                self.ledger.upsert(id).begin_message();
                self.transcript.open_stream(id);
            }

            Chunk::Token {
                agent: Some(id),
                content: Some(content),
            } => {
                self.ledger.upsert(id).append_text(content);
                self.transcript.append_stream(id, content);
            }

            Chunk::Token {
                agent: Some(id),
                content: None,
            } => {
                tracing::debug!(agent = %id, "token chunk without content, skipping");
            }

            Chunk::AgentDone { agent: Some(id) } => {
                self.ledger.upsert(id).finish_message();
                self.transcript.finalize_stream(id);
            }

            Chunk::Handoff {
                from: Some(from),
                to: Some(to),
                reason,
            } => {
                // The source's in-flight message completes at the handoff
                // boundary; the target starts on its own chunks.
                if self.transcript.has_open_stream(from) {
                    self.transcript.finalize_stream(from);
                    if let Some(record) = self.ledger.get_mut(from) {
                        record.finish_message();
                    }
                }
                self.transcript.push_handoff(from, to, reason.as_deref());
            }

            Chunk::Tool {
                agent: Some(id),
                tool: Some(tool),
            }
            | Chunk::ToolResult {
                agent: Some(id),
                tool: Some(tool),
            } => {
                self.ledger.upsert(id).record_tool(tool.clone());
            }

            Chunk::Error { agent, message } => {
                let message = message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                match agent {
                    Some(id) => {
                        tracing::warn!(agent = %id, error = %message, "agent-scoped error chunk");
                        self.ledger.upsert(id).mark_errored();
                        self.transcript.push_notice(id, message);
                    }
                    None => {
                        tracing::warn!(error = %message, "session-scoped error chunk");
                        self.transcript.push_notice("system", message.clone());
                        effects.push(SideEffect::SessionFailed(message));
                    }
                }
            }

            Chunk::Done => {
                // Servers are expected to close each agent before `done`,
                // but commit any stragglers so no text is stranded in a
                // buffer after a clean completion.
                let dangling: Vec<String> = self
                    .ledger
                    .iter()
                    .filter(|r| self.transcript.has_open_stream(&r.id))
                    .map(|r| r.id.clone())
                    .collect();
                for id in dangling {
                    self.transcript.finalize_stream(&id);
                    if let Some(record) = self.ledger.get_mut(&id) {
                        record.finish_message();
                    }
                }
                effects.push(SideEffect::SessionCompleted);
            }

            Chunk::Operations { payload } => {
                effects.push(SideEffect::OperationsReceived(payload.clone()));
            }

            Chunk::Unknown => {
                tracing::debug!("ignoring unknown chunk type");
            }

            // Known types missing their load-bearing fields: drop rather
            // than guess an attribution or fail the batch.
            other => {
                tracing::warn!(kind = other.kind(), "dropping chunk with missing fields");
            }
        }

        effects
    }
}
