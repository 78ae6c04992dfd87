//! Per-agent bookkeeping for an execution session
//!
//! The ledger is the authoritative table of every agent seen in a session:
//! lifecycle status, the text of the message currently being streamed, the
//! set of tools invoked, and how many outputs the agent has completed.
//! Records iterate in first-seen order so snapshots render deterministically.
//! Only the reducer mutates the ledger; observers get cloned records.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single agent within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentStatus {
    /// Known (e.g. pre-declared) but not yet active
    Idle,
    /// Announced via `agent-start`, or auto-created, no text yet
    Started,
    /// Currently producing token chunks
    Streaming,
    /// Finished its most recent message
    Completed,
    /// Failed with an agent-scoped error
    Errored,
}

/// Bookkeeping for one agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    /// Agent identifier as it appears on the wire
    pub id: String,

    /// Current lifecycle status
    pub status: AgentStatus,

    /// Accumulated text of the message currently being streamed
    ///
    /// Holds only the in-flight message; cleared when the message is
    /// finalized. Completed text lives in the transcript.
    pub buffered_text: String,

    /// Names of tools this agent has invoked, deduplicated
    pub tools_used: BTreeSet<String>,

    /// Number of completed outputs this agent has produced
    pub output_count: u64,

    /// When this agent last produced any activity
    pub last_active_at: DateTime<Utc>,
}

impl AgentRecord {
    fn new(id: impl Into<String>, status: AgentStatus) -> Self {
        Self {
            id: id.into(),
            status,
            buffered_text: String::new(),
            tools_used: BTreeSet::new(),
            output_count: 0,
            last_active_at: Utc::now(),
        }
    }

    /// Whether this agent has an in-flight streaming message
    pub fn is_streaming(&self) -> bool {
        self.status == AgentStatus::Streaming
    }

    /// Start a fresh message: empty buffer, back to `Started`
    pub(crate) fn begin_message(&mut self) {
        self.status = AgentStatus::Started;
        self.buffered_text.clear();
        self.touch();
    }

    /// Append a streamed fragment verbatim
    pub(crate) fn append_text(&mut self, fragment: &str) {
        self.buffered_text.push_str(fragment);
        self.status = AgentStatus::Streaming;
        self.touch();
    }

    /// Close the current message: buffer cleared, output counted
    pub(crate) fn finish_message(&mut self) {
        self.buffered_text.clear();
        self.output_count += 1;
        self.status = AgentStatus::Completed;
        self.touch();
    }

    /// Record a tool invocation without touching streaming state
    pub(crate) fn record_tool(&mut self, tool: impl Into<String>) {
        self.tools_used.insert(tool.into());
        self.touch();
    }

    /// Mark the agent failed
    pub(crate) fn mark_errored(&mut self) {
        self.status = AgentStatus::Errored;
        self.touch();
    }

    fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }
}

/// Table of all agents seen in a session, in first-seen order
#[derive(Debug, Clone, Default)]
pub struct AgentLedger {
    records: Vec<AgentRecord>,
    index: HashMap<String, usize>,
}

impl AgentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register an agent in `Idle` without marking it active
    ///
    /// Useful when the embedding layer knows the roster up front. A later
    /// `agent-start` or token chunk takes the record through the normal
    /// lifecycle.
    pub fn declare(&mut self, id: impl Into<String>) -> &mut AgentRecord {
        self.entry(id.into(), AgentStatus::Idle)
    }

    /// Fetch the record for `id`, creating it in `Started` if absent
    ///
    /// Creation on first reference is how token chunks for agents whose
    /// `agent-start` was dropped still get rendered.
    pub fn upsert(&mut self, id: &str) -> &mut AgentRecord {
        self.entry(id.to_string(), AgentStatus::Started)
    }

    fn entry(&mut self, id: String, status: AgentStatus) -> &mut AgentRecord {
        if let Some(&pos) = self.index.get(&id) {
            return &mut self.records[pos];
        }
        let pos = self.records.len();
        self.records.push(AgentRecord::new(id.clone(), status));
        self.index.insert(id, pos);
        &mut self.records[pos]
    }

    pub fn get(&self, id: &str) -> Option<&AgentRecord> {
        self.index.get(id).map(|&pos| &self.records[pos])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut AgentRecord> {
        match self.index.get(id) {
            Some(&pos) => Some(&mut self.records[pos]),
            None => None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Records in first-seen order
    pub fn iter(&self) -> impl Iterator<Item = &AgentRecord> {
        self.records.iter()
    }

    /// Cloned records for an observer snapshot
    pub fn records(&self) -> Vec<AgentRecord> {
        self.records.clone()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
