//! Transcript assembly from streamed chunks
//!
//! The transcript is the ordered list of entries a conversation view renders:
//! agent messages, handoff markers, and system notices. While an agent is
//! streaming, its in-progress message is a single mutable entry carrying the
//! synthetic id `streaming:<agent>` so token chunks find it by identity
//! instead of scanning. Finalization swaps in a fresh permanent id and
//! freezes the content; every entry after that point is immutable.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of row a transcript entry is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    /// Text produced by an agent
    Message,
    /// A `from -> to` control transfer marker
    Handoff,
    /// Client- or server-originated notice (errors, terminal notes)
    SystemNotice,
}

/// One row of the session transcript
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    /// `streaming:<agent>` while open, `msg-<uuid>` once closed
    pub id: String,

    pub kind: EntryKind,

    /// Agent id for messages, source agent for handoffs, `system` otherwise
    pub author: String,

    pub content: String,

    /// True only for the open in-progress message of an agent
    pub streaming: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl TranscriptEntry {
    fn new(id: String, kind: EntryKind, author: impl Into<String>, content: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            author: author.into(),
            content,
            streaming: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Synthetic identity of an agent's open streaming entry
fn stream_key(agent: &str) -> String {
    format!("streaming:{agent}")
}

fn fresh_id() -> String {
    format!("msg-{}", uuid::Uuid::new_v4())
}

/// Ordered transcript with per-agent open-stream bookkeeping
///
/// At most one entry per agent is open at any time; the `open` map points at
/// it. Only the reducer mutates the transcript.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    open: HashMap<String, usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new streaming message for `agent`
    ///
    /// Any previous open entry for the agent is abandoned as-is: it keeps
    /// the text it accumulated, is re-keyed to a permanent id, and stops
    /// being the token target. The two messages are never merged.
    pub fn open_stream(&mut self, agent: &str) {
        self.close_open(agent);
        let pos = self.entries.len();
        let mut entry = TranscriptEntry::new(
            stream_key(agent),
            EntryKind::Message,
            agent,
            String::new(),
        );
        entry.streaming = true;
        self.entries.push(entry);
        self.open.insert(agent.to_string(), pos);
    }

    /// Append a streamed fragment to `agent`'s open entry, creating the
    /// entry first if the opening chunk never arrived
    pub fn append_stream(&mut self, agent: &str, fragment: &str) {
        if !self.open.contains_key(agent) {
            self.open_stream(agent);
        }
        let pos = self.open[agent];
        let entry = &mut self.entries[pos];
        entry.content.push_str(fragment);
        entry.updated_at = Utc::now();
    }

    /// Close `agent`'s open entry, swapping in a permanent identity
    ///
    /// The accumulated content is preserved verbatim, empty included. When
    /// no entry is open (done without any prior chunk for the agent) an
    /// empty finalized entry is created so the completed output is still
    /// visible. Returns the permanent id.
    pub fn finalize_stream(&mut self, agent: &str) -> String {
        if !self.open.contains_key(agent) {
            self.open_stream(agent);
        }
        // close_open cannot miss: the entry was just ensured above
        self.close_open(agent).unwrap_or_default()
    }

    /// Insert a handoff marker, rendered `from -> to (reason)`
    pub fn push_handoff(&mut self, from: &str, to: &str, reason: Option<&str>) {
        let content = match reason {
            Some(reason) => format!("{from} -> {to} ({reason})"),
            None => format!("{from} -> {to}"),
        };
        self.entries.push(TranscriptEntry::new(
            fresh_id(),
            EntryKind::Handoff,
            from,
            content,
        ));
    }

    /// Insert a system notice
    pub fn push_notice(&mut self, author: &str, content: impl Into<String>) {
        self.entries.push(TranscriptEntry::new(
            fresh_id(),
            EntryKind::SystemNotice,
            author,
            content.into(),
        ));
    }

    /// The open streaming entry for `agent`, if any
    pub fn open_entry(&self, agent: &str) -> Option<&TranscriptEntry> {
        self.open.get(agent).map(|&pos| &self.entries[pos])
    }

    pub fn has_open_stream(&self, agent: &str) -> bool {
        self.open.contains_key(agent)
    }

    /// All entries in insertion order
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn close_open(&mut self, agent: &str) -> Option<String> {
        let pos = self.open.remove(agent)?;
        let entry = &mut self.entries[pos];
        entry.id = fresh_id();
        entry.streaming = false;
        entry.updated_at = Utc::now();
        Some(entry.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_append_accumulates() {
        let mut transcript = Transcript::new();
        transcript.open_stream("a");
        transcript.append_stream("a", "Hel");
        transcript.append_stream("a", "lo");

        let entry = transcript.open_entry("a").unwrap();
        assert_eq!(entry.id, "streaming:a");
        assert_eq!(entry.content, "Hello");
        assert!(entry.streaming);
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn test_append_without_open_creates_entry() {
        let mut transcript = Transcript::new();
        transcript.append_stream("a", "orphan text");

        let entry = transcript.open_entry("a").unwrap();
        assert_eq!(entry.content, "orphan text");
        assert_eq!(entry.kind, EntryKind::Message);
    }

    #[test]
    fn test_finalize_swaps_identity() {
        let mut transcript = Transcript::new();
        transcript.open_stream("a");
        transcript.append_stream("a", "Hello");
        let id = transcript.finalize_stream("a");

        assert!(id.starts_with("msg-"));
        assert!(!transcript.has_open_stream("a"));

        let entry = &transcript.entries()[0];
        assert_eq!(entry.id, id);
        assert_eq!(entry.content, "Hello");
        assert!(!entry.streaming);
    }

    #[test]
    fn test_finalize_preserves_empty_content() {
        let mut transcript = Transcript::new();
        transcript.open_stream("a");
        transcript.finalize_stream("a");

        let entry = &transcript.entries()[0];
        assert_eq!(entry.content, "");
        assert!(!entry.streaming);
    }

    #[test]
    fn test_finalize_without_prior_entry() {
        let mut transcript = Transcript::new();
        let id = transcript.finalize_stream("a");

        assert!(id.starts_with("msg-"));
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.entries()[0].content, "");
    }

    #[test]
    fn test_reopen_abandons_previous_entry() {
        let mut transcript = Transcript::new();
        transcript.open_stream("a");
        transcript.append_stream("a", "first attempt");
        transcript.open_stream("a");
        transcript.append_stream("a", "second");

        assert_eq!(transcript.len(), 2);

        let first = &transcript.entries()[0];
        assert_eq!(first.content, "first attempt");
        assert!(!first.streaming);
        assert!(first.id.starts_with("msg-"));

        let second = transcript.open_entry("a").unwrap();
        assert_eq!(second.content, "second");
        assert!(second.streaming);
        assert_eq!(second.id, "streaming:a");
    }

    #[test]
    fn test_at_most_one_open_entry_per_agent() {
        let mut transcript = Transcript::new();
        for _ in 0..4 {
            transcript.open_stream("a");
        }
        let open_count = transcript
            .entries()
            .iter()
            .filter(|e| e.streaming)
            .count();
        assert_eq!(open_count, 1);
    }

    #[test]
    fn test_handoff_rendering() {
        let mut transcript = Transcript::new();
        transcript.push_handoff("A", "B", Some("done"));
        transcript.push_handoff("B", "C", None);

        assert_eq!(transcript.entries()[0].content, "A -> B (done)");
        assert_eq!(transcript.entries()[0].kind, EntryKind::Handoff);
        assert_eq!(transcript.entries()[0].author, "A");
        assert_eq!(transcript.entries()[1].content, "B -> C");
    }

    #[test]
    fn test_notice_entry() {
        let mut transcript = Transcript::new();
        transcript.push_notice("system", "backend unavailable");

        let entry = &transcript.entries()[0];
        assert_eq!(entry.kind, EntryKind::SystemNotice);
        assert_eq!(entry.author, "system");
        assert_eq!(entry.content, "backend unavailable");
        assert!(!entry.streaming);
    }

    #[test]
    fn test_entries_keep_insertion_order() {
        let mut transcript = Transcript::new();
        transcript.open_stream("a");
        transcript.append_stream("a", "hi");
        transcript.push_handoff("a", "b", None);
        transcript.append_stream("b", "hello");

        let kinds: Vec<EntryKind> = transcript.entries().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EntryKind::Message, EntryKind::Handoff, EntryKind::Message]
        );
    }

    #[test]
    fn test_entry_serialization_camel_case() {
        let mut transcript = Transcript::new();
        transcript.append_stream("a", "hi");

        let json = serde_json::to_string(transcript.entries()).unwrap();
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"updatedAt\""));
        assert!(json.contains("\"kind\":\"message\""));
        assert!(json.contains("\"streaming\":true"));
    }
}
