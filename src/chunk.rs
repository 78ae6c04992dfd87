//! Wire chunk model for execution streams
//!
//! A chunk is one record from the backend's event feed, discriminated by a
//! `type` field. The vocabulary is open-ended on the server side, so the
//! model is deliberately tolerant: unrecognized `type` values map to
//! [`Chunk::Unknown`], unrecognized fields are ignored, and payload fields
//! are optional so one malformed record never sinks a whole batch. The
//! reducer validates payloads before acting on them.

use serde::{Deserialize, Serialize};

/// A single record from an execution stream
///
/// Wire shape: `{"type": "...", "agent": ..., "content": ..., "tool": ...,
/// "from": ..., "to": ..., "reason": ..., "message": ...}` with only the
/// fields relevant to each type present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Chunk {
    /// An agent began (or re-began) producing a message
    #[serde(rename = "agent-start")]
    AgentStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },

    /// An incremental text fragment of an agent's current message
    ///
    /// Some backends emit these as `delta` instead of `token`.
    #[serde(rename = "token", alias = "delta")]
    Token {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// An agent finished its current message
    #[serde(rename = "agent-done", alias = "agent-completed")]
    AgentDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },

    /// Control passed from one agent to another
    #[serde(rename = "handoff")]
    Handoff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// An agent invoked a tool
    #[serde(rename = "tool", alias = "tool-call")]
    Tool {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },

    /// A tool invocation returned
    #[serde(rename = "tool-result")]
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },

    /// Something failed; scoped to one agent when `agent` is present,
    /// otherwise to the whole session
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The whole execution completed
    #[serde(rename = "done")]
    Done,

    /// Out-of-band payload for an external canvas/operations surface
    #[serde(rename = "operations")]
    Operations {
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// A chunk type this client does not understand — always a no-op
    #[serde(other, rename = "unknown")]
    Unknown,
}

impl Chunk {
    /// Build an `agent-start` chunk
    pub fn agent_start(agent: impl Into<String>) -> Self {
        Chunk::AgentStart {
            agent: Some(agent.into()),
        }
    }

    /// Build a `token` chunk
    pub fn token(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Chunk::Token {
            agent: Some(agent.into()),
            content: Some(content.into()),
        }
    }

    /// Build an `agent-done` chunk
    pub fn agent_done(agent: impl Into<String>) -> Self {
        Chunk::AgentDone {
            agent: Some(agent.into()),
        }
    }

    /// Build a `handoff` chunk without a reason
    pub fn handoff(from: impl Into<String>, to: impl Into<String>) -> Self {
        Chunk::Handoff {
            from: Some(from.into()),
            to: Some(to.into()),
            reason: None,
        }
    }

    /// Build a `handoff` chunk with a reason
    pub fn handoff_with_reason(
        from: impl Into<String>,
        to: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Chunk::Handoff {
            from: Some(from.into()),
            to: Some(to.into()),
            reason: Some(reason.into()),
        }
    }

    /// Build a `tool` chunk
    pub fn tool(agent: impl Into<String>, tool: impl Into<String>) -> Self {
        Chunk::Tool {
            agent: Some(agent.into()),
            tool: Some(tool.into()),
        }
    }

    /// Build a `tool-result` chunk
    pub fn tool_result(agent: impl Into<String>, tool: impl Into<String>) -> Self {
        Chunk::ToolResult {
            agent: Some(agent.into()),
            tool: Some(tool.into()),
        }
    }

    /// Build a session-scoped `error` chunk
    pub fn session_error(message: impl Into<String>) -> Self {
        Chunk::Error {
            agent: None,
            message: Some(message.into()),
        }
    }

    /// Build an agent-scoped `error` chunk
    pub fn agent_error(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Chunk::Error {
            agent: Some(agent.into()),
            message: Some(message.into()),
        }
    }

    /// Wire name of this chunk's type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Chunk::AgentStart { .. } => "agent-start",
            Chunk::Token { .. } => "token",
            Chunk::AgentDone { .. } => "agent-done",
            Chunk::Handoff { .. } => "handoff",
            Chunk::Tool { .. } => "tool",
            Chunk::ToolResult { .. } => "tool-result",
            Chunk::Error { .. } => "error",
            Chunk::Done => "done",
            Chunk::Operations { .. } => "operations",
            Chunk::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent_start() {
        let chunk: Chunk = serde_json::from_str(r#"{"type":"agent-start","agent":"researcher"}"#)
            .unwrap();
        assert_eq!(chunk, Chunk::agent_start("researcher"));
        assert_eq!(chunk.kind(), "agent-start");
    }

    #[test]
    fn test_parse_token_and_delta_alias() {
        let token: Chunk =
            serde_json::from_str(r#"{"type":"token","agent":"a","content":"Hel"}"#).unwrap();
        let delta: Chunk =
            serde_json::from_str(r#"{"type":"delta","agent":"a","content":"Hel"}"#).unwrap();
        assert_eq!(token, Chunk::token("a", "Hel"));
        assert_eq!(delta, token);
    }

    #[test]
    fn test_parse_agent_done_aliases() {
        let done: Chunk = serde_json::from_str(r#"{"type":"agent-done","agent":"a"}"#).unwrap();
        let completed: Chunk =
            serde_json::from_str(r#"{"type":"agent-completed","agent":"a"}"#).unwrap();
        assert_eq!(done, Chunk::agent_done("a"));
        assert_eq!(completed, done);
    }

    #[test]
    fn test_parse_handoff() {
        let chunk: Chunk =
            serde_json::from_str(r#"{"type":"handoff","from":"A","to":"B","reason":"done"}"#)
                .unwrap();
        assert_eq!(chunk, Chunk::handoff_with_reason("A", "B", "done"));

        let bare: Chunk = serde_json::from_str(r#"{"type":"handoff","from":"A","to":"B"}"#).unwrap();
        assert_eq!(bare, Chunk::handoff("A", "B"));
    }

    #[test]
    fn test_parse_tool_chunks() {
        let tool: Chunk =
            serde_json::from_str(r#"{"type":"tool","agent":"a","tool":"web_search"}"#).unwrap();
        assert_eq!(tool, Chunk::tool("a", "web_search"));

        let alias: Chunk =
            serde_json::from_str(r#"{"type":"tool-call","agent":"a","tool":"web_search"}"#)
                .unwrap();
        assert_eq!(alias, tool);

        let result: Chunk =
            serde_json::from_str(r#"{"type":"tool-result","agent":"a","tool":"web_search"}"#)
                .unwrap();
        assert_eq!(result, Chunk::tool_result("a", "web_search"));
    }

    #[test]
    fn test_parse_error_scopes() {
        let session: Chunk =
            serde_json::from_str(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(session, Chunk::session_error("boom"));

        let agent: Chunk =
            serde_json::from_str(r#"{"type":"error","agent":"a","message":"boom"}"#).unwrap();
        assert_eq!(agent, Chunk::agent_error("a", "boom"));
    }

    #[test]
    fn test_parse_done() {
        let chunk: Chunk = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert_eq!(chunk, Chunk::Done);
    }

    #[test]
    fn test_parse_operations_payload() {
        let chunk: Chunk =
            serde_json::from_str(r#"{"type":"operations","payload":{"cells":[1,2]}}"#).unwrap();
        match chunk {
            Chunk::Operations { payload } => {
                assert_eq!(payload["cells"][1], 2);
            }
            other => panic!("expected operations chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_maps_to_unknown() {
        let chunk: Chunk =
            serde_json::from_str(r#"{"type":"telemetry","cpu":0.93}"#).unwrap();
        assert_eq!(chunk, Chunk::Unknown);
        assert_eq!(chunk.kind(), "unknown");
    }

    #[test]
    fn test_extra_fields_ignored() {
        let chunk: Chunk = serde_json::from_str(
            r#"{"type":"token","agent":"a","content":"hi","traceId":"t-1","seq":9}"#,
        )
        .unwrap();
        assert_eq!(chunk, Chunk::token("a", "hi"));
    }

    #[test]
    fn test_missing_payload_fields_tolerated() {
        // The reducer decides what to do with these; parsing must not fail.
        let chunk: Chunk = serde_json::from_str(r#"{"type":"token","agent":"a"}"#).unwrap();
        assert_eq!(
            chunk,
            Chunk::Token {
                agent: Some("a".to_string()),
                content: None,
            }
        );

        let chunk: Chunk = serde_json::from_str(r#"{"type":"agent-start"}"#).unwrap();
        assert_eq!(chunk, Chunk::AgentStart { agent: None });
    }

    #[test]
    fn test_serialization_tags() {
        let json = serde_json::to_string(&Chunk::token("a", "hi")).unwrap();
        assert!(json.contains("\"type\":\"token\""));
        assert!(json.contains("\"agent\":\"a\""));
        assert!(json.contains("\"content\":\"hi\""));

        let json = serde_json::to_string(&Chunk::Done).unwrap();
        assert_eq!(json, r#"{"type":"done"}"#);
    }

    #[test]
    fn test_batch_parse_with_mixed_types() {
        let batch: Vec<Chunk> = serde_json::from_str(
            r#"[
                {"type":"agent-start","agent":"a"},
                {"type":"metrics","latencyMs":12},
                {"type":"token","agent":"a","content":"hi"},
                {"type":"done"}
            ]"#,
        )
        .unwrap();

        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0], Chunk::agent_start("a"));
        assert_eq!(batch[1], Chunk::Unknown);
        assert_eq!(batch[2], Chunk::token("a", "hi"));
        assert_eq!(batch[3], Chunk::Done);
    }
}
