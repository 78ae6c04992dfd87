//! Socket delivery strategy
//!
//! For short interactions (one assistant turn rather than a long execution)
//! the backend can push chunks over an already-open connection instead of
//! being polled. The connection promises in-order, exactly-once delivery,
//! so there is no cursor; the listener must be attached before the
//! triggering request is issued so no chunk can be missed.
//!
//! There is deliberately no reconnection machinery here: a connection that
//! drops or closes before a terminal chunk is a fatal loss of the stream,
//! reported once, and the interaction must be restarted from scratch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chunk::Chunk;
use crate::error::{Result, SwarmError};
use crate::transport::{RunStatus, TransportEvent};

/// An ordered, connection-scoped source of chunks
///
/// `next_chunk` returns `Ok(None)` on clean close. Ordering and
/// exactly-once delivery are the connection's promise; the adapter adds
/// neither cursors nor retries on top of it.
#[async_trait]
pub trait ChunkSocket: Send {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>>;
}

/// Newline-delimited JSON chunks over any buffered async reader
///
/// Blank lines are skipped. Malformed lines are logged and skipped so one
/// bad record does not kill the connection; unknown chunk types already
/// parse to [`Chunk::Unknown`] and are handled downstream.
#[derive(Debug)]
pub struct JsonLinesSocket<R> {
    reader: R,
    line: String,
}

impl<R> JsonLinesSocket<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }
}

#[async_trait]
impl<R> ChunkSocket for JsonLinesSocket<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_line(&mut self.line)
                .await
                .map_err(|e| SwarmError::Connectivity(format!("socket read failed: {e}")))?;

            if read == 0 {
                return Ok(None);
            }

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<Chunk>(trimmed) {
                Ok(chunk) => return Ok(Some(chunk)),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed chunk line");
                }
            }
        }
    }
}

/// Handle to a running socket pump
#[derive(Debug)]
pub struct SocketHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SocketHandle {
    /// Ask the pump to stop at the next chunk boundary; idempotent
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Tear the pump down without waiting for the next chunk
    pub fn abort(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Attach a socket and pump its chunks to the controller in order
///
/// Each chunk is forwarded as its own batch. A `done` chunk completes the
/// stream; a close or read failure before that is fatal. A cancelled pump
/// ends silently, like a cancelled poll loop.
pub fn attach<S>(
    socket: S,
    session_id: impl Into<String>,
) -> (mpsc::Receiver<TransportEvent>, SocketHandle)
where
    S: ChunkSocket + 'static,
{
    let session_id = session_id.into();
    let (tx, rx) = mpsc::channel(100);
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();

    let task = tokio::spawn(async move {
        run_socket_pump(socket, session_id, flag, tx).await;
    });

    (rx, SocketHandle { cancelled, task })
}

async fn run_socket_pump<S: ChunkSocket>(
    mut socket: S,
    session_id: String,
    cancelled: Arc<AtomicBool>,
    tx: mpsc::Sender<TransportEvent>,
) {
    loop {
        if cancelled.load(Ordering::SeqCst) {
            tracing::debug!(session = %session_id, "socket pump cancelled");
            return;
        }
        if tx.is_closed() {
            tracing::debug!(session = %session_id, "event receiver dropped, ending socket pump");
            return;
        }

        match socket.next_chunk().await {
            Ok(Some(chunk)) => {
                if cancelled.load(Ordering::SeqCst) {
                    tracing::debug!(session = %session_id, "discarding chunk after cancellation");
                    return;
                }

                let terminal = matches!(chunk, Chunk::Done);
                tracing::debug!(session = %session_id, kind = chunk.kind(), "socket chunk received");
                if tx.send(TransportEvent::Chunks(vec![chunk])).await.is_err() {
                    return;
                }
                if terminal {
                    tracing::info!(session = %session_id, "socket stream completed");
                    let _ = tx.send(TransportEvent::Terminal(RunStatus::Completed)).await;
                    return;
                }
            }

            Ok(None) => {
                tracing::warn!(session = %session_id, "socket closed before terminal chunk");
                let err = SwarmError::Connectivity(
                    "connection closed before execution finished".to_string(),
                );
                let _ = tx.send(TransportEvent::Fatal(err)).await;
                return;
            }

            Err(err) => {
                tracing::error!(session = %session_id, error = %err, "socket receive failed");
                let _ = tx.send(TransportEvent::Fatal(err)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt, BufReader};

    async fn write_line(writer: &mut (impl tokio::io::AsyncWrite + Unpin), line: &str) {
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_json_lines_parses_in_order() {
        let (mut client, server) = duplex(1024);
        let mut socket = JsonLinesSocket::new(BufReader::new(server));

        write_line(&mut client, r#"{"type":"agent-start","agent":"a"}"#).await;
        write_line(&mut client, "").await;
        write_line(&mut client, "not json at all").await;
        write_line(&mut client, r#"{"type":"token","agent":"a","content":"hi"}"#).await;
        drop(client);

        assert_eq!(
            socket.next_chunk().await.unwrap(),
            Some(Chunk::agent_start("a"))
        );
        assert_eq!(socket.next_chunk().await.unwrap(), Some(Chunk::token("a", "hi")));
        assert_eq!(socket.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_lines_maps_unknown_types() {
        let (mut client, server) = duplex(1024);
        let mut socket = JsonLinesSocket::new(BufReader::new(server));

        write_line(&mut client, r#"{"type":"heartbeat"}"#).await;
        drop(client);

        assert_eq!(socket.next_chunk().await.unwrap(), Some(Chunk::Unknown));
    }

    #[tokio::test]
    async fn test_attach_forwards_until_done() {
        let (mut client, server) = duplex(1024);
        let (mut rx, _handle) = attach(
            JsonLinesSocket::new(BufReader::new(server)),
            "ses-socket",
        );

        write_line(&mut client, r#"{"type":"token","agent":"a","content":"Hel"}"#).await;
        write_line(&mut client, r#"{"type":"token","agent":"a","content":"lo"}"#).await;
        write_line(&mut client, r#"{"type":"done"}"#).await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], TransportEvent::Chunks(c) if c[0] == Chunk::token("a", "Hel")));
        assert!(matches!(&events[1], TransportEvent::Chunks(c) if c[0] == Chunk::token("a", "lo")));
        assert!(matches!(&events[2], TransportEvent::Chunks(c) if c[0] == Chunk::Done));
        assert!(matches!(events[3], TransportEvent::Terminal(RunStatus::Completed)));
    }

    #[tokio::test]
    async fn test_disconnect_before_terminal_is_fatal() {
        let (mut client, server) = duplex(1024);
        let (mut rx, _handle) = attach(
            JsonLinesSocket::new(BufReader::new(server)),
            "ses-socket",
        );

        write_line(&mut client, r#"{"type":"token","agent":"a","content":"partial"}"#).await;
        drop(client);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, TransportEvent::Chunks(_)));

        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            TransportEvent::Fatal(SwarmError::Connectivity(_))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_ends_pump_silently() {
        let (mut client, server) = duplex(1024);
        let (mut rx, handle) = attach(
            JsonLinesSocket::new(BufReader::new(server)),
            "ses-socket",
        );

        write_line(&mut client, r#"{"type":"token","agent":"a","content":"one"}"#).await;
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, TransportEvent::Chunks(_)));

        handle.cancel();
        write_line(&mut client, r#"{"type":"token","agent":"a","content":"two"}"#).await;

        // The pump discards the post-cancellation chunk and closes without
        // a terminal or fatal event.
        assert!(rx.recv().await.is_none());
        assert!(handle.is_cancelled());
    }
}
