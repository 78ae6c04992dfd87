//! Session lifecycle controller
//!
//! `SessionController` owns one execution session end to end: it starts the
//! execution, runs a delivery strategy (polling or socket), folds incoming
//! chunks through the reducer under a write lock, and hands observers
//! immutable [`SessionSnapshot`]s over a broadcast channel.
//!
//! Lifecycle: `Idle -> Starting -> Running -> {Completed | Failed | Stopped}`.
//! Terminal states are final; events arriving after one are dropped, and
//! exactly one terminal notice is emitted per session no matter which path
//! ended it. `stop()` flips the state first and cancels transport second,
//! so a stop always wins a race against in-flight results.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{Result, SwarmError};
use crate::reducer::{ExecutionState, SideEffect};
use crate::snapshot::{SessionSnapshot, SessionStatus, TerminalNotice, TerminalReason};
use crate::transport::poll::{self, PollConfig, PollHandle};
use crate::transport::socket::{self, ChunkSocket, SocketHandle};
use crate::transport::{ExecutionApi, RunStatus, StartRequest, TransportEvent};

fn default_event_capacity() -> usize {
    64
}

/// Tunables for one controller instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Polling adapter tunables
    #[serde(default)]
    pub poll: PollConfig,

    /// Broadcast capacity for snapshot and operations subscribers
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Map a backend run status onto the session lifecycle
///
/// Terminal statuses arrive as [`TransportEvent::Terminal`], never here;
/// unrecognized ones carry no transition.
fn session_status_for(status: RunStatus) -> Option<SessionStatus> {
    match status {
        RunStatus::Pending => Some(SessionStatus::Pending),
        RunStatus::Running => Some(SessionStatus::Running),
        RunStatus::Waiting => Some(SessionStatus::WaitingForClarification),
        RunStatus::Completed | RunStatus::Failed | RunStatus::Unknown => None,
    }
}

/// Lock-guarded session state
struct SessionInner {
    session_id: Option<String>,
    status: SessionStatus,
    state: ExecutionState,
    chunks_consumed: u64,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    terminal: Option<TerminalNotice>,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            session_id: None,
            status: SessionStatus::Idle,
            state: ExecutionState::new(),
            chunks_consumed: 0,
            started_at: None,
            ended_at: None,
            terminal: None,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            status: self.status,
            agents: self.state.ledger.records(),
            transcript: self.state.transcript.entries().to_vec(),
            chunks_consumed: self.chunks_consumed,
            started_at: self.started_at,
            ended_at: self.ended_at,
            terminal: self.terminal.clone(),
        }
    }

    /// First terminal writer wins; later attempts change nothing
    fn finalize(&mut self, status: SessionStatus, notice: TerminalNotice) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.terminal = Some(notice);
        self.ended_at = Some(Utc::now());
        true
    }
}

/// Background tasks serving the current session
#[derive(Default)]
struct StreamTasks {
    poll: Option<PollHandle>,
    socket: Option<SocketHandle>,
    consumer: Option<JoinHandle<()>>,
}

/// Controller for a single execution session
///
/// One controller serves one session; starting twice is rejected rather
/// than tearing the first stream down implicitly.
pub struct SessionController {
    api: Arc<dyn ExecutionApi>,
    config: SessionConfig,
    inner: Arc<RwLock<SessionInner>>,
    snapshot_tx: broadcast::Sender<SessionSnapshot>,
    operations_tx: broadcast::Sender<serde_json::Value>,
    tasks: Mutex<StreamTasks>,
}

impl SessionController {
    pub fn new(api: Arc<dyn ExecutionApi>) -> Self {
        Self::with_config(api, SessionConfig::default())
    }

    pub fn with_config(api: Arc<dyn ExecutionApi>, config: SessionConfig) -> Self {
        let (snapshot_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (operations_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            api,
            config,
            inner: Arc::new(RwLock::new(SessionInner::new())),
            snapshot_tx,
            operations_tx,
            tasks: Mutex::new(StreamTasks::default()),
        }
    }

    /// Subscribe to state snapshots
    ///
    /// A fresh snapshot is broadcast after every applied batch and every
    /// status transition. Slow subscribers may observe lag and should
    /// treat each snapshot as a full replacement, not a delta.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Subscribe to operations payloads destined for an external surface
    pub fn subscribe_operations(&self) -> broadcast::Receiver<serde_json::Value> {
        self.operations_tx.subscribe()
    }

    /// Current state as an immutable snapshot
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().await.snapshot()
    }

    pub async fn status(&self) -> SessionStatus {
        self.inner.read().await.status
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.read().await.session_id.clone()
    }

    /// Start an execution for the given task and begin polling for chunks
    ///
    /// Returns the backend session id. Fails without any state change if
    /// the task is blank or the controller has already been started; fails
    /// with a single `Failed` terminal notice if the backend rejects the
    /// start request.
    pub async fn start(&self, task: impl Into<String>) -> Result<String> {
        self.start_with(StartRequest::new(task, serde_json::Value::Null))
            .await
    }

    /// Start an execution from a full request (task plus swarm config)
    pub async fn start_with(&self, request: StartRequest) -> Result<String> {
        if request.task.trim().is_empty() {
            return Err(SwarmError::InvalidRequest(
                "task must not be empty".to_string(),
            ));
        }

        {
            let mut guard = self.inner.write().await;
            if guard.status != SessionStatus::Idle {
                return Err(SwarmError::InvalidRequest(format!(
                    "session already started (status {:?})",
                    guard.status
                )));
            }
            guard.status = SessionStatus::Starting;
            guard.started_at = Some(Utc::now());
        }
        self.broadcast_snapshot().await;

        let started = match self.api.start(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, "failed to start execution");
                {
                    let mut guard = self.inner.write().await;
                    let notice = TerminalNotice::from_error(&err);
                    guard
                        .state
                        .transcript
                        .push_notice("system", notice.message.clone());
                    guard.finalize(SessionStatus::Failed, notice);
                }
                self.broadcast_snapshot().await;
                return Err(err);
            }
        };

        let session_id = started.session_id;
        {
            let mut guard = self.inner.write().await;
            if guard.status.is_terminal() {
                // stop() won the race while the start request was in flight
                tracing::info!(session = %session_id, "session stopped during start");
                self.spawn_backend_stop(session_id.clone());
                return Err(SwarmError::Cancelled);
            }
            guard.session_id = Some(session_id.clone());
            guard.status = SessionStatus::Running;
        }
        self.broadcast_snapshot().await;

        let (events, handle) = poll::start_polling(
            self.api.clone(),
            session_id.clone(),
            self.config.poll.clone(),
        );
        let consumer = self.spawn_consumer(events);
        {
            let mut tasks = self.tasks.lock().await;
            tasks.poll = Some(handle);
            tasks.consumer = Some(consumer);
        }
        // stop() may have landed between the status flip and the handle
        // registration above; it found nothing to cancel, so cancel now.
        if self.inner.read().await.status.is_terminal() {
            self.halt_transport().await;
        }

        tracing::info!(session = %session_id, "session running");
        Ok(session_id)
    }

    /// Drive this controller from an already-open socket instead of polling
    ///
    /// The socket must be attached before the backend is asked to produce
    /// chunks for the session, otherwise early chunks are lost for good.
    pub async fn attach_socket<S>(&self, session_id: impl Into<String>, socket: S) -> Result<()>
    where
        S: ChunkSocket + 'static,
    {
        let session_id = session_id.into();
        {
            let mut guard = self.inner.write().await;
            if guard.status != SessionStatus::Idle {
                return Err(SwarmError::InvalidRequest(format!(
                    "session already started (status {:?})",
                    guard.status
                )));
            }
            guard.session_id = Some(session_id.clone());
            guard.status = SessionStatus::Running;
            guard.started_at = Some(Utc::now());
        }
        self.broadcast_snapshot().await;

        let (events, handle) = socket::attach(socket, session_id.clone());
        let consumer = self.spawn_consumer(events);
        {
            let mut tasks = self.tasks.lock().await;
            tasks.socket = Some(handle);
            tasks.consumer = Some(consumer);
        }
        if self.inner.read().await.status.is_terminal() {
            self.halt_transport().await;
        }

        tracing::info!(session = %session_id, "socket attached");
        Ok(())
    }

    /// Stop the session
    ///
    /// Local teardown is unconditional and idempotent: the session flips to
    /// `Stopped` under the lock before transport is cancelled, so results
    /// of any in-flight poll are discarded. The backend stop request is
    /// fire-and-forget; an unreachable backend cannot block the stop. On a
    /// session that never started this is a no-op.
    pub async fn stop(&self) {
        let (emitted, session_id, snapshot) = {
            let mut guard = self.inner.write().await;
            if guard.status == SessionStatus::Idle {
                tracing::debug!("stop on idle session, nothing to do");
                return;
            }
            let emitted = guard.finalize(SessionStatus::Stopped, TerminalNotice::cancelled());
            (emitted, guard.session_id.clone(), guard.snapshot())
        };

        self.halt_transport().await;

        if emitted {
            let _ = self.snapshot_tx.send(snapshot);
            if let Some(id) = session_id {
                self.spawn_backend_stop(id);
            }
            tracing::info!("session stopped by user");
        }
    }

    /// Release the controller's background work; safe to call repeatedly
    pub async fn dispose(&self) {
        self.stop().await;
        let mut tasks = self.tasks.lock().await;
        if let Some(consumer) = tasks.consumer.take() {
            consumer.abort();
        }
    }

    async fn broadcast_snapshot(&self) {
        let snapshot = self.inner.read().await.snapshot();
        let _ = self.snapshot_tx.send(snapshot);
    }

    async fn halt_transport(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.poll.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.socket.take() {
            handle.abort();
        }
        // The consumer drains on its own once the senders are gone.
    }

    fn spawn_backend_stop(&self, session_id: String) {
        let api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = api.stop(&session_id).await {
                tracing::warn!(session = %session_id, error = %e, "backend stop request failed");
            }
        });
    }

    fn spawn_consumer(&self, events: mpsc::Receiver<TransportEvent>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let snapshot_tx = self.snapshot_tx.clone();
        let operations_tx = self.operations_tx.clone();
        let api = self.api.clone();
        tokio::spawn(async move {
            consume_events(inner, snapshot_tx, operations_tx, api, events).await;
        })
    }
}

/// Apply transport events to session state until the stream or session ends
async fn consume_events(
    inner: Arc<RwLock<SessionInner>>,
    snapshot_tx: broadcast::Sender<SessionSnapshot>,
    operations_tx: broadcast::Sender<serde_json::Value>,
    api: Arc<dyn ExecutionApi>,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let mut operations = Vec::new();
        let mut stop_backend = false;

        let snapshot = {
            let mut guard = inner.write().await;
            if guard.status.is_terminal() {
                tracing::debug!("dropping transport event after terminal state");
                return;
            }

            match event {
                TransportEvent::Chunks(chunks) => {
                    guard.chunks_consumed += chunks.len() as u64;
                    for effect in guard.state.apply_batch(&chunks) {
                        match effect {
                            SideEffect::SessionCompleted => {
                                guard.finalize(
                                    SessionStatus::Completed,
                                    TerminalNotice::completed(),
                                );
                            }
                            SideEffect::SessionFailed(message) => {
                                let notice = TerminalNotice {
                                    reason: TerminalReason::Failed,
                                    message,
                                };
                                if guard.finalize(SessionStatus::Failed, notice) {
                                    stop_backend = true;
                                }
                            }
                            SideEffect::OperationsReceived(payload) => {
                                operations.push(payload);
                            }
                        }
                    }
                }

                TransportEvent::StatusChanged(run_status) => {
                    if let Some(status) = session_status_for(run_status) {
                        if guard.status != status {
                            tracing::info!(status = ?status, "session status changed");
                            guard.status = status;
                        }
                    }
                }

                TransportEvent::Terminal(run_status) => {
                    if run_status == RunStatus::Completed {
                        guard.finalize(SessionStatus::Completed, TerminalNotice::completed());
                    } else {
                        let notice = TerminalNotice {
                            reason: TerminalReason::Failed,
                            message: "Execution failed".to_string(),
                        };
                        guard.finalize(SessionStatus::Failed, notice);
                    }
                }

                TransportEvent::Fatal(err) => {
                    tracing::error!(error = %err, "transport failed, ending session");
                    let notice = TerminalNotice::from_error(&err);
                    guard
                        .state
                        .transcript
                        .push_notice("system", notice.message.clone());
                    guard.finalize(SessionStatus::Failed, notice);
                }
            }

            guard.snapshot()
        };

        for payload in operations {
            let _ = operations_tx.send(payload);
        }

        let terminal = snapshot.status.is_terminal();
        let session_id = snapshot.session_id.clone();
        let _ = snapshot_tx.send(snapshot);

        // An in-band session error means the backend may still be
        // producing; ask it to stop, best-effort.
        if stop_backend {
            if let Some(id) = session_id {
                let api = api.clone();
                tokio::spawn(async move {
                    if let Err(e) = api.stop(&id).await {
                        tracing::warn!(session = %id, error = %e, "backend stop request failed");
                    }
                });
            }
        }

        if terminal {
            return;
        }
    }
}
