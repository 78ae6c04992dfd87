//! Long-poll delivery loop
//!
//! One loop per session drives sequential, never-overlapping polls against
//! an [`ExecutionApi`]. The cursor is owned here and nowhere else: it
//! advances by the number of chunks received (or to a greater server hint)
//! and is the sole de-duplication mechanism, so a poll answered twice or a
//! batch replayed by the server cannot double-apply.
//!
//! Failure policy:
//! - session-not-found is fatal immediately, no retry
//! - transient server and connectivity failures retry with cooldown until
//!   the consecutive-failure ceiling is spent; a success resets the count
//! - the overall wall-clock budget is always fatal when exceeded
//!
//! Cancellation is cooperative: the flag is checked before each iteration
//! and again the moment a poll response arrives, so results from a poll
//! that was in flight when the user stopped are discarded wholesale. A
//! cancelled loop ends its event stream silently; every other exit path
//! emits exactly one `Terminal` or `Fatal` event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SwarmError;
use crate::retry::RetryPolicy;
use crate::transport::{ExecutionApi, RunStatus, TransportEvent};

/// Tuning for the polling strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// How long the server may hold one poll before answering, milliseconds
    #[serde(default = "default_wait_budget_ms")]
    pub wait_budget_ms: u64,

    /// Wall-clock ceiling for the whole session, milliseconds
    #[serde(default = "default_overall_budget_ms")]
    pub overall_budget_ms: u64,

    /// Cooldown policy for transient failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Capacity of the event channel to the controller
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_wait_budget_ms() -> u64 {
    25_000
}

fn default_overall_budget_ms() -> u64 {
    300_000
}

fn default_channel_capacity() -> usize {
    100
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            wait_budget_ms: default_wait_budget_ms(),
            overall_budget_ms: default_overall_budget_ms(),
            retry: RetryPolicy::default(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl PollConfig {
    pub fn wait_budget(&self) -> Duration {
        Duration::from_millis(self.wait_budget_ms)
    }

    pub fn overall_budget(&self) -> Duration {
        Duration::from_millis(self.overall_budget_ms)
    }
}

/// Handle to a running poll loop
#[derive(Debug)]
pub struct PollHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Ask the loop to stop at its next safe point
    ///
    /// Safe points are the top of each iteration and the arrival of an
    /// in-flight poll response; results arriving after cancellation are
    /// discarded. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Tear the loop down without waiting for the next safe point
    pub fn abort(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the polling loop for `session_id`
///
/// Returns the event stream for the controller and the handle used to
/// cancel or tear down the loop. Dropping the receiver also ends the loop
/// at its next send.
pub fn start_polling(
    api: Arc<dyn ExecutionApi>,
    session_id: impl Into<String>,
    config: PollConfig,
) -> (mpsc::Receiver<TransportEvent>, PollHandle) {
    let session_id = session_id.into();
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();

    let task = tokio::spawn(async move {
        run_poll_loop(api, session_id, config, flag, tx).await;
    });

    (rx, PollHandle { cancelled, task })
}

async fn run_poll_loop(
    api: Arc<dyn ExecutionApi>,
    session_id: String,
    config: PollConfig,
    cancelled: Arc<AtomicBool>,
    tx: mpsc::Sender<TransportEvent>,
) {
    let started = tokio::time::Instant::now();
    let wait = config.wait_budget();
    let overall = config.overall_budget();
    let mut cursor: u64 = 0;
    let mut failures: u32 = 0;
    let mut last_status = RunStatus::Running;

    loop {
        if cancelled.load(Ordering::SeqCst) {
            tracing::debug!(session = %session_id, "poll loop cancelled");
            return;
        }
        if tx.is_closed() {
            tracing::debug!(session = %session_id, "event receiver dropped, ending poll loop");
            return;
        }

        let remaining = overall.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            let err = SwarmError::Timeout {
                waited_secs: overall.as_secs(),
            };
            tracing::warn!(session = %session_id, "overall poll budget exhausted");
            let _ = tx.send(TransportEvent::Fatal(err)).await;
            return;
        }

        let outcome = tokio::time::timeout(remaining, api.poll(&session_id, cursor, wait)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                let err = SwarmError::Timeout {
                    waited_secs: overall.as_secs(),
                };
                tracing::warn!(session = %session_id, "poll still pending at budget expiry");
                let _ = tx.send(TransportEvent::Fatal(err)).await;
                return;
            }
        };

        match result {
            Ok(response) => {
                // Stop may have been requested while this poll was in
                // flight; its results are discarded wholesale.
                if cancelled.load(Ordering::SeqCst) {
                    tracing::debug!(
                        session = %session_id,
                        discarded = response.chunks.len(),
                        "discarding poll results after cancellation"
                    );
                    return;
                }

                failures = 0;
                let received = response.chunks.len() as u64;
                cursor += received;
                if let Some(hint) = response.next_cursor_hint {
                    if hint > cursor {
                        tracing::debug!(session = %session_id, cursor, hint, "following cursor hint");
                        cursor = hint;
                    }
                }

                if received > 0 {
                    tracing::debug!(session = %session_id, count = received, cursor, "chunk batch received");
                    if tx.send(TransportEvent::Chunks(response.chunks)).await.is_err() {
                        return;
                    }
                }

                if response.status.is_terminal() {
                    tracing::info!(session = %session_id, status = ?response.status, "server reported terminal status");
                    let _ = tx.send(TransportEvent::Terminal(response.status)).await;
                    return;
                }

                if response.status != last_status && response.status != RunStatus::Unknown {
                    last_status = response.status;
                    if tx
                        .send(TransportEvent::StatusChanged(response.status))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }

            Err(err) if err.is_retryable() && failures < config.retry.max_retries => {
                let cooldown = err
                    .retry_after_secs()
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| config.retry.cooldown_for_attempt(failures));
                failures += 1;
                tracing::warn!(
                    session = %session_id,
                    error = %err,
                    attempt = failures,
                    max_retries = config.retry.max_retries,
                    "poll failed, retrying in {:?}",
                    cooldown
                );
                tokio::time::sleep(cooldown).await;
            }

            Err(err) => {
                if err.is_retryable() {
                    // The ceiling is spent; the last failure class decides
                    // the user-facing reason.
                    tracing::error!(
                        session = %session_id,
                        error = %err,
                        attempts = failures + 1,
                        "poll retries exhausted"
                    );
                } else {
                    tracing::error!(session = %session_id, error = %err, "fatal poll failure");
                }
                let _ = tx.send(TransportEvent::Fatal(err)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::transport::{MockExecutionApi, PollResponse};

    fn fast_config() -> PollConfig {
        PollConfig {
            wait_budget_ms: 20,
            overall_budget_ms: 5_000,
            retry: RetryPolicy {
                max_retries: 3,
                base_cooldown_ms: 10,
                max_cooldown_ms: 50,
            },
            channel_capacity: 16,
        }
    }

    fn transient(status: u16) -> SwarmError {
        SwarmError::TransientServer {
            status,
            body: "flaky".to_string(),
            retry_after_secs: None,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_delivers_batches_then_terminal() {
        let api = Arc::new(MockExecutionApi::new());
        api.push_chunks(vec![Chunk::token("a", "Hel"), Chunk::token("a", "lo")]);
        api.push_response(PollResponse::completed(vec![Chunk::Done]));

        let (rx, _handle) = start_polling(api.clone(), "ses-1", fast_config());
        let events = collect(rx).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], TransportEvent::Chunks(c) if c.len() == 2));
        assert!(matches!(&events[1], TransportEvent::Chunks(c) if c.len() == 1));
        assert!(matches!(events[2], TransportEvent::Terminal(RunStatus::Completed)));

        // Cursor advanced by chunks received, monotonic
        assert_eq!(api.polled_cursors(), vec![0, 2]);
    }

    #[tokio::test]
    async fn test_cursor_hint_applied_forward_only() {
        let api = Arc::new(MockExecutionApi::new());
        api.push_response(
            PollResponse::running(vec![Chunk::token("a", "x")]).with_cursor_hint(10),
        );
        // A hint behind the local cursor must be ignored
        api.push_response(PollResponse::running(vec![Chunk::token("a", "y")]).with_cursor_hint(3));
        api.push_response(PollResponse::completed(Vec::new()));

        let (rx, _handle) = start_polling(api.clone(), "ses-1", fast_config());
        let _ = collect(rx).await;

        assert_eq!(api.polled_cursors(), vec![0, 10, 11]);
    }

    #[tokio::test]
    async fn test_session_not_found_is_fatal_without_retry() {
        let api = Arc::new(MockExecutionApi::new());
        api.push_failure(SwarmError::SessionNotFound("ses-1".to_string()));

        let (rx, _handle) = start_polling(api.clone(), "ses-1", fast_config());
        let events = collect(rx).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            TransportEvent::Fatal(SwarmError::SessionNotFound(_))
        ));
        assert_eq!(api.poll_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling_spends_exactly_ceiling_plus_one_attempts() {
        let api = Arc::new(MockExecutionApi::new());
        for _ in 0..4 {
            api.push_failure(transient(503));
        }

        let mut config = fast_config();
        config.retry.max_retries = 3;

        let (rx, _handle) = start_polling(api.clone(), "ses-1", config);
        let events = collect(rx).await;

        assert_eq!(api.poll_count(), 4);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            TransportEvent::Fatal(SwarmError::TransientServer { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_failure_class() {
        let api = Arc::new(MockExecutionApi::new());
        api.push_failure(transient(500));
        api.push_failure(SwarmError::Connectivity("connection refused".to_string()));
        api.push_failure(SwarmError::Connectivity("connection refused".to_string()));

        let mut config = fast_config();
        config.retry.max_retries = 2;

        let (rx, _handle) = start_polling(api.clone(), "ses-1", config);
        let events = collect(rx).await;

        assert_eq!(api.poll_count(), 3);
        assert!(matches!(
            &events[0],
            TransportEvent::Fatal(SwarmError::Connectivity(_))
        ));
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let api = Arc::new(MockExecutionApi::new());
        api.push_failure(transient(500));
        api.push_failure(transient(500));
        api.push_failure(transient(500));
        api.push_chunks(vec![Chunk::token("a", "recovered")]);
        api.push_failure(transient(500));
        api.push_response(PollResponse::completed(vec![Chunk::Done]));

        let (rx, _handle) = start_polling(api.clone(), "ses-1", fast_config());
        let events = collect(rx).await;

        // Three failures, success, one more failure (counter restarted),
        // then clean completion; never fatal.
        assert_eq!(api.poll_count(), 6);
        assert!(matches!(&events[0], TransportEvent::Chunks(_)));
        assert!(events
            .iter()
            .all(|e| !matches!(e, TransportEvent::Fatal(_))));
        assert!(matches!(
            events.last().unwrap(),
            TransportEvent::Terminal(RunStatus::Completed)
        ));
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_results() {
        let api = Arc::new(
            MockExecutionApi::new().with_poll_delay(Duration::from_millis(60)),
        );
        api.push_chunks(vec![Chunk::token("a", "late")]);

        let (rx, handle) = start_polling(api.clone(), "ses-1", fast_config());
        tokio::time::sleep(Duration::from_millis(15)).await;
        handle.cancel();

        let events = collect(rx).await;
        assert!(events.is_empty());
        assert_eq!(api.poll_count(), 1);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_status_change_events() {
        let api = Arc::new(MockExecutionApi::new());
        api.push_response(PollResponse::running(Vec::new()).with_status(RunStatus::Waiting));
        api.push_response(PollResponse::completed(Vec::new()));

        let (rx, _handle) = start_polling(api.clone(), "ses-1", fast_config());
        let events = collect(rx).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            TransportEvent::StatusChanged(RunStatus::Waiting)
        ));
        assert!(matches!(events[1], TransportEvent::Terminal(RunStatus::Completed)));
    }

    #[tokio::test]
    async fn test_overall_budget_expires() {
        let api = Arc::new(MockExecutionApi::new());
        // Empty script: the mock idles for the wait budget on every poll

        let config = PollConfig {
            wait_budget_ms: 30,
            overall_budget_ms: 70,
            retry: RetryPolicy::disabled(),
            channel_capacity: 16,
        };

        let (rx, _handle) = start_polling(api.clone(), "ses-1", config);
        let events = collect(rx).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            TransportEvent::Fatal(SwarmError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_abort_tears_down_promptly() {
        let api = Arc::new(MockExecutionApi::new());

        let (rx, handle) = start_polling(api.clone(), "ses-1", fast_config());
        drop(rx);
        handle.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_retry_after_header_overrides_cooldown() {
        let api = Arc::new(MockExecutionApi::new());
        api.push_failure(SwarmError::TransientServer {
            status: 429,
            body: "rate limited".to_string(),
            retry_after_secs: Some(1),
        });
        api.push_response(PollResponse::completed(Vec::new()));

        let mut config = fast_config();
        config.retry.base_cooldown_ms = 1; // would retry near-instantly

        let started = tokio::time::Instant::now();
        let (rx, _handle) = start_polling(api.clone(), "ses-1", config);
        let _ = collect(rx).await;

        // The server-requested 1s cooldown wins over the 1ms policy
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(api.poll_count(), 2);
    }

    #[test]
    fn test_poll_config_defaults() {
        let config = PollConfig::default();
        assert_eq!(config.wait_budget(), Duration::from_secs(25));
        assert_eq!(config.overall_budget(), Duration::from_secs(300));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.channel_capacity, 100);
    }

    #[test]
    fn test_poll_config_deserialize_partial() {
        let config: PollConfig =
            serde_json::from_str(r#"{"wait_budget_ms": 10000}"#).unwrap();
        assert_eq!(config.wait_budget_ms, 10_000);
        assert_eq!(config.overall_budget_ms, 300_000);
        assert_eq!(config.retry.max_retries, 3);
    }
}
