//! HTTP implementation of the execution API
//!
//! Thin client over the backend's REST surface:
//! - `POST {base}/executions` starts an execution and returns the session id
//! - `GET  {base}/executions/{id}/chunks?cursor={n}&waitMs={ms}` long-polls
//!   for the next batch of chunks past the cursor
//! - `POST {base}/executions/{id}/stop` requests best-effort cancellation
//!
//! Responses are classified into the crate's error taxonomy here; retry
//! decisions live in the poll loop, not in this client.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, SwarmError};
use crate::retry::RetryPolicy;
use crate::transport::{ExecutionApi, PollResponse, StartRequest, StartResponse};

/// Request headroom on top of the server-side wait budget, so a healthy
/// long-poll is never cut off by the client first.
const POLL_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Timeout for the short start/stop requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Strip trailing slashes so URL formatting stays predictable
fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Map a transport-level failure (refused connection, reset, client-side
/// timeout) to the connectivity class. The overall wall-clock budget is
/// tracked by the poll loop and reported as `Timeout` there.
fn connectivity_error(err: reqwest::Error) -> SwarmError {
    SwarmError::Connectivity(err.to_string())
}

/// Classify a non-success poll/stop response
///
/// A backend that no longer knows the session answers 404 (or 410 once it
/// has expired the record); both mean the stream can never resume. 429 and
/// 5xx are transient and carry any `Retry-After` hint through to the retry
/// schedule. Everything else is a plain API error.
fn status_error(
    status: u16,
    body: String,
    retry_after_secs: Option<u64>,
    session_id: &str,
) -> SwarmError {
    match status {
        404 | 410 => SwarmError::SessionNotFound(session_id.to_string()),
        s if s == 429 || s >= 500 => SwarmError::TransientServer {
            status: s,
            body,
            retry_after_secs,
        },
        s => SwarmError::Api { status: s, body },
    }
}

/// Pull a usable `Retry-After` value off a response, if any
fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    let header = response.headers().get("retry-after")?.to_str().ok()?;
    RetryPolicy::parse_retry_after(Some(header)).map(|d| d.as_secs().max(1))
}

/// Execution API client over HTTP
#[derive(Debug, Clone)]
pub struct HttpExecutionApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpExecutionApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            client: reqwest::Client::new(),
        }
    }

    /// Use a preconfigured client (proxies, TLS settings, default headers)
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ExecutionApi for HttpExecutionApi {
    async fn start(&self, request: StartRequest) -> Result<StartResponse> {
        let url = format!("{}/executions", self.base_url);
        tracing::debug!(url = %url, "starting execution");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(connectivity_error)?;

        let status = response.status();
        let retry_after = retry_after_secs(&response);
        let body = response.text().await.map_err(connectivity_error)?;

        if status.is_success() {
            let started: StartResponse = serde_json::from_str(&body)?;
            tracing::info!(session = %started.session_id, "execution started");
            Ok(started)
        } else if status.as_u16() >= 500 {
            Err(SwarmError::TransientServer {
                status: status.as_u16(),
                body,
                retry_after_secs: retry_after,
            })
        } else {
            Err(SwarmError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn poll(&self, session_id: &str, cursor: u64, wait: Duration) -> Result<PollResponse> {
        let url = format!("{}/executions/{}/chunks", self.base_url, session_id);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("cursor", cursor.to_string()),
                ("waitMs", wait.as_millis().to_string()),
            ])
            .timeout(wait + POLL_TIMEOUT_MARGIN)
            .send()
            .await
            .map_err(connectivity_error)?;

        let status = response.status();
        if status.is_success() {
            let body = response.text().await.map_err(connectivity_error)?;
            let batch: PollResponse = serde_json::from_str(&body)?;
            Ok(batch)
        } else {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            Err(status_error(
                status.as_u16(),
                body,
                retry_after,
                session_id,
            ))
        }
    }

    async fn stop(&self, session_id: &str) -> Result<()> {
        let url = format!("{}/executions/{}/stop", self.base_url, session_id);
        tracing::debug!(session = %session_id, "requesting execution stop");

        let response = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(connectivity_error)?;

        let status = response.status();
        // A session the backend no longer knows is already stopped.
        if status.is_success() || matches!(status.as_u16(), 404 | 410) {
            Ok(())
        } else {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            Err(status_error(
                status.as_u16(),
                body,
                retry_after,
                session_id,
            ))
        }
    }
}
