//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync engine.
//! The actual HTTP client is abstracted via a trait so hosts can plug in
//! reqwest, a platform fetch bridge, or the in-process loopback below.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use enrollsync_protocol::{JobStatusResponse, SubmitRequest, SubmitResponse};
use parking_lot::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Path of the batch submission endpoint.
pub const SUBMIT_PATH: &str = "/sync/batch";

/// Path prefix of the job status endpoint.
pub const JOBS_PATH: &str = "/sync/jobs/";

/// Failure reported by an [`HttpClient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// No response was received (refused connection, DNS failure, reset).
    #[error("connection failed: {0}")]
    Connect(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// Status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with a JSON body and returns the response body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, HttpError>;

    /// Sends a GET request and returns the response body.
    async fn get(&self, url: &str) -> Result<Vec<u8>, HttpError>;
}

/// HTTP-based sync transport.
///
/// Uses JSON encoding for request/response bodies.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync API (e.g., "https://school.example.com/api").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Per-request timeout.
    timeout: Duration,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            timeout: Duration::from_secs(30),
            last_error: RwLock::new(None),
        }
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Creates a transport for the configured endpoint and request timeout.
    pub fn from_config(config: &SyncConfig, client: C) -> Self {
        Self::new(config.endpoint.clone(), client).with_timeout(config.request_timeout)
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    async fn send(
        &self,
        url: String,
        call: impl std::future::Future<Output = Result<Vec<u8>, HttpError>>,
    ) -> SyncResult<Vec<u8>> {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(body)) => {
                *self.last_error.write() = None;
                return Ok(body);
            }
            Ok(Err(HttpError::Connect(message))) => SyncError::RemoteUnreachable(message),
            Ok(Err(err @ HttpError::Status { .. })) => SyncError::Server(err.to_string()),
            Err(_) => SyncError::RemoteUnreachable(format!(
                "no response within {:?}",
                self.timeout
            )),
        };

        warn!(%url, error = %result, "sync request failed");
        *self.last_error.write() = Some(result.to_string());
        Err(result)
    }
}

#[async_trait]
impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn submit(&self, request: &SubmitRequest) -> SyncResult<SubmitResponse> {
        let body = request.encode()?;
        let url = format!("{}{}", self.base_url, SUBMIT_PATH);
        let bytes = self.send(url.clone(), self.client.post(&url, body)).await?;
        Ok(SubmitResponse::decode(&bytes)?)
    }

    async fn job_status(&self, batch_id: &str) -> SyncResult<JobStatusResponse> {
        let url = format!("{}{}{}", self.base_url, JOBS_PATH, batch_id);
        let bytes = self.send(url.clone(), self.client.get(&url)).await?;
        Ok(JobStatusResponse::decode(&bytes)?)
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the response body.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpError>;

    /// Handles a GET request and returns the response body.
    fn handle_get(&self, path: &str) -> Result<Vec<u8>, HttpError>;
}

/// A loopback HTTP client that routes requests directly to an in-process server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server behind the client.
    pub fn server(&self) -> &S {
        &self.server
    }

    fn path(url: &str) -> &str {
        url.find("/sync/").map(|i| &url[i..]).unwrap_or(url)
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, HttpError> {
        self.server.handle_post(Self::path(url), &body)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, HttpError> {
        self.server.handle_get(Self::path(url))
    }
}
