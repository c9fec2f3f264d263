//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use enrollsync_protocol::{JobStatusResponse, SubmitRequest, SubmitResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A sync transport handles network communication with the remote system.
///
/// This trait abstracts the network layer, allowing for different implementations
/// (HTTP, in-process loopback, mock for testing, etc.). Implementations report
/// network-level failures as [`SyncError::RemoteUnreachable`].
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Submits a batch.
    async fn submit(&self, request: &SubmitRequest) -> SyncResult<SubmitResponse>;

    /// Fetches the status of a deferred job.
    async fn job_status(&self, batch_id: &str) -> SyncResult<JobStatusResponse>;
}

/// A mock transport for testing.
///
/// Responses are scripted in order; every request is recorded.
#[derive(Debug)]
pub struct MockTransport {
    reachable: AtomicBool,
    submit_responses: Mutex<VecDeque<SubmitResponse>>,
    status_responses: Mutex<VecDeque<JobStatusResponse>>,
    submitted: Mutex<Vec<SubmitRequest>>,
    polled: Mutex<Vec<String>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            submit_responses: Mutex::new(VecDeque::new()),
            status_responses: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            polled: Mutex::new(Vec::new()),
        }
    }

    /// Queues a submission response.
    pub fn push_submit_response(&self, response: SubmitResponse) {
        self.submit_responses.lock().push_back(response);
    }

    /// Queues a job-status response.
    pub fn push_status_response(&self, response: JobStatusResponse) {
        self.status_responses.lock().push_back(response);
    }

    /// Simulates losing or regaining the network.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Requests submitted so far.
    pub fn submitted(&self) -> Vec<SubmitRequest> {
        self.submitted.lock().clone()
    }

    /// Job identifiers polled so far, one entry per poll.
    pub fn polled(&self) -> Vec<String> {
        self.polled.lock().clone()
    }

    fn ensure_reachable(&self) -> SyncResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::RemoteUnreachable("connection refused".into()))
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn submit(&self, request: &SubmitRequest) -> SyncResult<SubmitResponse> {
        self.ensure_reachable()?;
        self.submitted.lock().push(request.clone());
        self.submit_responses
            .lock()
            .pop_front()
            .ok_or_else(|| SyncError::Server("no mock submit response set".into()))
    }

    async fn job_status(&self, batch_id: &str) -> SyncResult<JobStatusResponse> {
        self.ensure_reachable()?;
        self.polled.lock().push(batch_id.to_string());
        self.status_responses
            .lock()
            .pop_front()
            .ok_or_else(|| SyncError::Server("no mock job status set".into()))
    }
}
