//! Batch submission and deferred-job polling.

use crate::config::PollConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use enrollsync_protocol::{
    BatchItem, Conflict, JobState, SubmitRequest, SubmitResponse, SyncJobTicket, SyncMapping,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the remote system made of a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitOutcome {
    /// Identifier mappings for accepted items.
    pub mappings: Vec<SyncMapping>,
    /// Rejected items.
    pub conflicts: Vec<Conflict>,
    /// Job identifier when the remote deferred processing.
    pub batch_id: Option<String>,
    /// Error reported by a failed deferred job.
    pub job_error: Option<String>,
}

/// Submits batches and waits for deferred jobs.
///
/// Attaches the device identifier and the last-sync watermark to every
/// submission. Never touches the local store.
pub struct BatchSubmitter<T: SyncTransport> {
    transport: Arc<T>,
    device_id: String,
    poll: PollConfig,
}

impl<T: SyncTransport> BatchSubmitter<T> {
    /// Creates a submitter.
    pub fn new(transport: Arc<T>, device_id: impl Into<String>, poll: PollConfig) -> Self {
        Self {
            transport,
            device_id: device_id.into(),
            poll,
        }
    }

    /// Returns the device identifier sent with each batch.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Submits a batch and returns the remote verdict.
    ///
    /// A deferred job is polled until it completes, fails, or the polling
    /// budget runs out ([`SyncError::Timeout`]).
    pub async fn submit(
        &self,
        batch: Vec<BatchItem>,
        last_sync: Option<DateTime<Utc>>,
    ) -> SyncResult<SubmitOutcome> {
        let items = batch.len();
        let request = SubmitRequest::new(batch, self.device_id.clone(), last_sync);

        match self.transport.submit(&request).await? {
            SubmitResponse::Completed(reply) => {
                if !reply.success && reply.mappings.is_empty() && reply.conflicts.is_empty() {
                    return Err(SyncError::Server(
                        reply
                            .error
                            .unwrap_or_else(|| "batch rejected".to_string()),
                    ));
                }
                debug!(
                    items,
                    mappings = reply.mappings.len(),
                    conflicts = reply.conflicts.len(),
                    "batch processed synchronously"
                );
                Ok(SubmitOutcome {
                    mappings: reply.mappings,
                    conflicts: reply.conflicts,
                    batch_id: None,
                    job_error: reply.error,
                })
            }
            SubmitResponse::Deferred(ticket) => {
                info!(items, batch_id = %ticket.batch_id, "batch deferred, polling");
                self.wait_for(ticket).await
            }
        }
    }

    async fn wait_for(&self, ticket: SyncJobTicket) -> SyncResult<SubmitOutcome> {
        for attempt in 1..=self.poll.max_attempts {
            tokio::time::sleep(self.poll.interval).await;

            let status = self.transport.job_status(&ticket.batch_id).await?;
            match status.status {
                JobState::Processing => {
                    debug!(batch_id = %ticket.batch_id, attempt, "job still processing");
                }
                JobState::Completed => {
                    return Ok(SubmitOutcome {
                        mappings: status.mappings,
                        conflicts: status.conflicts,
                        batch_id: Some(ticket.batch_id),
                        job_error: None,
                    });
                }
                JobState::Failed => {
                    warn!(
                        batch_id = %ticket.batch_id,
                        error = status.error.as_deref().unwrap_or("unknown"),
                        conflicts = status.conflicts.len(),
                        "deferred job failed"
                    );
                    return Ok(SubmitOutcome {
                        mappings: Vec::new(),
                        conflicts: status.conflicts,
                        batch_id: Some(ticket.batch_id),
                        job_error: status.error,
                    });
                }
            }
        }

        Err(SyncError::Timeout {
            batch_id: ticket.batch_id,
            attempts: self.poll.max_attempts,
        })
    }
}
