//! Submission and job-status messages.

use crate::error::{decode, encode, ProtocolResult};
use crate::item::BatchItem;
use crate::mapping::{Conflict, SyncMapping};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Batch submission from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Pending changes in dependency order.
    pub batch: Vec<BatchItem>,
    /// Stable identifier of the submitting device.
    pub device_id: String,
    /// Watermark of the device's last successful sync.
    pub last_sync: Option<DateTime<Utc>>,
}

impl SubmitRequest {
    /// Creates a new submission.
    pub fn new(
        batch: Vec<BatchItem>,
        device_id: impl Into<String>,
        last_sync: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            batch,
            device_id: device_id.into(),
            last_sync,
        }
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode("submit request", self)
    }

    /// Decodes from JSON.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode("submit request", bytes)
    }
}

/// Synchronous result of a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReply {
    /// Whether the remote system accepted the batch.
    pub success: bool,
    /// Identifier mappings for accepted items.
    #[serde(default)]
    pub mappings: Vec<SyncMapping>,
    /// Items the remote system rejected.
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    /// Error message when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubmitReply {
    /// Creates a successful reply.
    pub fn success(mappings: Vec<SyncMapping>, conflicts: Vec<Conflict>) -> Self {
        Self {
            success: true,
            mappings,
            conflicts,
            error: None,
        }
    }

    /// Creates a rejection of the whole batch.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            mappings: Vec::new(),
            conflicts: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// Processing state of a deferred job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// The remote system is still working on the batch.
    #[default]
    Processing,
    /// The batch was applied.
    Completed,
    /// The batch could not be applied.
    Failed,
}

/// Handle for a batch the remote system deferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJobTicket {
    /// Identifier to poll.
    pub batch_id: String,
    /// State reported with the ticket.
    #[serde(default)]
    pub status: JobState,
}

impl SyncJobTicket {
    /// Creates a ticket for a job that is still processing.
    pub fn processing(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            status: JobState::Processing,
        }
    }
}

/// Response to a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmitResponse {
    /// The batch was queued; poll the ticket.
    Deferred(SyncJobTicket),
    /// The batch was processed inline.
    Completed(SubmitReply),
}

impl SubmitResponse {
    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode("submit response", self)
    }

    /// Decodes from JSON.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode("submit response", bytes)
    }
}

/// Response from the job-status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    /// Current job state.
    pub status: JobState,
    /// Mappings, present once completed.
    #[serde(default)]
    pub mappings: Vec<SyncMapping>,
    /// Conflicts, present once completed or failed.
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatusResponse {
    /// Creates a still-processing status.
    pub fn processing() -> Self {
        Self {
            status: JobState::Processing,
            mappings: Vec::new(),
            conflicts: Vec::new(),
            error: None,
        }
    }

    /// Creates a completed status.
    pub fn completed(mappings: Vec<SyncMapping>, conflicts: Vec<Conflict>) -> Self {
        Self {
            status: JobState::Completed,
            mappings,
            conflicts,
            error: None,
        }
    }

    /// Creates a failed status.
    pub fn failed(error: impl Into<String>, conflicts: Vec<Conflict>) -> Self {
        Self {
            status: JobState::Failed,
            mappings: Vec::new(),
            conflicts,
            error: Some(error.into()),
        }
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode("job status", self)
    }

    /// Decodes from JSON.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode("job status", bytes)
    }
}
