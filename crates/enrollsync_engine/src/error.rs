//! Error types for the sync engine.

use crate::schema::SchemaError;
use crate::store::StoreError;
use enrollsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote system could not be reached at the network level.
    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    /// The remote system answered but refused or failed the request.
    #[error("server error: {0}")]
    Server(String),

    /// A message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The local store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The entity schema is invalid.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// A deferred job did not finish within the polling budget.
    #[error("job {batch_id} still processing after {attempts} polls")]
    Timeout {
        /// Job being polled.
        batch_id: String,
        /// Number of polls made.
        attempts: u32,
    },
}

impl SyncError {
    /// Returns true for failures that should not alarm the user.
    ///
    /// Unreachable remotes and polling timeouts are expected while offline or
    /// under load; they still count towards backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteUnreachable(_) | SyncError::Timeout { .. }
        )
    }

    /// Returns true if a later cycle may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RemoteUnreachable(_) | SyncError::Timeout { .. } => true,
            SyncError::Server(_) => true,
            SyncError::Store(StoreError::Unavailable(_)) => true,
            SyncError::Protocol(_) | SyncError::Store(_) | SyncError::Schema(_) => false,
        }
    }
}
