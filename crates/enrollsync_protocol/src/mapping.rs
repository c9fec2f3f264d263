//! Identifier mappings and conflicts returned by the remote system.

use serde::{Deserialize, Serialize};

/// Server-assigned identifier for an accepted batch item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMapping {
    /// Entity type of the mapped record.
    pub entity_type: String,
    /// Local identifier sent in the batch.
    pub local_id: String,
    /// Global identifier assigned by the remote system.
    pub global_id: String,
}

impl SyncMapping {
    /// Creates a new mapping.
    pub fn new(
        entity_type: impl Into<String>,
        local_id: impl Into<String>,
        global_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            local_id: local_id.into(),
            global_id: global_id.into(),
        }
    }
}

/// A batch item the remote system rejected or could not apply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Entity type of the rejected record.
    pub entity_type: String,
    /// Local identifier of the rejected record.
    pub local_id: String,
    /// Human-readable rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Conflict {
    /// Creates a conflict without a reason.
    pub fn new(entity_type: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            local_id: local_id.into(),
            reason: None,
        }
    }

    /// Attaches a rejection reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
