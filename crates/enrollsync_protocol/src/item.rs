//! Batch items sent to the remote system.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys that describe sync bookkeeping rather than entity data.
///
/// These never appear in a [`BatchItem`] payload.
pub const BOOKKEEPING_FIELDS: [&str; 4] = ["localId", "globalId", "syncStatus", "syncedAt"];

/// What the remote system should do with a batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// The record has never been persisted remotely.
    Create,
    /// The record already carries a global identifier.
    Update,
    /// The record was explicitly deleted after being persisted remotely.
    Delete,
}

impl Operation {
    /// Infers the operation for a record.
    ///
    /// Returns `None` for a deleted record that never received a global
    /// identifier: the remote system has nothing to delete.
    pub fn infer(has_global_id: bool, deleted: bool) -> Option<Self> {
        match (has_global_id, deleted) {
            (false, false) => Some(Operation::Create),
            (true, false) => Some(Operation::Update),
            (true, true) => Some(Operation::Delete),
            (false, true) => None,
        }
    }

    /// Returns the wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// A single pending change in a sync batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    /// Entity type (collection name) of the record.
    pub entity_type: String,
    /// Operation the remote system should perform.
    pub operation: Operation,
    /// Local identifier of the record.
    pub local_id: String,
    /// Entity fields with bookkeeping keys removed.
    ///
    /// Foreign-key fields still hold local identifiers.
    pub payload: Map<String, Value>,
}

impl BatchItem {
    /// Creates a batch item, stripping bookkeeping keys from the payload.
    pub fn new(
        entity_type: impl Into<String>,
        operation: Operation,
        local_id: impl Into<String>,
        mut payload: Map<String, Value>,
    ) -> Self {
        for key in BOOKKEEPING_FIELDS {
            payload.remove(key);
        }
        Self {
            entity_type: entity_type.into(),
            operation,
            local_id: local_id.into(),
            payload,
        }
    }

    /// Returns a payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}
