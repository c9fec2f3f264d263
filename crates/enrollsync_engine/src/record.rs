//! Records held by the local store.

use chrono::{DateTime, Utc};
use enrollsync_protocol::{BatchItem, Operation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Synchronization state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local changes not yet acknowledged by the remote system.
    Pending,
    /// The remote system holds the current version.
    Synced,
    /// The remote system repeatedly rejected the record.
    Conflict,
}

/// An entity instance held by the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableRecord {
    /// Entity type (collection name).
    pub entity_type: String,
    /// Identifier assigned at creation, unique within the collection.
    pub local_id: String,
    /// Identifier assigned by the remote system. Write-once.
    pub global_id: Option<String>,
    /// Synchronization state.
    pub sync_status: SyncStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last local modification time.
    pub updated_at: DateTime<Utc>,
    /// Time of the last successful reconciliation.
    pub synced_at: Option<DateTime<Utc>>,
    /// Explicit delete marker.
    #[serde(default)]
    pub deleted: bool,
    /// Entity-specific fields, including foreign keys.
    pub fields: Map<String, Value>,
}

impl SyncableRecord {
    /// Creates a new pending record.
    pub fn new(
        entity_type: impl Into<String>,
        local_id: impl Into<String>,
        fields: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_type: entity_type.into(),
            local_id: local_id.into(),
            global_id: None,
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
            synced_at: None,
            deleted: false,
            fields,
        }
    }

    /// Sets a field value and marks the record pending.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
        self.touch();
    }

    /// Returns a field value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns a field as a string, if it is one.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Marks the record deleted and pending.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.touch();
    }

    /// Returns true if the record awaits synchronization.
    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    /// Converts the record into a batch item.
    ///
    /// Returns `None` for deleted records that never reached the remote.
    pub fn to_batch_item(&self) -> Option<BatchItem> {
        let operation = Operation::infer(self.global_id.is_some(), self.deleted)?;
        let mut payload = self.fields.clone();
        payload.insert("createdAt".into(), Value::String(self.created_at.to_rfc3339()));
        payload.insert("updatedAt".into(), Value::String(self.updated_at.to_rfc3339()));
        Some(BatchItem::new(
            self.entity_type.clone(),
            operation,
            self.local_id.clone(),
            payload,
        ))
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.sync_status = SyncStatus::Pending;
    }
}

/// Partial update applied through [`LocalStore::update`](crate::LocalStore::update).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    /// Global identifier to stamp.
    pub global_id: Option<String>,
    /// New synchronization state.
    pub sync_status: Option<SyncStatus>,
    /// New reconciliation time.
    pub synced_at: Option<DateTime<Utc>>,
    /// Fields to overwrite.
    pub fields: Map<String, Value>,
}

impl RecordPatch {
    /// Creates a patch that only changes the sync status.
    pub fn status(status: SyncStatus) -> Self {
        Self {
            sync_status: Some(status),
            ..Self::default()
        }
    }

    /// Adds a field overwrite.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}
