//! Local persistent store seam and an in-memory implementation.
//!
//! The sync engine only needs per-collection reads, a status query, a
//! transactional write primitive, and a small metadata area for the device
//! identifier and sync watermark. Anything that can provide those (IndexedDB
//! behind FFI, SQLite, the in-memory store below) can back the engine.

use crate::record::{RecordPatch, SyncStatus, SyncableRecord};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a local store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached (closed, locked, I/O failure).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store is in a state that does not allow the operation.
    #[error("invalid store state: {0}")]
    InvalidState(String),

    /// A write touched a collection outside the transaction scope.
    #[error("collection {0} is outside the transaction scope")]
    OutOfScope(String),
}

/// Writes performed inside [`LocalStore::transaction`].
///
/// Reads observe the transaction's own staged writes.
pub trait StoreTransaction {
    /// Gets a record by local identifier.
    fn get(&mut self, entity_type: &str, local_id: &str) -> StoreResult<Option<SyncableRecord>>;

    /// Stages a record write.
    fn put(&mut self, record: SyncableRecord) -> StoreResult<()>;

    /// Lists every record in a collection.
    fn list(&mut self, entity_type: &str) -> StoreResult<Vec<SyncableRecord>>;

    /// Stages a metadata write.
    fn put_meta(&mut self, key: &str, value: &str) -> StoreResult<()>;
}

/// Body of a store transaction.
pub type TransactionFn<'a> = dyn FnMut(&mut dyn StoreTransaction) -> StoreResult<()> + 'a;

/// The local persistent store consumed by the sync engine.
pub trait LocalStore: Send + Sync {
    /// Gets a record by local identifier.
    fn get(&self, entity_type: &str, local_id: &str) -> StoreResult<Option<SyncableRecord>>;

    /// Inserts or replaces a record.
    fn put(&self, record: SyncableRecord) -> StoreResult<()>;

    /// Applies a partial update. Returns the updated record, or `None` if
    /// it does not exist.
    fn update(
        &self,
        entity_type: &str,
        local_id: &str,
        patch: RecordPatch,
    ) -> StoreResult<Option<SyncableRecord>>;

    /// Returns every record of a collection with the given status.
    fn filter_by_status(
        &self,
        entity_type: &str,
        status: SyncStatus,
    ) -> StoreResult<Vec<SyncableRecord>>;

    /// Runs `body` as one atomic unit over the `scope` collections.
    ///
    /// Either every staged write becomes visible or none does. Other writers
    /// are excluded until the transaction finishes.
    fn transaction(&self, scope: &[&str], body: &mut TransactionFn<'_>) -> StoreResult<()>;

    /// Reads a metadata value.
    fn get_meta(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes a metadata value.
    fn put_meta(&self, key: &str, value: &str) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct StoreState {
    collections: HashMap<String, BTreeMap<String, SyncableRecord>>,
    meta: HashMap<String, String>,
}

impl StoreState {
    fn get(&self, entity_type: &str, local_id: &str) -> Option<&SyncableRecord> {
        self.collections
            .get(entity_type)
            .and_then(|records| records.get(local_id))
    }
}

/// An in-memory store with all-or-nothing transactions.
///
/// Also used by tests to simulate store outages via
/// [`set_available`](Self::set_available) and
/// [`fail_writes_after`](Self::fail_writes_after).
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    available: AtomicBool,
    fail_after: RwLock<Option<usize>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            available: AtomicBool::new(true),
            fail_after: RwLock::new(None),
        }
    }

    /// Makes every operation fail with [`StoreError::Unavailable`] while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes transactions fail after `writes` staged record writes.
    ///
    /// `None` clears the fault.
    pub fn fail_writes_after(&self, writes: Option<usize>) {
        *self.fail_after.write() = writes;
    }

    /// Returns every record of a collection, ordered by local identifier.
    pub fn all(&self, entity_type: &str) -> Vec<SyncableRecord> {
        self.state
            .read()
            .collections
            .get(entity_type)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is offline".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, entity_type: &str, local_id: &str) -> StoreResult<Option<SyncableRecord>> {
        self.ensure_available()?;
        Ok(self.state.read().get(entity_type, local_id).cloned())
    }

    fn put(&self, record: SyncableRecord) -> StoreResult<()> {
        self.ensure_available()?;
        self.state
            .write()
            .collections
            .entry(record.entity_type.clone())
            .or_default()
            .insert(record.local_id.clone(), record);
        Ok(())
    }

    fn update(
        &self,
        entity_type: &str,
        local_id: &str,
        patch: RecordPatch,
    ) -> StoreResult<Option<SyncableRecord>> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let Some(record) = state
            .collections
            .get_mut(entity_type)
            .and_then(|records| records.get_mut(local_id))
        else {
            return Ok(None);
        };

        if let Some(global_id) = patch.global_id {
            if let Some(existing) = record.global_id.as_ref().filter(|g| **g != global_id) {
                return Err(StoreError::InvalidState(format!(
                    "{entity_type}/{local_id} already has global id {existing}"
                )));
            }
            record.global_id = Some(global_id);
        }
        if let Some(status) = patch.sync_status {
            record.sync_status = status;
        }
        if let Some(synced_at) = patch.synced_at {
            record.synced_at = Some(synced_at);
        }
        if !patch.fields.is_empty() {
            record.fields.extend(patch.fields);
            record.updated_at = chrono::Utc::now();
        }

        Ok(Some(record.clone()))
    }

    fn filter_by_status(
        &self,
        entity_type: &str,
        status: SyncStatus,
    ) -> StoreResult<Vec<SyncableRecord>> {
        self.ensure_available()?;
        Ok(self
            .state
            .read()
            .collections
            .get(entity_type)
            .map(|records| {
                records
                    .values()
                    .filter(|record| record.sync_status == status)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn transaction(&self, scope: &[&str], body: &mut TransactionFn<'_>) -> StoreResult<()> {
        self.ensure_available()?;
        let fail_after = *self.fail_after.read();

        // Held for the whole body so no reader sees a partial rewrite.
        let mut state = self.state.write();
        let mut txn = MemoryTransaction {
            base: &state,
            scope,
            staged: HashMap::new(),
            staged_meta: HashMap::new(),
            writes: 0,
            fail_after,
        };
        body(&mut txn)?;

        let MemoryTransaction {
            staged,
            staged_meta,
            ..
        } = txn;
        for ((entity_type, local_id), record) in staged {
            state
                .collections
                .entry(entity_type)
                .or_default()
                .insert(local_id, record);
        }
        state.meta.extend(staged_meta);
        Ok(())
    }

    fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_available()?;
        Ok(self.state.read().meta.get(key).cloned())
    }

    fn put_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        self.ensure_available()?;
        self.state.write().meta.insert(key.into(), value.into());
        Ok(())
    }
}

struct MemoryTransaction<'a> {
    base: &'a StoreState,
    scope: &'a [&'a str],
    staged: HashMap<(String, String), SyncableRecord>,
    staged_meta: HashMap<String, String>,
    writes: usize,
    fail_after: Option<usize>,
}

impl MemoryTransaction<'_> {
    fn check_scope(&self, entity_type: &str) -> StoreResult<()> {
        if self.scope.contains(&entity_type) {
            Ok(())
        } else {
            Err(StoreError::OutOfScope(entity_type.into()))
        }
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn get(&mut self, entity_type: &str, local_id: &str) -> StoreResult<Option<SyncableRecord>> {
        let key = (entity_type.to_string(), local_id.to_string());
        if let Some(record) = self.staged.get(&key) {
            return Ok(Some(record.clone()));
        }
        Ok(self.base.get(entity_type, local_id).cloned())
    }

    fn put(&mut self, record: SyncableRecord) -> StoreResult<()> {
        self.check_scope(&record.entity_type)?;
        if self.fail_after.is_some_and(|limit| self.writes >= limit) {
            return Err(StoreError::Unavailable("write failed".into()));
        }
        self.writes += 1;
        self.staged.insert(
            (record.entity_type.clone(), record.local_id.clone()),
            record,
        );
        Ok(())
    }

    fn list(&mut self, entity_type: &str) -> StoreResult<Vec<SyncableRecord>> {
        let mut records: BTreeMap<String, SyncableRecord> = self
            .base
            .collections
            .get(entity_type)
            .cloned()
            .unwrap_or_default();
        for ((staged_type, local_id), record) in &self.staged {
            if staged_type == entity_type {
                records.insert(local_id.clone(), record.clone());
            }
        }
        Ok(records.into_values().collect())
    }

    fn put_meta(&mut self, key: &str, value: &str) -> StoreResult<()> {
        self.staged_meta.insert(key.into(), value.into());
        Ok(())
    }
}
