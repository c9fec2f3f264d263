//! Dependency-ordered batch builder.

use crate::record::SyncStatus;
use crate::schema::DependencyOrder;
use crate::store::{LocalStore, StoreResult};
use enrollsync_protocol::BatchItem;
use std::sync::Arc;
use tracing::debug;

/// Collects pending records into an ordered batch.
///
/// Building is a pure read: the store is never modified.
pub struct BatchBuilder<S: LocalStore> {
    store: Arc<S>,
    order: Arc<DependencyOrder>,
    max_items: Option<usize>,
}

impl<S: LocalStore> BatchBuilder<S> {
    /// Creates a builder over `store`.
    pub fn new(store: Arc<S>, order: Arc<DependencyOrder>) -> Self {
        Self {
            store,
            order,
            max_items: None,
        }
    }

    /// Caps the number of items per batch.
    ///
    /// The cap keeps a prefix of the ordered batch, so dependency order still
    /// holds. Records left out remain pending for the next cycle.
    pub fn with_max_items(mut self, max_items: Option<usize>) -> Self {
        self.max_items = max_items;
        self
    }

    /// Builds the next batch. An empty batch means nothing to synchronize.
    pub fn build(&self) -> StoreResult<Vec<BatchItem>> {
        let mut batch = Vec::new();

        for entity_type in self.order.entity_types() {
            let mut records = self
                .store
                .filter_by_status(entity_type, SyncStatus::Pending)?;
            records.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.local_id.cmp(&b.local_id))
            });

            batch.extend(records.iter().filter_map(|record| record.to_batch_item()));

            if let Some(max) = self.max_items {
                if batch.len() >= max {
                    batch.truncate(max);
                    break;
                }
            }
        }

        debug!(items = batch.len(), "built sync batch");
        Ok(batch)
    }

    /// Counts every record a batch would carry, ignoring the size cap.
    pub fn pending_count(&self) -> StoreResult<usize> {
        let mut count = 0;
        for entity_type in self.order.entity_types() {
            count += self
                .store
                .filter_by_status(entity_type, SyncStatus::Pending)?
                .iter()
                .filter(|record| record.to_batch_item().is_some())
                .count();
        }
        Ok(count)
    }
}
