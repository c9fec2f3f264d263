//! Reconciliation of remote identifier mappings into the local store.
//!
//! # Algorithm
//!
//! 1. Index every mapping of the batch by `(entity type, local id)`
//! 2. Split mappings into independent and dependent entity types; a type is
//!    dependent when one of its foreign keys targets a type mapped in the
//!    same batch
//! 3. Stamp independent records first, then dependent records in dependency
//!    order, rewriting foreign keys from the index as they are stamped; a
//!    record edited after its batch item was built keeps the global id but
//!    stays `pending`
//! 4. Rewrite references held by records outside the batch that still point
//!    at a local id mapped in this batch
//! 5. Persist the sync watermark, when one is given
//!
//! All of it runs in one store transaction: a failure leaves the store
//! exactly as it was.

use crate::device::{format_watermark, LAST_SYNC_KEY};
use crate::error::SyncResult;
use crate::record::{SyncStatus, SyncableRecord};
use crate::schema::DependencyOrder;
use crate::store::{LocalStore, StoreResult, StoreTransaction};
use chrono::{DateTime, Utc};
use enrollsync_protocol::{BatchItem, Conflict, SyncMapping};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counts describing one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records stamped with a global id and marked synced.
    pub applied: usize,
    /// Mappings already reflected in the store.
    pub unchanged: usize,
    /// Mappings whose record no longer exists locally.
    pub missing: usize,
    /// Mappings refused because the record holds a different global id.
    pub refused: usize,
    /// Records stamped with a global id but left pending because they were
    /// edited after submission.
    pub stale: usize,
    /// Foreign-key fields rewritten from local to global ids.
    pub rewritten_references: usize,
}

type MappingIndex<'a> = HashMap<(&'a str, &'a str), &'a str>;

type SentVersions<'a> = HashMap<(&'a str, &'a str), DateTime<Utc>>;

fn sent_versions(sent: &[BatchItem]) -> SentVersions<'_> {
    sent.iter()
        .filter_map(|item| {
            let updated_at = item.field("updatedAt")?.as_str()?;
            let updated_at = DateTime::parse_from_rfc3339(updated_at).ok()?;
            Some((
                (item.entity_type.as_str(), item.local_id.as_str()),
                updated_at.with_timezone(&Utc),
            ))
        })
        .collect()
}

/// Applies remote verdicts to the local store.
pub struct Reconciler<S: LocalStore> {
    store: Arc<S>,
    order: Arc<DependencyOrder>,
}

impl<S: LocalStore> Reconciler<S> {
    /// Creates a reconciler.
    pub fn new(store: Arc<S>, order: Arc<DependencyOrder>) -> Self {
        Self { store, order }
    }

    /// Applies identifier mappings and records `watermark` as the last sync.
    ///
    /// `sent` is the submitted batch. A record whose `updatedAt` moved past
    /// the submitted version is stamped but left `pending`; records without a
    /// submitted item are not checked. With no mappings and no watermark the
    /// store is not touched.
    pub fn apply(
        &self,
        mappings: &[SyncMapping],
        sent: &[BatchItem],
        watermark: Option<DateTime<Utc>>,
    ) -> SyncResult<ReconcileReport> {
        if mappings.is_empty() && watermark.is_none() {
            return Ok(ReconcileReport::default());
        }

        let versions = sent_versions(sent);
        let index: MappingIndex<'_> = mappings
            .iter()
            .map(|m| ((m.entity_type.as_str(), m.local_id.as_str()), m.global_id.as_str()))
            .collect();

        let (independent, dependent) = self.partition(mappings);

        let mapped_types: BTreeSet<&str> =
            mappings.iter().map(|m| m.entity_type.as_str()).collect();
        let mut scope: BTreeSet<&str> = mapped_types.clone();
        for target in &mapped_types {
            scope.extend(self.order.referencing(target).map(|(entity, _)| entity));
        }
        let scope: Vec<&str> = scope.into_iter().collect();

        let now = Utc::now();
        let mut report = ReconcileReport::default();

        self.store.transaction(&scope, &mut |txn| {
            report = ReconcileReport::default();
            let mut stamped: HashSet<(&str, &str)> = HashSet::new();

            for mapping in independent.iter().chain(dependent.iter()) {
                let sent_at = versions
                    .get(&(mapping.entity_type.as_str(), mapping.local_id.as_str()))
                    .copied();
                if self.stamp(txn, mapping, &index, sent_at, now, &mut report)? {
                    stamped.insert((mapping.entity_type.as_str(), mapping.local_id.as_str()));
                }
            }

            for target in &mapped_types {
                for (entity_type, field) in self.order.referencing(target) {
                    for mut record in txn.list(entity_type)? {
                        if stamped.contains(&(entity_type, record.local_id.as_str())) {
                            continue;
                        }
                        let Some(global_id) = record
                            .field_str(field)
                            .and_then(|local_id| index.get(&(*target, local_id)))
                            .map(|global_id| global_id.to_string())
                        else {
                            continue;
                        };
                        record
                            .fields
                            .insert(field.to_string(), Value::String(global_id));
                        report.rewritten_references += 1;
                        txn.put(record)?;
                    }
                }
            }

            match watermark {
                Some(watermark) => txn.put_meta(LAST_SYNC_KEY, &format_watermark(watermark)),
                None => Ok(()),
            }
        })?;

        info!(
            applied = report.applied,
            unchanged = report.unchanged,
            missing = report.missing,
            refused = report.refused,
            stale = report.stale,
            rewritten = report.rewritten_references,
            "reconciled sync mappings"
        );
        Ok(report)
    }

    /// Flags rejected records as `conflict`.
    ///
    /// Only pending records change; returns how many did.
    pub fn mark_conflicts(&self, conflicts: &[Conflict]) -> SyncResult<usize> {
        if conflicts.is_empty() {
            return Ok(0);
        }

        let scope: Vec<&str> = conflicts
            .iter()
            .map(|c| c.entity_type.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut flagged = 0;

        self.store.transaction(&scope, &mut |txn| {
            flagged = 0;
            for conflict in conflicts {
                let Some(mut record) = txn.get(&conflict.entity_type, &conflict.local_id)? else {
                    continue;
                };
                if record.sync_status != SyncStatus::Pending {
                    continue;
                }
                record.sync_status = SyncStatus::Conflict;
                txn.put(record)?;
                flagged += 1;
            }
            Ok(())
        })?;

        if flagged > 0 {
            warn!(flagged, "records flagged as conflicts");
        }
        Ok(flagged)
    }

    /// Returns a `conflict` record to `pending` so the next cycle retries it.
    ///
    /// Returns false if the record is missing or not in conflict.
    pub fn reset_conflict(&self, entity_type: &str, local_id: &str) -> SyncResult<bool> {
        let mut reset = false;

        self.store.transaction(&[entity_type], &mut |txn| {
            reset = false;
            let Some(mut record) = txn.get(entity_type, local_id)? else {
                return Ok(());
            };
            if record.sync_status != SyncStatus::Conflict {
                return Ok(());
            }
            record.sync_status = SyncStatus::Pending;
            txn.put(record)?;
            reset = true;
            Ok(())
        })?;

        Ok(reset)
    }

    fn partition<'m>(
        &self,
        mappings: &'m [SyncMapping],
    ) -> (Vec<&'m SyncMapping>, Vec<&'m SyncMapping>) {
        let mapped_types: HashSet<&str> =
            mappings.iter().map(|m| m.entity_type.as_str()).collect();

        let (independent, mut dependent): (Vec<_>, Vec<_>) =
            mappings.iter().partition(|mapping| {
                !self
                    .order
                    .foreign_keys(&mapping.entity_type)
                    .iter()
                    .any(|fk| mapped_types.contains(fk.target.as_str()))
            });

        // Deeper dependents after shallower ones; stable within a type.
        dependent.sort_by_key(|mapping| self.order.rank(&mapping.entity_type));
        (independent, dependent)
    }

    /// Stamps one mapping. Returns true if the record was written.
    fn stamp(
        &self,
        txn: &mut dyn StoreTransaction,
        mapping: &SyncMapping,
        index: &MappingIndex<'_>,
        sent_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> StoreResult<bool> {
        let Some(mut record) = txn.get(&mapping.entity_type, &mapping.local_id)? else {
            debug!(
                entity_type = %mapping.entity_type,
                local_id = %mapping.local_id,
                "mapped record no longer exists"
            );
            report.missing += 1;
            return Ok(false);
        };

        match record.global_id.as_deref() {
            Some(existing) if existing != mapping.global_id => {
                warn!(
                    entity_type = %mapping.entity_type,
                    local_id = %mapping.local_id,
                    existing,
                    received = %mapping.global_id,
                    "refusing to overwrite global id"
                );
                report.refused += 1;
                return Ok(false);
            }
            Some(_) if record.sync_status == SyncStatus::Synced => {
                report.unchanged += 1;
                return Ok(false);
            }
            _ => {}
        }

        report.rewritten_references += self.rewrite_references(txn, &mut record, index)?;
        record.global_id = Some(mapping.global_id.clone());

        if sent_at.is_some_and(|sent_at| record.updated_at > sent_at) {
            debug!(
                entity_type = %mapping.entity_type,
                local_id = %mapping.local_id,
                "record edited during sync, left pending"
            );
            txn.put(record)?;
            report.stale += 1;
            return Ok(true);
        }

        record.sync_status = SyncStatus::Synced;
        record.synced_at = Some(now);
        txn.put(record)?;
        report.applied += 1;
        Ok(true)
    }

    /// Replaces foreign keys that point at local ids with global ids.
    ///
    /// Looks in this batch's mappings first, then at the referenced record
    /// itself in case it was mapped by an earlier cycle. Unresolvable
    /// references keep their value.
    fn rewrite_references(
        &self,
        txn: &mut dyn StoreTransaction,
        record: &mut SyncableRecord,
        index: &MappingIndex<'_>,
    ) -> StoreResult<usize> {
        let mut rewritten = 0;

        for fk in self.order.foreign_keys(&record.entity_type) {
            let Some(current) = record.field_str(&fk.field).map(str::to_owned) else {
                continue;
            };

            let resolved = match index.get(&(fk.target.as_str(), current.as_str())) {
                Some(global_id) => Some((*global_id).to_string()),
                None => txn
                    .get(&fk.target, &current)?
                    .and_then(|referenced| referenced.global_id),
            };

            if let Some(global_id) = resolved.filter(|global_id| *global_id != current) {
                record.fields.insert(fk.field.clone(), Value::String(global_id));
                rewritten += 1;
            }
        }

        Ok(rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::last_sync;
    use crate::schema::{EntityDef, EntitySchema};
    use crate::store::MemoryStore;
    use serde_json::{json, Map};

    fn order() -> Arc<DependencyOrder> {
        let schema = EntitySchema::new()
            .with_entity(EntityDef::new("parent"))
            .with_entity(EntityDef::new("child").references("parentId", "parent"))
            .with_entity(EntityDef::new("grandchild").references("childId", "child"));
        Arc::new(schema.dependency_order().unwrap())
    }

    fn setup() -> (Arc<MemoryStore>, Reconciler<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(Arc::clone(&store), order());
        (store, reconciler)
    }

    fn record(entity_type: &str, local_id: &str, fields: Value) -> SyncableRecord {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        SyncableRecord::new(entity_type, local_id, fields)
    }

    fn get(store: &MemoryStore, entity_type: &str, local_id: &str) -> SyncableRecord {
        store.get(entity_type, local_id).unwrap().unwrap()
    }

    #[test]
    fn parent_and_child_are_stamped_and_linked() {
        let (store, reconciler) = setup();
        store.put(record("parent", "p1", json!({"name": "A"}))).unwrap();
        store.put(record("child", "c1", json!({"parentId": "p1"}))).unwrap();

        // Dependent mapping first on purpose: ordering is the reconciler's job.
        let mappings = vec![
            SyncMapping::new("child", "c1", "C1"),
            SyncMapping::new("parent", "p1", "P1"),
        ];
        let watermark = Utc::now();
        let report = reconciler.apply(&mappings, &[], Some(watermark)).unwrap();

        let parent = get(&store, "parent", "p1");
        let child = get(&store, "child", "c1");
        assert_eq!(parent.global_id.as_deref(), Some("P1"));
        assert_eq!(parent.sync_status, SyncStatus::Synced);
        assert!(parent.synced_at.is_some());
        assert_eq!(child.global_id.as_deref(), Some("C1"));
        assert_eq!(child.sync_status, SyncStatus::Synced);
        assert_eq!(child.field_str("parentId"), Some("P1"));

        assert_eq!(report.applied, 2);
        assert_eq!(report.rewritten_references, 1);
        assert_eq!(last_sync(store.as_ref()).unwrap(), Some(watermark));
    }

    #[test]
    fn applying_twice_is_a_noop() {
        let (store, reconciler) = setup();
        store.put(record("parent", "p1", json!({}))).unwrap();
        let mappings = vec![SyncMapping::new("parent", "p1", "P1")];

        reconciler.apply(&mappings, &[], Some(Utc::now())).unwrap();
        let first = get(&store, "parent", "p1");

        let report = reconciler.apply(&mappings, &[], Some(Utc::now())).unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(get(&store, "parent", "p1"), first);
    }

    #[test]
    fn global_id_is_never_overwritten() {
        let (store, reconciler) = setup();
        store.put(record("parent", "p1", json!({}))).unwrap();
        reconciler
            .apply(&[SyncMapping::new("parent", "p1", "P1")], &[], Some(Utc::now()))
            .unwrap();

        let mut edited = get(&store, "parent", "p1");
        edited.set_field("name", json!("B"));
        store.put(edited).unwrap();

        let report = reconciler
            .apply(&[SyncMapping::new("parent", "p1", "OTHER")], &[], Some(Utc::now()))
            .unwrap();
        assert_eq!(report.refused, 1);
        let parent = get(&store, "parent", "p1");
        assert_eq!(parent.global_id.as_deref(), Some("P1"));
        assert!(parent.is_pending());
    }

    #[test]
    fn missing_records_are_skipped() {
        let (store, reconciler) = setup();
        store.put(record("parent", "p1", json!({}))).unwrap();
        let before = get(&store, "parent", "p1");

        let report = reconciler
            .apply(&[SyncMapping::new("parent", "gone", "G")], &[], Some(Utc::now()))
            .unwrap();
        assert_eq!(report.missing, 1);
        assert_eq!(get(&store, "parent", "p1"), before);
        assert!(store.get("parent", "gone").unwrap().is_none());
    }

    #[test]
    fn unmapped_references_keep_their_value() {
        let (store, reconciler) = setup();
        store
            .put(record("child", "c1", json!({"parentId": "ALREADY-GLOBAL"})))
            .unwrap();

        reconciler
            .apply(&[SyncMapping::new("child", "c1", "C1")], &[], Some(Utc::now()))
            .unwrap();
        assert_eq!(get(&store, "child", "c1").field_str("parentId"), Some("ALREADY-GLOBAL"));
    }

    #[test]
    fn references_to_previously_synced_parents_are_resolved() {
        let (store, reconciler) = setup();
        store.put(record("parent", "p1", json!({}))).unwrap();
        reconciler
            .apply(&[SyncMapping::new("parent", "p1", "P1")], &[], Some(Utc::now()))
            .unwrap();

        store.put(record("child", "c1", json!({"parentId": "p1"}))).unwrap();
        reconciler
            .apply(&[SyncMapping::new("child", "c1", "C1")], &[], Some(Utc::now()))
            .unwrap();
        assert_eq!(get(&store, "child", "c1").field_str("parentId"), Some("P1"));
    }

    #[test]
    fn records_outside_the_batch_are_relinked() {
        let (store, reconciler) = setup();
        store.put(record("parent", "p1", json!({}))).unwrap();
        let mut child = record("child", "c1", json!({"parentId": "p1"}));
        child.global_id = Some("C1".into());
        child.sync_status = SyncStatus::Synced;
        store.put(child).unwrap();

        let report = reconciler
            .apply(&[SyncMapping::new("parent", "p1", "P1")], &[], Some(Utc::now()))
            .unwrap();
        let child = get(&store, "child", "c1");
        assert_eq!(child.field_str("parentId"), Some("P1"));
        assert_eq!(child.sync_status, SyncStatus::Synced);
        assert_eq!(report.rewritten_references, 1);
    }

    #[test]
    fn three_level_chain_in_one_batch() {
        let (store, reconciler) = setup();
        store.put(record("parent", "p1", json!({}))).unwrap();
        store.put(record("child", "c1", json!({"parentId": "p1"}))).unwrap();
        store.put(record("grandchild", "g1", json!({"childId": "c1"}))).unwrap();

        reconciler
            .apply(
                &[
                    SyncMapping::new("grandchild", "g1", "G1"),
                    SyncMapping::new("child", "c1", "C1"),
                    SyncMapping::new("parent", "p1", "P1"),
                ],
                &[],
                Some(Utc::now()),
            )
            .unwrap();

        assert_eq!(get(&store, "child", "c1").field_str("parentId"), Some("P1"));
        assert_eq!(get(&store, "grandchild", "g1").field_str("childId"), Some("C1"));
    }

    #[test]
    fn store_failure_rolls_back_everything() {
        let (store, reconciler) = setup();
        store.put(record("parent", "p1", json!({}))).unwrap();
        store.put(record("child", "c1", json!({"parentId": "p1"}))).unwrap();
        store.fail_writes_after(Some(1));

        let result = reconciler.apply(
            &[
                SyncMapping::new("parent", "p1", "P1"),
                SyncMapping::new("child", "c1", "C1"),
            ],
            &[],
            Some(Utc::now()),
        );
        assert!(result.is_err());

        let parent = get(&store, "parent", "p1");
        assert!(parent.global_id.is_none());
        assert!(parent.is_pending());
        assert_eq!(get(&store, "child", "c1").field_str("parentId"), Some("p1"));
        assert_eq!(last_sync(store.as_ref()).unwrap(), None);
    }

    #[test]
    fn record_edited_after_submission_stays_pending() {
        let (store, reconciler) = setup();
        store.put(record("parent", "p1", json!({"name": "Old"}))).unwrap();
        store.put(record("child", "c1", json!({"parentId": "p1"}))).unwrap();
        let sent: Vec<BatchItem> = [get(&store, "parent", "p1"), get(&store, "child", "c1")]
            .iter()
            .filter_map(SyncableRecord::to_batch_item)
            .collect();

        let mut edited = get(&store, "child", "c1");
        edited.set_field("note", json!("late edit"));
        edited.updated_at += chrono::Duration::seconds(1);
        store.put(edited).unwrap();

        let report = reconciler
            .apply(
                &[
                    SyncMapping::new("parent", "p1", "P1"),
                    SyncMapping::new("child", "c1", "C1"),
                ],
                &sent,
                Some(Utc::now()),
            )
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.stale, 1);

        let child = get(&store, "child", "c1");
        assert!(child.is_pending());
        assert!(child.synced_at.is_none());
        assert_eq!(child.global_id.as_deref(), Some("C1"));
        assert_eq!(child.field_str("parentId"), Some("P1"));
        assert_eq!(child.field_str("note"), Some("late edit"));
        assert_eq!(get(&store, "parent", "p1").sync_status, SyncStatus::Synced);
    }

    #[test]
    fn without_watermark_the_last_sync_is_kept() {
        let (store, reconciler) = setup();
        store.put(record("parent", "p1", json!({}))).unwrap();

        let report = reconciler.apply(&[], &[], None).unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(last_sync(store.as_ref()).unwrap(), None);

        reconciler
            .apply(&[SyncMapping::new("parent", "p1", "P1")], &[], None)
            .unwrap();
        assert_eq!(get(&store, "parent", "p1").sync_status, SyncStatus::Synced);
        assert_eq!(last_sync(store.as_ref()).unwrap(), None);
    }

    #[test]
    fn reset_conflict_writes_through_a_transaction() {
        let (store, reconciler) = setup();
        let mut conflicted = record("parent", "p1", json!({}));
        conflicted.sync_status = SyncStatus::Conflict;
        store.put(conflicted).unwrap();
        store.fail_writes_after(Some(0));

        assert!(reconciler.reset_conflict("parent", "p1").is_err());
        assert_eq!(get(&store, "parent", "p1").sync_status, SyncStatus::Conflict);

        store.fail_writes_after(None);
        assert!(reconciler.reset_conflict("parent", "p1").unwrap());
        assert!(!reconciler.reset_conflict("missing", "x").unwrap());
    }

    #[test]
    fn conflicts_can_be_flagged_and_reset() {
        let (store, reconciler) = setup();
        store.put(record("parent", "p1", json!({}))).unwrap();
        let mut synced = record("parent", "p2", json!({}));
        synced.sync_status = SyncStatus::Synced;
        store.put(synced).unwrap();

        let flagged = reconciler
            .mark_conflicts(&[
                Conflict::new("parent", "p1"),
                Conflict::new("parent", "p2"),
                Conflict::new("parent", "gone"),
            ])
            .unwrap();
        assert_eq!(flagged, 1);
        assert_eq!(get(&store, "parent", "p1").sync_status, SyncStatus::Conflict);
        assert_eq!(get(&store, "parent", "p2").sync_status, SyncStatus::Synced);

        assert!(reconciler.reset_conflict("parent", "p1").unwrap());
        assert!(get(&store, "parent", "p1").is_pending());
        assert!(!reconciler.reset_conflict("parent", "p1").unwrap());
    }
}
