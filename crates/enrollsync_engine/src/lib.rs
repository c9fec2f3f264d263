//! # EnrollSync Engine
//!
//! Offline-first synchronization of school enrollment records.
//!
//! This crate provides:
//! - A local store seam with status queries and atomic multi-collection writes
//! - Entity schema and foreign-key dependency ordering
//! - Dependency-ordered batch building
//! - Batch submission with deferred-job polling
//! - Reconciliation of remote global identifiers, including foreign keys
//! - A sync manager with single-flight cycles, backoff and events
//! - HTTP transport abstraction
//!
//! ## Architecture
//!
//! Records are created offline with a local identifier and marked
//! `pending`. A sync cycle:
//! 1. Builds a batch of pending records, parents before children
//! 2. Submits it; the remote either answers directly or hands back a job
//!    that is polled until it finishes
//! 3. Applies the returned `localId → globalId` mappings in one store
//!    transaction, rewriting foreign keys to the new global identifiers
//!
//! ## Key Invariants
//!
//! - At most one cycle runs at a time
//! - A record's global identifier is written once
//! - Reconciliation is all-or-nothing and idempotent
//! - Records never leave `pending` unless the remote accepted them, or they
//!   hit the configured rejection limit

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod config;
mod connectivity;
mod device;
mod error;
mod http;
mod manager;
mod reconcile;
mod record;
mod schema;
mod store;
mod submit;
mod transport;

pub use batch::BatchBuilder;
pub use config::{BackoffConfig, PollConfig, SyncConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use device::{last_sync, load_or_create_device_id, DEVICE_ID_KEY, LAST_SYNC_KEY};
pub use error::{SyncError, SyncResult};
pub use http::{
    HttpClient, HttpError, HttpTransport, LoopbackClient, LoopbackServer, JOBS_PATH, SUBMIT_PATH,
};
pub use manager::{
    SkipReason, SyncCycleResult, SyncEvent, SyncHandle, SyncManager, SyncOutcome, SyncState,
    SyncStats,
};
pub use reconcile::{ReconcileReport, Reconciler};
pub use record::{RecordPatch, SyncStatus, SyncableRecord};
pub use schema::{DependencyOrder, EntityDef, EntitySchema, ForeignKey, SchemaError};
pub use store::{
    LocalStore, MemoryStore, StoreError, StoreResult, StoreTransaction, TransactionFn,
};
pub use submit::{BatchSubmitter, SubmitOutcome};
pub use transport::{MockTransport, SyncTransport};

pub use enrollsync_protocol as protocol;
