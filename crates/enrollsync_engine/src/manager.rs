//! Sync manager: cycle orchestration, scheduling and backoff.
//!
//! A cycle is build → submit (→ poll) → reconcile. At most one cycle runs at
//! a time; triggers that arrive while one is in flight, while offline, or
//! with nothing pending are skipped. Failures grow the backoff that the
//! automatic loop waits out before its next attempt. A cycle that has
//! started always runs to completion.

use crate::batch::BatchBuilder;
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::device;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::schema::EntitySchema;
use crate::store::LocalStore;
use crate::submit::{BatchSubmitter, SubmitOutcome};
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use enrollsync_protocol::{BatchItem, Conflict};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// The current state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle is running.
    Idle,
    /// A cycle is in flight.
    Syncing,
}

/// Notifications emitted to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A cycle started with this many items.
    Started {
        /// Items in the batch.
        pending: usize,
    },
    /// A cycle finished.
    Completed {
        /// Records stamped with a global id.
        synced: usize,
        /// Records the remote rejected.
        conflicts: usize,
    },
    /// A cycle failed; backoff has been updated.
    ///
    /// Arrives without a preceding [`SyncEvent::Started`] when the local
    /// store fails before a batch could be built.
    Failed {
        /// Human-readable cause.
        message: String,
        /// True for network failures and polling timeouts.
        transient: bool,
        /// False when a later cycle cannot succeed without intervention.
        retryable: bool,
    },
}

/// Why a trigger did not start a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another cycle is in flight.
    AlreadySyncing,
    /// The network is unreachable.
    Offline,
    /// No record is pending.
    NothingPending,
}

/// Result of a completed cycle.
#[derive(Debug, Clone)]
pub struct SyncCycleResult {
    /// Items submitted.
    pub submitted: usize,
    /// What reconciliation changed.
    pub report: ReconcileReport,
    /// Records the remote rejected.
    pub conflicts: Vec<Conflict>,
    /// Records flagged `conflict` after reaching the rejection limit.
    pub flagged: usize,
    /// Deferred job identifier, if the remote deferred processing.
    pub batch_id: Option<String>,
    /// Watermark recorded by this cycle. `None` when nothing was accepted.
    pub watermark: Option<DateTime<Utc>>,
    /// Duration of the cycle.
    pub duration: Duration,
}

/// Result of a trigger.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// No cycle ran.
    Skipped(SkipReason),
    /// A cycle ran to completion.
    Completed(SyncCycleResult),
}

impl SyncOutcome {
    /// Returns true if no cycle ran.
    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncOutcome::Skipped(_))
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that completed.
    pub cycles_completed: u64,
    /// Cycles that failed.
    pub cycles_failed: u64,
    /// Records stamped with a global id.
    pub records_synced: u64,
    /// Rejections reported by the remote.
    pub conflicts_encountered: u64,
    /// Watermark of the last completed cycle.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    delay: Duration,
    retry_at: Option<Instant>,
}

/// Orchestrates sync cycles over a store and a transport.
pub struct SyncManager<T: SyncTransport, S: LocalStore> {
    config: SyncConfig,
    store: Arc<S>,
    builder: BatchBuilder<S>,
    submitter: BatchSubmitter<T>,
    reconciler: Reconciler<S>,
    connectivity: Arc<dyn Connectivity>,
    syncing: AtomicBool,
    backoff: Mutex<Backoff>,
    stats: RwLock<SyncStats>,
    rejections: Mutex<HashMap<(String, String), u32>>,
    events: broadcast::Sender<SyncEvent>,
}

struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<T: SyncTransport, S: LocalStore> SyncManager<T, S> {
    /// Creates a manager.
    ///
    /// Validates the schema and loads (or generates) the device identifier.
    pub fn new(
        config: SyncConfig,
        schema: &EntitySchema,
        store: Arc<S>,
        transport: Arc<T>,
        connectivity: Arc<dyn Connectivity>,
    ) -> SyncResult<Self> {
        let order = Arc::new(schema.dependency_order()?);
        let device_id = device::load_or_create_device_id(store.as_ref())?;

        let builder = BatchBuilder::new(Arc::clone(&store), Arc::clone(&order))
            .with_max_items(config.max_batch_size);
        let submitter = BatchSubmitter::new(transport, device_id, config.poll);
        let reconciler = Reconciler::new(Arc::clone(&store), order);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            config,
            store,
            builder,
            submitter,
            reconciler,
            connectivity,
            syncing: AtomicBool::new(false),
            backoff: Mutex::new(Backoff::default()),
            stats: RwLock::new(SyncStats::default()),
            rejections: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        if self.syncing.load(Ordering::SeqCst) {
            SyncState::Syncing
        } else {
            SyncState::Idle
        }
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the device identifier.
    pub fn device_id(&self) -> &str {
        self.submitter.device_id()
    }

    /// Returns the current backoff delay. Zero after a success.
    pub fn backoff_delay(&self) -> Duration {
        self.backoff.lock().delay
    }

    /// Returns the number of consecutive failed cycles.
    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.lock().failures
    }

    /// Returns how long the automatic loop still waits before retrying.
    pub fn remaining_backoff(&self) -> Duration {
        self.backoff
            .lock()
            .retry_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Subscribes to cycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Returns the number of records waiting to be synchronized.
    pub fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.builder.pending_count()?)
    }

    /// Returns a `conflict` record to `pending` and clears its rejection count.
    pub fn reset_conflict(&self, entity_type: &str, local_id: &str) -> SyncResult<bool> {
        let reset = self.reconciler.reset_conflict(entity_type, local_id)?;
        if reset {
            self.rejections
                .lock()
                .remove(&(entity_type.to_string(), local_id.to_string()));
            info!(entity_type, local_id, "conflict reset to pending");
        }
        Ok(reset)
    }

    /// Runs one cycle now, ignoring backoff.
    ///
    /// Returns [`SyncOutcome::Skipped`] when a cycle is already running, the
    /// network is down, or nothing is pending. Errors are returned after
    /// backoff has been updated and a [`SyncEvent::Failed`] emitted.
    pub async fn sync_now(&self) -> SyncResult<SyncOutcome> {
        if !self.connectivity.is_online() {
            debug!("offline, sync skipped");
            return Ok(SyncOutcome::Skipped(SkipReason::Offline));
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync already in progress");
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadySyncing));
        }
        let _guard = SyncingGuard(&self.syncing);

        let batch = match self.builder.build() {
            Ok(batch) => batch,
            Err(e) => return Err(self.fail(e.into())),
        };
        if batch.is_empty() {
            return Ok(SyncOutcome::Skipped(SkipReason::NothingPending));
        }

        let started = Instant::now();
        let watermark = Utc::now();
        info!(items = batch.len(), "sync cycle started");
        self.emit(SyncEvent::Started {
            pending: batch.len(),
        });

        match self.run_cycle(batch, watermark).await {
            Ok(mut result) => {
                result.duration = started.elapsed();
                self.succeed(&result);
                Ok(SyncOutcome::Completed(result))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn run_cycle(
        &self,
        batch: Vec<BatchItem>,
        watermark: DateTime<Utc>,
    ) -> SyncResult<SyncCycleResult> {
        let submitted = batch.len();
        let last_sync = device::last_sync(self.store.as_ref())?;

        let outcome = self.submitter.submit(batch.clone(), last_sync).await?;
        if let Some(error) = &outcome.job_error {
            warn!(%error, conflicts = outcome.conflicts.len(), "remote reported an error");
        }

        // Only a cycle the remote accepted something from moves the watermark.
        let watermark = (!outcome.mappings.is_empty() && outcome.job_error.is_none())
            .then_some(watermark);
        let report = self
            .reconciler
            .apply(&outcome.mappings, &batch, watermark)?;
        let flagged = self.track_rejections(&outcome)?;

        Ok(SyncCycleResult {
            submitted,
            report,
            conflicts: outcome.conflicts,
            flagged,
            batch_id: outcome.batch_id,
            watermark,
            duration: Duration::ZERO,
        })
    }

    fn track_rejections(&self, outcome: &SubmitOutcome) -> SyncResult<usize> {
        let Some(limit) = self.config.conflict_retry_limit else {
            return Ok(0);
        };

        let exhausted: Vec<Conflict> = {
            let mut rejections = self.rejections.lock();
            for mapping in &outcome.mappings {
                rejections.remove(&(mapping.entity_type.clone(), mapping.local_id.clone()));
            }

            let mut exhausted = Vec::new();
            for conflict in &outcome.conflicts {
                let key = (conflict.entity_type.clone(), conflict.local_id.clone());
                let count = rejections.entry(key.clone()).or_insert(0);
                *count += 1;
                if *count >= limit {
                    rejections.remove(&key);
                    exhausted.push(conflict.clone());
                }
            }
            exhausted
        };

        Ok(self.reconciler.mark_conflicts(&exhausted)?)
    }

    fn succeed(&self, result: &SyncCycleResult) {
        *self.backoff.lock() = Backoff::default();
        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.records_synced += result.report.applied as u64;
            stats.conflicts_encountered += result.conflicts.len() as u64;
            if result.watermark.is_some() {
                stats.last_sync_time = result.watermark;
            }
            stats.last_error = None;
        }

        info!(
            submitted = result.submitted,
            synced = result.report.applied,
            conflicts = result.conflicts.len(),
            flagged = result.flagged,
            duration_ms = result.duration.as_millis() as u64,
            "sync cycle completed"
        );
        self.emit(SyncEvent::Completed {
            synced: result.report.applied,
            conflicts: result.conflicts.len(),
        });
    }

    fn fail(&self, error: SyncError) -> SyncError {
        let transient = error.is_transient();
        let retryable = error.is_retryable();
        let delay = {
            let mut backoff = self.backoff.lock();
            backoff.failures = backoff.failures.saturating_add(1);
            backoff.delay = self.config.backoff.delay_after(backoff.failures);
            backoff.retry_at = Some(Instant::now() + self.config.backoff.jittered(backoff.delay));
            backoff.delay
        };
        {
            let mut stats = self.stats.write();
            stats.cycles_failed += 1;
            stats.last_error = Some(error.to_string());
        }

        if transient {
            info!(%error, ?delay, "sync cycle failed, backing off");
        } else if retryable {
            warn!(%error, ?delay, "sync cycle failed, backing off");
        } else {
            error!(%error, ?delay, "sync cycle failed and needs intervention");
        }
        self.emit(SyncEvent::Failed {
            message: error.to_string(),
            transient,
            retryable,
        });
        error
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn trigger(&self, source: &'static str) {
        match self.sync_now().await {
            Ok(SyncOutcome::Skipped(reason)) => debug!(source, ?reason, "trigger skipped"),
            Ok(SyncOutcome::Completed(_)) => debug!(source, "triggered cycle completed"),
            Err(error) => debug!(source, %error, "triggered cycle failed"),
        }
    }
}

impl<T, S> SyncManager<T, S>
where
    T: SyncTransport + 'static,
    S: LocalStore + 'static,
{
    /// Starts the automatic loop on the current tokio runtime.
    ///
    /// The loop ticks every `sync_interval` (first tick immediately), waits
    /// out any remaining backoff before running, and runs a cycle whenever
    /// connectivity comes back. Dropping the returned handle stops the loop
    /// like [`SyncHandle::shutdown`] does, without waiting for it.
    pub fn start(self: &Arc<Self>) -> SyncHandle {
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(self).run_loop(signal));
        info!(interval = ?self.config.sync_interval, "sync loop started");
        SyncHandle { shutdown, task }
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut connectivity = self.connectivity.subscribe();
        let mut online = *connectivity.borrow_and_update();
        let mut watching = true;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let wait = self.remaining_backoff();
                    if !wait.is_zero() {
                        debug!(?wait, "waiting out backoff");
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                    self.trigger("timer").await;
                }
                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let now_online = *connectivity.borrow_and_update();
                    if now_online && !online {
                        info!("connectivity restored");
                        self.trigger("connectivity").await;
                    }
                    online = now_online;
                }
            }
        }

        info!("sync loop stopped");
    }
}

/// Handle of a running automatic loop.
#[derive(Debug)]
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Returns true while the loop task is alive.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the loop, letting an in-flight cycle finish first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "sync loop task ended abnormally");
        }
    }
}
