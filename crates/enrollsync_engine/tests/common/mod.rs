//! In-process remote used by the integration tests.

#![allow(dead_code)]

use enrollsync_engine::protocol::{
    Conflict, JobStatusResponse, SubmitReply, SubmitRequest, SubmitResponse, SyncJobTicket,
    SyncMapping,
};
use enrollsync_engine::{
    EntitySchema, HttpError, HttpTransport, LoopbackClient, LoopbackServer, MemoryStore,
    SyncConfig, SyncManager, SyncableRecord, JOBS_PATH, SUBMIT_PATH,
};
use enrollsync_engine::{BackoffConfig, ConnectivityMonitor, PollConfig};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// How the remote answers submissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Answers with mappings directly.
    #[default]
    Immediate,
    /// Hands back a job that completes after this many polls.
    Deferred(u32),
    /// Hands back a job that fails on the first poll.
    FailingJob,
}

struct Job {
    polls_left: u32,
    result: JobStatusResponse,
}

#[derive(Default)]
struct RemoteState {
    reachable: bool,
    mode: Mode,
    rejected_types: HashSet<String>,
    next_id: u64,
    assigned: HashMap<(String, String, String), String>,
    received: Vec<SubmitRequest>,
    jobs: HashMap<String, Job>,
    polls: VecDeque<String>,
}

/// Assigns global identifiers and remembers everything it was sent.
///
/// Identifiers are deduplicated by `(deviceId, entityType, localId)`, so a
/// resubmitted record keeps its global identifier.
#[derive(Clone)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        let state = RemoteState {
            reachable: true,
            ..RemoteState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        self.state.lock().mode = mode;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn reject(&self, entity_type: &str) {
        self.state.lock().rejected_types.insert(entity_type.to_string());
    }

    pub fn accept(&self, entity_type: &str) {
        self.state.lock().rejected_types.remove(entity_type);
    }

    pub fn received(&self) -> Vec<SubmitRequest> {
        self.state.lock().received.clone()
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().polls.len()
    }

    pub fn global_id(&self, device_id: &str, entity_type: &str, local_id: &str) -> Option<String> {
        self.state
            .lock()
            .assigned
            .get(&(
                device_id.to_string(),
                entity_type.to_string(),
                local_id.to_string(),
            ))
            .cloned()
    }

    fn process(state: &mut RemoteState, request: &SubmitRequest) -> (Vec<SyncMapping>, Vec<Conflict>) {
        let mut mappings = Vec::new();
        let mut conflicts = Vec::new();

        for item in &request.batch {
            if state.rejected_types.contains(&item.entity_type) {
                conflicts.push(
                    Conflict::new(item.entity_type.clone(), item.local_id.clone())
                        .with_reason("rejected by validation"),
                );
                continue;
            }

            let key = (
                request.device_id.clone(),
                item.entity_type.clone(),
                item.local_id.clone(),
            );
            let global_id = match state.assigned.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    state.next_id += 1;
                    let id = format!("G-{}-{}", item.entity_type, state.next_id);
                    state.assigned.insert(key, id.clone());
                    id
                }
            };
            mappings.push(SyncMapping::new(
                item.entity_type.clone(),
                item.local_id.clone(),
                global_id,
            ));
        }

        (mappings, conflicts)
    }
}

impl LoopbackServer for FakeRemote {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpError> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(HttpError::Connect("connection refused".into()));
        }
        if path != SUBMIT_PATH {
            return Err(HttpError::Status {
                status: 404,
                body: path.to_string(),
            });
        }

        let request = SubmitRequest::decode(body).map_err(|e| HttpError::Status {
            status: 400,
            body: e.to_string(),
        })?;
        state.received.push(request.clone());
        let (mappings, conflicts) = Self::process(&mut state, &request);

        let response = match state.mode {
            Mode::Immediate => {
                SubmitResponse::Completed(SubmitReply::success(mappings, conflicts))
            }
            Mode::Deferred(polls) => {
                let batch_id = format!("job-{}", state.received.len());
                state.jobs.insert(
                    batch_id.clone(),
                    Job {
                        polls_left: polls,
                        result: JobStatusResponse::completed(mappings, conflicts),
                    },
                );
                SubmitResponse::Deferred(SyncJobTicket::processing(batch_id))
            }
            Mode::FailingJob => {
                let batch_id = format!("job-{}", state.received.len());
                let rejected = request
                    .batch
                    .iter()
                    .map(|item| Conflict::new(item.entity_type.clone(), item.local_id.clone()))
                    .collect();
                state.jobs.insert(
                    batch_id.clone(),
                    Job {
                        polls_left: 1,
                        result: JobStatusResponse::failed("worker crashed", rejected),
                    },
                );
                SubmitResponse::Deferred(SyncJobTicket::processing(batch_id))
            }
        };

        response.encode().map_err(|e| HttpError::Status {
            status: 500,
            body: e.to_string(),
        })
    }

    fn handle_get(&self, path: &str) -> Result<Vec<u8>, HttpError> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(HttpError::Connect("connection refused".into()));
        }
        let Some(batch_id) = path.strip_prefix(JOBS_PATH) else {
            return Err(HttpError::Status {
                status: 404,
                body: path.to_string(),
            });
        };
        let batch_id = batch_id.to_string();
        state.polls.push_back(batch_id.clone());

        let Some(job) = state.jobs.get_mut(&batch_id) else {
            return Err(HttpError::Status {
                status: 404,
                body: batch_id,
            });
        };
        let response = if job.polls_left > 1 {
            job.polls_left -= 1;
            JobStatusResponse::processing()
        } else {
            job.result.clone()
        };

        response.encode().map_err(|e| HttpError::Status {
            status: 500,
            body: e.to_string(),
        })
    }
}

pub type Transport = HttpTransport<LoopbackClient<FakeRemote>>;
pub type Manager = SyncManager<Transport, MemoryStore>;

/// A manager wired to a fake remote over the loopback HTTP client.
pub struct Harness {
    pub remote: FakeRemote,
    pub store: Arc<MemoryStore>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub manager: Arc<Manager>,
}

pub fn config() -> SyncConfig {
    SyncConfig::new("https://school.example.com/api")
        .with_sync_interval(Duration::from_secs(30))
        .with_poll(PollConfig::new(Duration::from_secs(2), 10))
        .with_backoff(BackoffConfig::new(
            Duration::from_secs(5),
            Duration::from_secs(60),
        ))
}

pub fn harness(config: SyncConfig) -> Harness {
    harness_with(config, &EntitySchema::school_enrollment())
}

pub fn harness_with(config: SyncConfig, schema: &EntitySchema) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let remote = FakeRemote::new();
    let transport = HttpTransport::from_config(&config, LoopbackClient::new(remote.clone()));
    let connectivity = Arc::new(ConnectivityMonitor::new(true));
    let manager = SyncManager::new(
        config,
        schema,
        Arc::clone(&store),
        Arc::new(transport),
        connectivity.clone(),
    )
    .unwrap();

    Harness {
        remote,
        store,
        connectivity,
        manager: Arc::new(manager),
    }
}

pub fn record(entity_type: &str, local_id: &str, fields: &[(&str, &str)]) -> SyncableRecord {
    let fields: Map<String, Value> = fields
        .iter()
        .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
        .collect();
    SyncableRecord::new(entity_type, local_id, fields)
}
