//! Per-node benchmark execution service.
//!
//! Watches the replicated document for entries assigned to the local node
//! and drives the local phase machine: fetch the definition and report
//! READY, start the worker when the benchmark goes RUNNING, gate iterations
//! while PAUSED, drop at the next checkpoint on ABORT, and report the final
//! per-node state. Every store write is conditional on the stored value, so
//! re-observing a state is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::meta::{BenchmarkEntry, BenchmarkState, NodeBenchState, NodeId};
use crate::model::BenchmarkDefinition;
use crate::results::NodeResultSink;
use crate::search::{AbortFlag, CompetitionRunner, CompetitionRunnerExt, PauseGate, SearchBackend};
use crate::store::{update_meta, ClusterStateStore, MetaChange};
use crate::transport::{
    BenchTransport, DefinitionRequest, ExecutorHandler, NodeResults, NodeResultsRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalPhase {
    /// Definition fetched, waiting for the benchmark to go RUNNING.
    Ready,
    /// Worker task executing competitions.
    Running,
    /// Worker finished; final node state reported (or about to be).
    Finished,
}

/// Ephemeral per-benchmark state on one executor node.
struct LocalBenchmark {
    definition: BenchmarkDefinition,
    phase: Mutex<LocalPhase>,
    pause: PauseGate,
    abort: AbortFlag,
    sink: Arc<NodeResultSink>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// The executor-side service, one per benchmark-capable node.
pub struct ExecutorService {
    store: Arc<dyn ClusterStateStore>,
    transport: Arc<dyn BenchTransport>,
    backend: Arc<dyn SearchBackend>,
    active: Mutex<HashMap<String, Arc<LocalBenchmark>>>,
}

impl ExecutorService {
    pub fn new(
        store: Arc<dyn ClusterStateStore>,
        transport: Arc<dyn BenchTransport>,
        backend: Arc<dyn SearchBackend>,
    ) -> Self {
        Self {
            store,
            transport,
            backend,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to cluster-state changes and dispatch them serially.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let service = self.clone();
        let mut changes = service.store.subscribe();
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                service.on_meta_change(change).await;
            }
        })
    }

    fn node_id(&self) -> NodeId {
        self.transport.local_node_id()
    }

    async fn on_meta_change(&self, change: MetaChange) {
        self.release_deleted(&change);

        let node_id = self.node_id();
        for entry in change.current.entries.values() {
            if entry.node_state_map.contains_key(&node_id) {
                self.dispatch_entry(entry).await;
            }
        }
    }

    /// Drop local state for benchmarks whose entry disappeared. The entry
    /// is deleted once the client has been answered; whatever is still
    /// running locally is released on this path.
    fn release_deleted(&self, change: &MetaChange) {
        let gone: Vec<(String, Arc<LocalBenchmark>)> = {
            let mut active = self.active.lock().unwrap();
            let ids: Vec<String> = active
                .keys()
                .filter(|id| !change.current.entries.contains_key(*id))
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| active.remove(&id).map(|local| (id, local)))
                .collect()
        };
        for (benchmark_id, local) in gone {
            tracing::debug!(benchmark = %benchmark_id, "entry removed, releasing local state");
            local.abort.set();
            // Unblock a paused worker so it can observe the abort and exit.
            local.pause.resume();
            // The entry is gone; nothing the worker could still write
            // survives, so it does not get to linger either.
            if let Some(worker) = local.worker.lock().unwrap().take() {
                worker.abort();
            }
        }
    }

    async fn dispatch_entry(&self, entry: &BenchmarkEntry) {
        let node_id = self.node_id();
        let benchmark_id = entry.benchmark_id.as_str();
        let local = self.active.lock().unwrap().get(benchmark_id).cloned();
        let my_state = entry.node_state(node_id);

        match entry.state {
            BenchmarkState::Initializing => {
                if local.is_none() && my_state == Some(NodeBenchState::Initializing) {
                    self.initialize(benchmark_id).await;
                }
            }
            BenchmarkState::Running => {
                if let Some(local) = &local {
                    self.start_worker(benchmark_id, local);
                }
            }
            BenchmarkState::Paused => {
                if let Some(local) = &local {
                    local.pause.pause();
                }
                if my_state == Some(NodeBenchState::Running) {
                    self.write_node_state(benchmark_id, NodeBenchState::Paused)
                        .await;
                }
            }
            BenchmarkState::Resuming => {
                if let Some(local) = &local {
                    local.pause.resume();
                }
                if my_state == Some(NodeBenchState::Paused) {
                    self.write_node_state(benchmark_id, NodeBenchState::Running)
                        .await;
                }
            }
            BenchmarkState::Aborted => {
                if let Some(local) = &local {
                    local.abort.set();
                    // Unblock a paused worker; it drops at the checkpoint.
                    local.pause.resume();
                }
                // The abort is echoed right away; a still-blocked worker
                // only ever re-writes the same state later. FAILED stays.
                if my_state != Some(NodeBenchState::Failed) && my_state.is_some() {
                    self.write_node_state(benchmark_id, NodeBenchState::Aborted)
                        .await;
                }
            }
            BenchmarkState::Completed | BenchmarkState::Failed => {}
        }
    }

    /// First sight of an assigned benchmark: fetch the definition from the
    /// master and report READY, or FAILED when the fetch cannot succeed.
    async fn initialize(&self, benchmark_id: &str) {
        let node_id = self.node_id();
        let request = DefinitionRequest {
            benchmark_id: benchmark_id.to_string(),
            node_id,
        };

        match self.fetch_definition(request).await {
            Ok(definition) => {
                let local = Arc::new(LocalBenchmark {
                    definition,
                    phase: Mutex::new(LocalPhase::Ready),
                    pause: PauseGate::new(),
                    abort: AbortFlag::new(),
                    sink: Arc::new(NodeResultSink::new(node_id)),
                    worker: Mutex::new(None),
                });
                self.active
                    .lock()
                    .unwrap()
                    .insert(benchmark_id.to_string(), local);
                self.write_node_state(benchmark_id, NodeBenchState::Ready)
                    .await;
            }
            Err(TransportError::UnknownBenchmark(_)) => {
                tracing::warn!(benchmark = %benchmark_id, "master has no definition, failing locally");
                self.write_node_state(benchmark_id, NodeBenchState::Failed)
                    .await;
            }
            Err(err) => {
                tracing::warn!(benchmark = %benchmark_id, error = %err, "definition fetch failed");
                self.write_node_state(benchmark_id, NodeBenchState::Failed)
                    .await;
            }
        }
    }

    /// Definition fetch with a single retry against the master. An unknown
    /// benchmark is final and not retried.
    async fn fetch_definition(
        &self,
        request: DefinitionRequest,
    ) -> Result<BenchmarkDefinition, TransportError> {
        match self.transport.fetch_definition(request.clone()).await {
            Err(err @ (TransportError::UnknownBenchmark(_) | TransportError::Canceled)) => Err(err),
            Err(err) => {
                tracing::debug!(benchmark = %request.benchmark_id, error = %err, "retrying definition fetch");
                self.transport.fetch_definition(request).await
            }
            ok => ok,
        }
    }

    fn start_worker(&self, benchmark_id: &str, local: &Arc<LocalBenchmark>) {
        {
            let mut phase = local.phase.lock().unwrap();
            if *phase != LocalPhase::Ready {
                return;
            }
            *phase = LocalPhase::Running;
        }

        tracing::info!(benchmark = %benchmark_id, node = self.node_id(), "starting benchmark worker");
        let store = self.store.clone();
        let backend = self.backend.clone();
        let node_id = self.node_id();
        let benchmark_id_owned = benchmark_id.to_string();
        let local_owned = local.clone();
        let task = tokio::spawn(async move {
            run_worker(store, backend, node_id, benchmark_id_owned, local_owned).await
        });
        *local.worker.lock().unwrap() = Some(task);
    }

    async fn write_node_state(&self, benchmark_id: &str, state: NodeBenchState) {
        if let Err(err) =
            write_node_state(self.store.as_ref(), benchmark_id, self.node_id(), state).await
        {
            tracing::warn!(benchmark = %benchmark_id, state = ?state, error = ?err, "node state write failed");
        }
    }
}

/// Flip this node's state in the entry, skipping the commit entirely when
/// the stored value already matches. Nodes never add themselves to an
/// assignment, and a deleted entry is left deleted.
async fn write_node_state(
    store: &dyn ClusterStateStore,
    benchmark_id: &str,
    node_id: NodeId,
    state: NodeBenchState,
) -> anyhow::Result<()> {
    update_meta(store, &|meta| {
        let Some(entry) = meta.entries.get_mut(benchmark_id) else {
            return Ok(false);
        };
        match entry.node_state_map.get(&node_id) {
            Some(current) if *current == state => Ok(false),
            Some(_) => {
                entry.node_state_map.insert(node_id, state);
                Ok(true)
            }
            None => Ok(false),
        }
    })
    .await
    .map(|_| ())
}

/// Worker task: one per RUNNING benchmark on this node. Pulls competitions
/// in definition order and reports the final node state on every exit path.
async fn run_worker(
    store: Arc<dyn ClusterStateStore>,
    backend: Arc<dyn SearchBackend>,
    node_id: NodeId,
    benchmark_id: String,
    local: Arc<LocalBenchmark>,
) {
    let runner = CompetitionRunner::new(backend);
    let mut fatal = false;

    for competition in &local.definition.competitions {
        if local.abort.is_set() {
            break;
        }
        let settings = competition.effective_settings(&local.definition.settings);
        match runner
            .run(
                competition,
                &settings,
                &local.pause,
                &local.abort,
                &local.sink,
            )
            .await
        {
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(
                    benchmark = %benchmark_id,
                    competition = %competition.name,
                    error = %err,
                    "competition failed on this node"
                );
                local.sink.record_error(&competition.name, err.to_string());
                fatal = true;
                break;
            }
        }
    }

    let final_state = if fatal {
        NodeBenchState::Failed
    } else if local.abort.is_set() {
        NodeBenchState::Aborted
    } else {
        NodeBenchState::Completed
    };
    *local.phase.lock().unwrap() = LocalPhase::Finished;

    tracing::info!(benchmark = %benchmark_id, node = node_id, state = ?final_state, "benchmark worker finished");
    if let Err(err) = write_node_state(store.as_ref(), &benchmark_id, node_id, final_state).await {
        tracing::warn!(benchmark = %benchmark_id, error = ?err, "failed to report final node state");
    }
}

#[async_trait]
impl ExecutorHandler for ExecutorService {
    async fn fetch_results(
        &self,
        request: NodeResultsRequest,
    ) -> Result<NodeResults, TransportError> {
        let local = self
            .active
            .lock()
            .unwrap()
            .get(&request.benchmark_id)
            .cloned();
        match local {
            Some(local) => Ok(NodeResults {
                node_id: self.node_id(),
                results: local.sink.snapshot(),
            }),
            None => Err(TransportError::UnknownBenchmark(request.benchmark_id)),
        }
    }

    async fn abort_local(&self, benchmark_id: &str) -> Result<(), TransportError> {
        let local = self.active.lock().unwrap().get(benchmark_id).cloned();
        if let Some(local) = local {
            local.abort.set();
            local.pause.resume();
        }
        Ok(())
    }
}
