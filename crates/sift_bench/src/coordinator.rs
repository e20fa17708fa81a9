//! Master-side benchmark coordination.
//!
//! The coordinator owns the entries in the replicated document. It accepts
//! client operations, assigns executor nodes, and advances the global phase
//! machine from the cluster-state change stream: quorum conditions over the
//! per-node states gate each transition, and per-benchmark CAS flags make
//! sure every transition handler runs at most once no matter how often the
//! triggering state is re-observed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{BenchError, TransportError};
use crate::liveness::LivenessTracker;
use crate::meta::{BenchmarkEntry, BenchmarkMetaData, BenchmarkState, NodeBenchState, NodeId};
use crate::model::{matches_any, BenchmarkDefinition};
use crate::results::{
    merge_competition, BenchmarkStartResponse, CompetitionNodeResult, ControlResponse,
};
use crate::store::{update_meta, ClusterStateStore, MetaChange};
use crate::transport::{
    BenchTransport, DefinitionHandler, DefinitionRequest, NodeResults, NodeResultsRequest,
};

/// Handle to a submitted benchmark: resolves once the benchmark reaches a
/// terminal state and the merged response is ready.
pub struct PendingBenchmark {
    pub benchmark_id: String,
    receiver: oneshot::Receiver<Result<BenchmarkStartResponse, BenchError>>,
}

impl PendingBenchmark {
    pub async fn wait(self) -> Result<BenchmarkStartResponse, BenchError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(BenchError::Internal(anyhow::anyhow!(
                "coordinator dropped benchmark [{}] before responding",
                self.benchmark_id
            ))),
        }
    }

    /// Like [`Self::wait`], with a client-side deadline. Timing out does
    /// not cancel the benchmark.
    pub async fn wait_for(self, deadline: Duration) -> Result<BenchmarkStartResponse, BenchError> {
        let benchmark_id = self.benchmark_id.clone();
        match tokio::time::timeout(deadline, self.receiver).await {
            Err(_) => Err(BenchError::Timeout(deadline)),
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BenchError::Internal(anyhow::anyhow!(
                "coordinator dropped benchmark [{benchmark_id}] before responding"
            ))),
        }
    }
}

/// Count-down shared by every benchmark matched by one pause/resume/abort
/// call; the last benchmark to echo fires the single client response.
struct ControlWaiter {
    remaining: AtomicUsize,
    response: Mutex<ControlResponse>,
    sender: Mutex<Option<oneshot::Sender<ControlResponse>>>,
}

impl ControlWaiter {
    fn new(count: usize) -> (Arc<Self>, oneshot::Receiver<ControlResponse>) {
        let (sender, receiver) = oneshot::channel();
        (
            Arc::new(Self {
                remaining: AtomicUsize::new(count),
                response: Mutex::new(ControlResponse::default()),
                sender: Mutex::new(Some(sender)),
            }),
            receiver,
        )
    }

    fn signal(&self, benchmark_id: &str, nodes: &BTreeMap<NodeId, NodeBenchState>) {
        {
            let mut response = self.response.lock().unwrap();
            for (node, state) in nodes {
                response.record(benchmark_id, *node, *state);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(sender) = self.sender.lock().unwrap().take() {
                let response = self.response.lock().unwrap().clone();
                let _ = sender.send(response);
            }
        }
    }
}

/// In-memory coordinator state for one active benchmark.
struct InternalCoordinatorState {
    benchmark_id: String,
    definition: BenchmarkDefinition,
    running: AtomicBool,
    paused: AtomicBool,
    aborted: AtomicBool,
    complete: AtomicBool,
    response: Mutex<Option<BenchmarkStartResponse>>,
    listener: Mutex<Option<oneshot::Sender<Result<BenchmarkStartResponse, BenchError>>>>,
    pause_waiter: Mutex<Option<Arc<ControlWaiter>>>,
    resume_waiter: Mutex<Option<Arc<ControlWaiter>>>,
    abort_waiter: Mutex<Option<Arc<ControlWaiter>>>,
}

impl InternalCoordinatorState {
    fn new(
        definition: BenchmarkDefinition,
        listener: oneshot::Sender<Result<BenchmarkStartResponse, BenchError>>,
    ) -> Self {
        Self {
            benchmark_id: definition.benchmark_id.clone(),
            definition,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            response: Mutex::new(None),
            listener: Mutex::new(Some(listener)),
            pause_waiter: Mutex::new(None),
            resume_waiter: Mutex::new(None),
            abort_waiter: Mutex::new(None),
        }
    }

    fn can_start_running(&self) -> bool {
        self.flip(&self.running, false)
    }

    fn can_stop_running(&self) -> bool {
        self.flip(&self.running, true)
    }

    fn can_pause(&self) -> bool {
        self.flip(&self.paused, false)
    }

    fn can_resume(&self) -> bool {
        self.flip(&self.paused, true)
    }

    fn can_abort(&self) -> bool {
        self.flip(&self.aborted, false)
    }

    fn can_complete(&self) -> bool {
        self.flip(&self.complete, false)
    }

    fn flip(&self, flag: &AtomicBool, from: bool) -> bool {
        flag.compare_exchange(from, !from, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn respond(&self, result: Result<BenchmarkStartResponse, BenchError>) {
        match self.listener.lock().unwrap().take() {
            Some(listener) => {
                let _ = listener.send(result);
            }
            None => {
                tracing::warn!(benchmark = %self.benchmark_id, "attempted redundant response");
            }
        }
    }
}

/// Pause/resume/abort share one code path; only the written state and the
/// eligibility rule differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlAction {
    Pause,
    Resume,
    Abort,
}

impl ControlAction {
    fn eligible(self, state: BenchmarkState) -> bool {
        match self {
            Self::Pause => matches!(state, BenchmarkState::Running | BenchmarkState::Resuming),
            Self::Resume => state == BenchmarkState::Paused,
            Self::Abort => !state.is_terminal(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Abort => "abort",
        }
    }
}

/// The master-side service. All public operations refuse off-master.
pub struct CoordinatorService {
    store: Arc<dyn ClusterStateStore>,
    transport: Arc<dyn BenchTransport>,
    liveness: Arc<LivenessTracker>,
    benchmarks: Mutex<HashMap<String, Arc<InternalCoordinatorState>>>,
}

impl CoordinatorService {
    pub fn new(
        store: Arc<dyn ClusterStateStore>,
        transport: Arc<dyn BenchTransport>,
        liveness: Arc<LivenessTracker>,
    ) -> Self {
        Self {
            store,
            transport,
            liveness,
            benchmarks: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to cluster-state changes and node removals; both streams
    /// are dispatched serially on one task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let service = self.clone();
        let mut changes = service.store.subscribe();
        let mut removals = service.transport.subscribe_removals();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    removed = removals.recv() => match removed {
                        Some(node) => service.on_node_removed(node).await,
                        None => break,
                    },
                    change = changes.recv() => match change {
                        Some(change) => service.on_meta_change(change).await,
                        None => break,
                    },
                }
            }
        })
    }

    /* ** Public API ** */

    /// Select executors, create the `INITIALIZING` entry, and return a
    /// handle that resolves with the merged result.
    pub async fn start_benchmark(
        &self,
        definition: BenchmarkDefinition,
    ) -> Result<PendingBenchmark, BenchError> {
        if !self.transport.is_master() {
            return Err(BenchError::NotMaster);
        }
        definition.validate()?;

        let required = definition.num_executor_nodes;
        let mut executors = self.transport.executor_nodes();
        executors.sort_unstable();
        if executors.len() < required {
            return Err(BenchError::InsufficientExecutors {
                required,
                available: executors.len(),
            });
        }
        let chosen: Vec<NodeId> = executors.into_iter().take(required).collect();
        let benchmark_id = definition.benchmark_id.clone();

        let snapshot = self.store.read().await;
        if snapshot.meta.entry(&benchmark_id).is_some() {
            return Err(BenchError::AlreadyExists(benchmark_id));
        }

        let (sender, receiver) = oneshot::channel();
        let ics = Arc::new(InternalCoordinatorState::new(definition, sender));
        {
            let mut benchmarks = self.benchmarks.lock().unwrap();
            if benchmarks.contains_key(&benchmark_id) {
                return Err(BenchError::AlreadyExists(benchmark_id));
            }
            benchmarks.insert(benchmark_id.clone(), ics);
        }
        self.liveness.register(&benchmark_id, &chosen);

        // Internal state is registered before the entry becomes visible, so
        // the event loop never mistakes our own entry for an orphan.
        let inserted = update_meta(self.store.as_ref(), &|meta| {
            if meta.entries.contains_key(&benchmark_id) {
                anyhow::bail!("benchmark [{benchmark_id}] already exists");
            }
            meta.entries.insert(
                benchmark_id.clone(),
                BenchmarkEntry::new(benchmark_id.clone(), &chosen),
            );
            Ok(true)
        })
        .await;

        if let Err(err) = inserted {
            self.benchmarks.lock().unwrap().remove(&benchmark_id);
            self.liveness.forget(&benchmark_id);
            return Err(BenchError::Internal(err));
        }

        tracing::info!(benchmark = %benchmark_id, nodes = ?chosen, "benchmark submitted");
        Ok(PendingBenchmark {
            benchmark_id,
            receiver,
        })
    }

    /// Status of every active benchmark matching `patterns`, with current
    /// partial results. An empty pattern list matches everything.
    pub async fn list_benchmarks(
        &self,
        patterns: &[String],
    ) -> Result<Vec<BenchmarkStartResponse>, BenchError> {
        if !self.transport.is_master() {
            return Err(BenchError::NotMaster);
        }

        let snapshot = self.store.read().await;
        let mut responses = Vec::new();
        for entry in snapshot.meta.entries.values() {
            if !matches_any(patterns, &entry.benchmark_id) {
                continue;
            }
            let ics = self
                .benchmarks
                .lock()
                .unwrap()
                .get(&entry.benchmark_id)
                .cloned();
            // Entries without internal state are orphans; the event loop
            // removes them.
            let Some(ics) = ics else { continue };
            responses.push(self.collect_results(&ics, entry, entry.state).await);
        }
        Ok(responses)
    }

    pub async fn pause_benchmark(
        &self,
        patterns: &[String],
        deadline: Option<Duration>,
    ) -> Result<ControlResponse, BenchError> {
        self.control_benchmarks(ControlAction::Pause, patterns, deadline)
            .await
    }

    pub async fn resume_benchmark(
        &self,
        patterns: &[String],
        deadline: Option<Duration>,
    ) -> Result<ControlResponse, BenchError> {
        self.control_benchmarks(ControlAction::Resume, patterns, deadline)
            .await
    }

    pub async fn abort_benchmark(
        &self,
        patterns: &[String],
        deadline: Option<Duration>,
    ) -> Result<ControlResponse, BenchError> {
        self.control_benchmarks(ControlAction::Abort, patterns, deadline)
            .await
    }

    async fn control_benchmarks(
        &self,
        action: ControlAction,
        patterns: &[String],
        deadline: Option<Duration>,
    ) -> Result<ControlResponse, BenchError> {
        if !self.transport.is_master() {
            return Err(BenchError::NotMaster);
        }

        let snapshot = self.store.read().await;
        let matched: Vec<String> = snapshot
            .meta
            .entries
            .values()
            .filter(|entry| {
                matches_any(patterns, &entry.benchmark_id) && action.eligible(entry.state)
            })
            .map(|entry| entry.benchmark_id.clone())
            .collect();
        if matched.is_empty() {
            return Err(BenchError::UnknownBenchmark(patterns.join(",")));
        }

        // Register the waiter before the state write so the echo cannot be
        // observed before anyone is listening for it.
        let (waiter, receiver) = ControlWaiter::new(matched.len());
        {
            let benchmarks = self.benchmarks.lock().unwrap();
            for benchmark_id in &matched {
                let Some(ics) = benchmarks.get(benchmark_id) else {
                    return Err(BenchError::Internal(anyhow::anyhow!(
                        "benchmark [{benchmark_id}] missing internal state"
                    )));
                };
                let slot = match action {
                    ControlAction::Pause => &ics.pause_waiter,
                    ControlAction::Resume => &ics.resume_waiter,
                    ControlAction::Abort => &ics.abort_waiter,
                };
                *slot.lock().unwrap() = Some(waiter.clone());
            }
        }

        tracing::info!(action = action.name(), benchmarks = ?matched, "benchmark control request");
        self.apply_control(action, &matched)
            .await
            .map_err(BenchError::Internal)?;

        if action == ControlAction::Abort {
            for benchmark_id in &matched {
                self.nudge_abort(benchmark_id).await;
            }
        }

        let echoed = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, receiver).await {
                Err(_) => return Err(BenchError::Timeout(deadline)),
                Ok(result) => result,
            },
            None => receiver.await,
        };
        echoed.map_err(|_| {
            BenchError::Internal(anyhow::anyhow!(
                "benchmark state dropped before the {} was acknowledged",
                action.name()
            ))
        })
    }

    /// Write the control action into the document for every matched entry.
    async fn apply_control(&self, action: ControlAction, matched: &[String]) -> anyhow::Result<()> {
        let liveness = &self.liveness;
        update_meta(self.store.as_ref(), &|meta| {
            let mut changed = false;
            for benchmark_id in matched {
                let Some(entry) = meta.entries.get_mut(benchmark_id) else {
                    continue;
                };
                match action {
                    // Pause writes both the global state and the per-node
                    // states of nodes still running; the response resolves
                    // on the next observed quorum.
                    ControlAction::Pause => {
                        changed |= entry.state != BenchmarkState::Paused;
                        entry.state = BenchmarkState::Paused;
                        let nodes: Vec<NodeId> = entry.node_state_map.keys().copied().collect();
                        for node in nodes {
                            if liveness.is_alive(benchmark_id, node)
                                && entry.node_state(node) == Some(NodeBenchState::Running)
                            {
                                entry.node_state_map.insert(node, NodeBenchState::Paused);
                                changed = true;
                            }
                        }
                    }
                    // Resume and abort only flip the global state; the
                    // executors echo through their own node states.
                    ControlAction::Resume => {
                        changed |= entry.state != BenchmarkState::Resuming;
                        entry.state = BenchmarkState::Resuming;
                    }
                    ControlAction::Abort => {
                        changed |= entry.state != BenchmarkState::Aborted;
                        entry.state = BenchmarkState::Aborted;
                    }
                }
            }
            Ok(changed)
        })
        .await
        .map(|_| ())
    }

    /// Best-effort abort nudge; the document carries the authoritative
    /// abort, so failures here are only logged.
    async fn nudge_abort(&self, benchmark_id: &str) {
        let snapshot = self.store.read().await;
        let Some(entry) = snapshot.meta.entry(benchmark_id) else {
            return;
        };
        for node in entry.node_state_map.keys().copied() {
            if !self.liveness.is_alive(benchmark_id, node) {
                continue;
            }
            if let Err(err) = self.transport.abort_local(node, benchmark_id).await {
                tracing::debug!(benchmark = %benchmark_id, node, error = %err, "abort nudge failed");
            }
        }
    }

    /* ** Event handling ** */

    async fn on_node_removed(&self, node: NodeId) {
        for benchmark_id in self.liveness.mark_removed(node) {
            tracing::warn!(benchmark = %benchmark_id, node, "marked executor node as not live");
        }
        if !self.transport.is_master() {
            return;
        }
        // A death can complete a quorum without any further document
        // change; re-evaluate every entry against the current snapshot.
        let snapshot = self.store.read().await;
        for entry in snapshot.meta.entries.values() {
            self.dispatch_entry(entry).await;
        }
    }

    async fn on_meta_change(&self, change: MetaChange) {
        if !self.transport.is_master() {
            self.fail_pending_on_master_loss();
            return;
        }
        for entry in BenchmarkMetaData::delta(&change.previous, &change.current) {
            tracing::info!(
                benchmark = %entry.benchmark_id,
                state = ?entry.state,
                nodes = ?entry.node_state_map,
                "benchmark state change"
            );
            self.dispatch_entry(entry).await;
        }
    }

    /// The in-memory listeners die with mastership; clients learn they must
    /// poll the new master.
    fn fail_pending_on_master_loss(&self) {
        let pending: Vec<Arc<InternalCoordinatorState>> = {
            let mut benchmarks = self.benchmarks.lock().unwrap();
            benchmarks.drain().map(|(_, ics)| ics).collect()
        };
        for ics in pending {
            tracing::warn!(benchmark = %ics.benchmark_id, "lost mastership with benchmark in flight");
            self.liveness.forget(&ics.benchmark_id);
            ics.respond(Err(BenchError::MasterLost(ics.benchmark_id.clone())));
        }
    }

    async fn dispatch_entry(&self, entry: &BenchmarkEntry) {
        let benchmark_id = entry.benchmark_id.as_str();
        let ics = self.benchmarks.lock().unwrap().get(benchmark_id).cloned();
        let Some(ics) = ics else {
            self.delete_orphan(benchmark_id).await;
            return;
        };
        let alive = |node: NodeId| self.liveness.is_alive(benchmark_id, node);

        if entry.all_failed_or_dead(&alive) {
            self.on_failed(&ics, anyhow::anyhow!("all nodes failed")).await;
            return;
        }

        match entry.state {
            BenchmarkState::Initializing => {
                if entry.all_alive_in_state(NodeBenchState::Ready, &alive)
                    && ics.can_start_running()
                {
                    self.on_ready(&ics).await;
                }
            }
            BenchmarkState::Running => {
                if entry.all_alive_finished(&alive) && ics.can_stop_running() {
                    self.on_finished(&ics, entry, BenchmarkState::Completed).await;
                }
            }
            BenchmarkState::Resuming => {
                if entry.all_alive_unfinished_in_state(NodeBenchState::Running, &alive)
                    && ics.can_resume()
                {
                    self.on_resumed(&ics, entry).await;
                }
            }
            BenchmarkState::Paused => {
                if entry.all_alive_unfinished_in_state(NodeBenchState::Paused, &alive)
                    && ics.can_pause()
                {
                    if let Some(waiter) = ics.pause_waiter.lock().unwrap().take() {
                        waiter.signal(benchmark_id, &entry.node_state_map);
                    }
                }
            }
            BenchmarkState::Completed => {
                if ics.can_complete() {
                    self.on_complete(&ics).await;
                }
            }
            BenchmarkState::Failed => {
                self.on_failed(&ics, anyhow::anyhow!("benchmark [{benchmark_id}] failed"))
                    .await;
            }
            BenchmarkState::Aborted => {
                if entry.all_alive_in_state(NodeBenchState::Aborted, &alive) && ics.can_abort() {
                    if let Some(waiter) = ics.abort_waiter.lock().unwrap().take() {
                        waiter.signal(benchmark_id, &entry.node_state_map);
                    }
                    // Collect whatever the nodes finished before the abort
                    // checkpoint, then complete toward the client.
                    self.on_finished(&ics, entry, BenchmarkState::Aborted).await;
                }
            }
        }
    }

    async fn delete_orphan(&self, benchmark_id: &str) {
        tracing::warn!(benchmark = %benchmark_id, "unknown benchmark in cluster metadata, removing");
        if let Err(err) = update_meta(self.store.as_ref(), &|meta| {
            Ok(meta.entries.remove(benchmark_id).is_some())
        })
        .await
        {
            tracing::error!(benchmark = %benchmark_id, error = ?err, "failed to remove unknown benchmark");
        }
    }

    /* ** Transition handlers ** */

    /// Every executor reported READY: release the run.
    async fn on_ready(&self, ics: &Arc<InternalCoordinatorState>) {
        tracing::info!(benchmark = %ics.benchmark_id, "all executors ready, starting run");
        if let Err(err) = self
            .set_states(
                &ics.benchmark_id,
                BenchmarkState::Running,
                NodeBenchState::Running,
                &[NodeBenchState::Ready],
            )
            .await
        {
            self.on_failed(ics, err).await;
        }
    }

    /// Every live executor finished: fetch and merge the per-node results.
    /// For a completed run the document advances to COMPLETED; an aborted
    /// run is already terminal and goes straight to deletion.
    async fn on_finished(
        &self,
        ics: &Arc<InternalCoordinatorState>,
        entry: &BenchmarkEntry,
        final_state: BenchmarkState,
    ) {
        let response = self.collect_results(ics, entry, final_state).await;
        *ics.response.lock().unwrap() = Some(response);

        if final_state == BenchmarkState::Aborted {
            if ics.can_complete() {
                self.on_complete(ics).await;
            }
            return;
        }

        if let Err(err) = self
            .set_states(
                &ics.benchmark_id,
                BenchmarkState::Completed,
                NodeBenchState::Completed,
                &[NodeBenchState::Running, NodeBenchState::Paused],
            )
            .await
        {
            self.on_failed(ics, err).await;
        }
    }

    /// Every unfinished executor echoed RUNNING again: leave RESUMING.
    async fn on_resumed(&self, ics: &Arc<InternalCoordinatorState>, entry: &BenchmarkEntry) {
        if let Some(waiter) = ics.resume_waiter.lock().unwrap().take() {
            waiter.signal(&ics.benchmark_id, &entry.node_state_map);
        }
        if let Err(err) = self
            .set_states(
                &ics.benchmark_id,
                BenchmarkState::Running,
                NodeBenchState::Running,
                &[NodeBenchState::Paused],
            )
            .await
        {
            self.on_failed(ics, err).await;
        }
    }

    /// Terminal bookkeeping: delete the entry, drop the in-memory state and
    /// deliver the cached response.
    async fn on_complete(&self, ics: &Arc<InternalCoordinatorState>) {
        let benchmark_id = ics.benchmark_id.clone();
        self.remove_entry(&benchmark_id).await;
        self.benchmarks.lock().unwrap().remove(&benchmark_id);
        self.liveness.forget(&benchmark_id);

        let response = ics.response.lock().unwrap().take();
        match response {
            Some(response) => ics.respond(Ok(response)),
            None => ics.respond(Err(BenchError::Internal(anyhow::anyhow!(
                "benchmark [{benchmark_id}] finished without a response"
            )))),
        }
    }

    async fn on_failed(&self, ics: &Arc<InternalCoordinatorState>, cause: anyhow::Error) {
        if !ics.can_complete() {
            return;
        }
        tracing::error!(benchmark = %ics.benchmark_id, error = ?cause, "benchmark failed");
        self.remove_entry(&ics.benchmark_id).await;
        self.benchmarks.lock().unwrap().remove(&ics.benchmark_id);
        self.liveness.forget(&ics.benchmark_id);

        let mut response = ics.response.lock().unwrap().take().unwrap_or_else(|| {
            BenchmarkStartResponse::new(ics.benchmark_id.clone(), BenchmarkState::Failed)
        });
        response.state = BenchmarkState::Failed;
        response.errors.push(cause.to_string());
        ics.respond(Ok(response));
    }

    /* ** Store helpers ** */

    /// Advance the global state and flip live nodes currently in one of
    /// `from_states`. Finished and failed node states are never rewritten.
    async fn set_states(
        &self,
        benchmark_id: &str,
        state: BenchmarkState,
        node_state: NodeBenchState,
        from_states: &[NodeBenchState],
    ) -> anyhow::Result<()> {
        let liveness = &self.liveness;
        update_meta(self.store.as_ref(), &|meta| {
            let Some(entry) = meta.entries.get_mut(benchmark_id) else {
                anyhow::bail!("benchmark [{benchmark_id}] missing from cluster metadata");
            };
            let mut changed = entry.state != state;
            entry.state = state;
            let nodes: Vec<NodeId> = entry.node_state_map.keys().copied().collect();
            for node in nodes {
                let current = entry.node_state(node);
                if liveness.is_alive(benchmark_id, node)
                    && current.map_or(false, |c| from_states.contains(&c))
                {
                    entry.node_state_map.insert(node, node_state);
                    changed = true;
                }
            }
            Ok(changed)
        })
        .await
        .map(|_| ())
    }

    async fn remove_entry(&self, benchmark_id: &str) {
        if let Err(err) = update_meta(self.store.as_ref(), &|meta| {
            Ok(meta.entries.remove(benchmark_id).is_some())
        })
        .await
        {
            tracing::error!(benchmark = %benchmark_id, error = ?err, "failed to remove benchmark entry");
        }
    }

    /* ** Result collection ** */

    /// Fetch per-node results from every live, non-failed assigned node and
    /// merge them per competition. Nodes that became unreachable are
    /// dropped from the merge and noted in the response errors.
    async fn collect_results(
        &self,
        ics: &Arc<InternalCoordinatorState>,
        entry: &BenchmarkEntry,
        response_state: BenchmarkState,
    ) -> BenchmarkStartResponse {
        let benchmark_id = ics.benchmark_id.as_str();
        let mut response = BenchmarkStartResponse::new(benchmark_id, response_state);
        let mut by_competition: BTreeMap<String, Vec<CompetitionNodeResult>> = BTreeMap::new();

        for (&node, &state) in &entry.node_state_map {
            if state == NodeBenchState::Failed || !self.liveness.is_alive(benchmark_id, node) {
                continue;
            }
            match self.fetch_results(node, benchmark_id).await {
                Ok(results) => {
                    for result in results.results {
                        response.errors.extend(result.errors.iter().cloned());
                        by_competition
                            .entry(result.competition_name.clone())
                            .or_default()
                            .push(result);
                    }
                }
                // A node with no state for this benchmark has nothing to
                // contribute (yet); only real transport failures are noted.
                Err(TransportError::UnknownBenchmark(_)) => {
                    tracing::debug!(benchmark = %benchmark_id, node, "node has no results yet");
                }
                Err(err) => {
                    tracing::warn!(
                        benchmark = %benchmark_id,
                        node,
                        error = %err,
                        "dropping results from unreachable node"
                    );
                    response.errors.push(format!("node {node}: {err}"));
                }
            }
        }

        for competition in &ics.definition.competitions {
            let node_results = by_competition.remove(&competition.name).unwrap_or_default();
            let settings = competition.effective_settings(&ics.definition.settings);
            response.competition_results.insert(
                competition.name.clone(),
                merge_competition(
                    &competition.name,
                    settings.concurrency,
                    settings.multiplier,
                    &competition.effective_percentiles(),
                    node_results,
                ),
            );
        }
        response
    }

    /// Result fetch with a single retry; an unknown benchmark on the node
    /// is final.
    async fn fetch_results(
        &self,
        node: NodeId,
        benchmark_id: &str,
    ) -> Result<NodeResults, TransportError> {
        let request = NodeResultsRequest {
            benchmark_id: benchmark_id.to_string(),
            node_id: node,
        };
        match self.transport.fetch_results(node, request.clone()).await {
            Err(err @ (TransportError::UnknownBenchmark(_) | TransportError::Canceled)) => Err(err),
            Err(err) => {
                tracing::debug!(node, error = %err, "retrying result fetch");
                self.transport.fetch_results(node, request).await
            }
            ok => ok,
        }
    }
}

/// The master answers executors' definition requests from its in-memory
/// map; an id it does not know is reported as such so the executor can
/// fail fast.
#[async_trait]
impl DefinitionHandler for CoordinatorService {
    async fn fetch_definition(
        &self,
        request: DefinitionRequest,
    ) -> Result<BenchmarkDefinition, TransportError> {
        let ics = self
            .benchmarks
            .lock()
            .unwrap()
            .get(&request.benchmark_id)
            .cloned();
        match ics {
            Some(ics) => Ok(ics.definition.clone()),
            None => Err(TransportError::UnknownBenchmark(request.benchmark_id)),
        }
    }
}
