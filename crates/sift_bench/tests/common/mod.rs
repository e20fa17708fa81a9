//! Shared helpers for in-process cluster tests.
//!
//! A test cluster wires one coordinator (node 1, master, not
//! benchmark-capable) and N executor nodes over a shared in-memory state
//! store and transport hub. Each executor gets its own gated search
//! backend, so tests control exactly how many queries every node may
//! execute before blocking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use sift_bench::{
    BenchmarkDefinition, BenchmarkMetaData, BenchmarkSettings, BenchmarkState, ClusterStateStore,
    Competition, CoordinatorService, ExecutorService, LivenessTracker, MemCluster, MemStateStore,
    NodeId, SearchBackend, SearchError, SearchOutcome, SearchRequest, FATAL_QUERY_MARKER,
    QUERY_ERROR_MARKER,
};

pub const MASTER_NODE: NodeId = 1;
pub const FIRST_EXECUTOR_NODE: NodeId = 2;
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Search backend whose progress tests can gate: with gating on, every
/// query consumes one semaphore permit before executing.
pub struct ControlledBackend {
    permits: Semaphore,
    gated: AtomicBool,
    executed: AtomicU64,
}

impl ControlledBackend {
    /// Ungated backend; queries execute immediately.
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(0),
            gated: AtomicBool::new(false),
            executed: AtomicU64::new(0),
        })
    }

    /// Gated backend with no permits; every query blocks until allowed.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(0),
            gated: AtomicBool::new(true),
            executed: AtomicU64::new(0),
        })
    }

    /// Let `queries` more queries through.
    pub fn allow(&self, queries: usize) {
        self.permits.add_permits(queries);
    }

    /// Stop gating entirely.
    pub fn release_all(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.permits.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchBackend for ControlledBackend {
    async fn execute(&self, request: &SearchRequest) -> Result<SearchOutcome, SearchError> {
        if request.query.starts_with(FATAL_QUERY_MARKER) {
            return Err(SearchError::Fatal(format!(
                "query does not parse: {}",
                request.query
            )));
        }
        if request.query.starts_with(QUERY_ERROR_MARKER) {
            return Err(SearchError::Query(format!("query failed: {}", request.query)));
        }
        if self.gated.load(Ordering::SeqCst) {
            self.permits
                .acquire()
                .await
                .expect("gate semaphore closed")
                .forget();
        }
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(SearchOutcome { took_ms: 2, hits: 1 })
    }
}

pub struct ExecutorNode {
    pub node_id: NodeId,
    pub service: Arc<ExecutorService>,
    pub backend: Arc<ControlledBackend>,
}

pub struct TestCluster {
    pub cluster: Arc<MemCluster>,
    pub store: Arc<MemStateStore>,
    pub coordinator: Arc<CoordinatorService>,
    pub executors: Vec<ExecutorNode>,
}

/// Stand up a coordinator and `executor_count` executor nodes in-process.
pub async fn start_cluster(executor_count: usize, gated: bool) -> TestCluster {
    let cluster = MemCluster::with_timeout(Duration::from_secs(2));
    let store = Arc::new(MemStateStore::new());
    let liveness = Arc::new(LivenessTracker::new());

    let master_transport = cluster.add_node(MASTER_NODE, false);
    let coordinator = Arc::new(CoordinatorService::new(
        store.clone(),
        master_transport,
        liveness,
    ));
    cluster.register_definition_handler(MASTER_NODE, coordinator.clone());
    coordinator.spawn();

    let mut executors = Vec::with_capacity(executor_count);
    for offset in 0..executor_count {
        let node_id = FIRST_EXECUTOR_NODE + offset as NodeId;
        let transport = cluster.add_node(node_id, true);
        let backend = if gated {
            ControlledBackend::gated()
        } else {
            ControlledBackend::open()
        };
        let service = Arc::new(ExecutorService::new(
            store.clone(),
            transport,
            backend.clone(),
        ));
        cluster.register_executor_handler(node_id, service.clone());
        service.spawn();
        executors.push(ExecutorNode {
            node_id,
            service,
            backend,
        });
    }

    TestCluster {
        cluster,
        store,
        coordinator,
        executors,
    }
}

/// One-competition definition: `iterations` iterations of a single
/// `match_all` request, concurrency and multiplier 1.
pub fn definition(benchmark_id: &str, nodes: usize, iterations: usize) -> BenchmarkDefinition {
    BenchmarkDefinition::new(benchmark_id)
        .with_executors(nodes)
        .with_settings(BenchmarkSettings {
            iterations,
            ..BenchmarkSettings::default()
        })
        .add_competition(Competition::new(
            "c1",
            vec![SearchRequest::new("idx", "match_all")],
        ))
}

/// Poll the store until `predicate` holds for the current document.
pub async fn wait_for_meta<F>(store: &MemStateStore, what: &str, predicate: F)
where
    F: Fn(&BenchmarkMetaData) -> bool,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let snapshot = store.read().await;
        if predicate(&snapshot.meta) {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}; document: {:?}", snapshot.meta);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(store: &MemStateStore, benchmark_id: &str, state: BenchmarkState) {
    wait_for_meta(store, &format!("{benchmark_id} to reach {state:?}"), |meta| {
        meta.entry(benchmark_id).map(|e| e.state) == Some(state)
    })
    .await;
}

pub async fn wait_for_entry_gone(store: &MemStateStore, benchmark_id: &str) {
    wait_for_meta(store, &format!("{benchmark_id} entry to be deleted"), |meta| {
        meta.entry(benchmark_id).is_none()
    })
    .await;
}

/// Wait until a node's backend has executed at least `queries` queries.
pub async fn wait_for_executed(backend: &ControlledBackend, queries: u64) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while backend.executed() < queries {
        if Instant::now() >= deadline {
            panic!(
                "timed out waiting for {queries} executed queries (saw {})",
                backend.executed()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
