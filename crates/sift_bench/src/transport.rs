//! Point-to-point benchmark transport.
//!
//! The engine is transport-agnostic: the coordinator and executors talk
//! through `BenchTransport` and register handler objects for the three
//! benchmark actions. `MemCluster` is the in-process implementation used by
//! the tests and the workload driver; a networked implementation only has
//! to route the same three actions.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time;

use crate::error::TransportError;
use crate::meta::NodeId;
use crate::model::BenchmarkDefinition;
use crate::results::CompetitionNodeResult;

/// Executor asks the master for the benchmark definition.
pub const ACTION_FETCH_DEFINITION: &str = "bench/node/definition";
/// Master asks an executor for its (partial) per-node results.
pub const ACTION_FETCH_RESULTS: &str = "bench/node/status";
/// Master nudges an executor to abort locally. Best effort; the state
/// store carries the authoritative abort.
pub const ACTION_ABORT_LOCAL: &str = "bench/node/abort";

/// Default per-call RPC timeout of the in-memory transport.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DefinitionRequest {
    pub benchmark_id: String,
    pub node_id: NodeId,
}

#[derive(Debug, Clone)]
pub struct NodeResultsRequest {
    pub benchmark_id: String,
    pub node_id: NodeId,
}

/// Per-node results returned by `bench/node/status`.
#[derive(Debug, Clone)]
pub struct NodeResults {
    pub node_id: NodeId,
    pub results: Vec<CompetitionNodeResult>,
}

/// Master-side handler answering definition requests from executors.
#[async_trait]
pub trait DefinitionHandler: Send + Sync + 'static {
    async fn fetch_definition(
        &self,
        request: DefinitionRequest,
    ) -> Result<BenchmarkDefinition, TransportError>;
}

/// Executor-side handlers answering the master's result and abort actions.
#[async_trait]
pub trait ExecutorHandler: Send + Sync + 'static {
    async fn fetch_results(
        &self,
        request: NodeResultsRequest,
    ) -> Result<NodeResults, TransportError>;

    async fn abort_local(&self, benchmark_id: &str) -> Result<(), TransportError>;
}

/// Cluster view plus the typed request channels of the benchmark actions.
#[async_trait]
pub trait BenchTransport: Send + Sync + 'static {
    fn local_node_id(&self) -> NodeId;

    /// Whether this node is the elected master.
    fn is_master(&self) -> bool;

    /// All currently alive nodes.
    fn alive_nodes(&self) -> Vec<NodeId>;

    /// Alive nodes carrying the benchmark-execution capability.
    fn executor_nodes(&self) -> Vec<NodeId>;

    /// Node-removal notifications, one event per removed node.
    fn subscribe_removals(&self) -> mpsc::UnboundedReceiver<NodeId>;

    /// `bench/node/definition`, routed to the elected master.
    async fn fetch_definition(
        &self,
        request: DefinitionRequest,
    ) -> Result<BenchmarkDefinition, TransportError>;

    /// `bench/node/status` against one executor node.
    async fn fetch_results(
        &self,
        target: NodeId,
        request: NodeResultsRequest,
    ) -> Result<NodeResults, TransportError>;

    /// `bench/node/abort` against one executor node.
    async fn abort_local(&self, target: NodeId, benchmark_id: &str) -> Result<(), TransportError>;
}

#[derive(Default)]
struct MemNode {
    bench_capable: bool,
    definition_handler: Option<Arc<dyn DefinitionHandler>>,
    executor_handler: Option<Arc<dyn ExecutorHandler>>,
}

struct HubInner {
    master: Option<NodeId>,
    nodes: BTreeMap<NodeId, MemNode>,
    removal_subs: Vec<mpsc::UnboundedSender<NodeId>>,
}

/// In-process cluster hub: node registry, master election flag and the
/// routing table for the three benchmark actions.
pub struct MemCluster {
    inner: RwLock<HubInner>,
    rpc_timeout: Duration,
}

impl MemCluster {
    pub fn new() -> Arc<Self> {
        Self::with_timeout(DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(rpc_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(HubInner {
                master: None,
                nodes: BTreeMap::new(),
                removal_subs: Vec::new(),
            }),
            rpc_timeout: rpc_timeout.max(Duration::from_millis(1)),
        })
    }

    /// Add a node and return its transport handle. The first node added
    /// becomes master until `set_master` says otherwise.
    pub fn add_node(self: &Arc<Self>, node_id: NodeId, bench_capable: bool) -> Arc<MemTransport> {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.insert(
            node_id,
            MemNode {
                bench_capable,
                ..MemNode::default()
            },
        );
        if inner.master.is_none() {
            inner.master = Some(node_id);
        }
        drop(inner);

        Arc::new(MemTransport {
            hub: self.clone(),
            node_id,
        })
    }

    pub fn set_master(&self, node_id: NodeId) {
        self.inner.write().unwrap().master = Some(node_id);
    }

    /// Drop a node from the cluster and notify removal subscribers. A node
    /// re-added under the same id is a new cluster member; per-benchmark
    /// liveness never resurrects.
    pub fn remove_node(&self, node_id: NodeId) {
        let mut inner = self.inner.write().unwrap();
        if inner.nodes.remove(&node_id).is_none() {
            return;
        }
        if inner.master == Some(node_id) {
            inner.master = None;
        }
        inner.removal_subs.retain(|tx| tx.send(node_id).is_ok());
    }

    pub fn register_definition_handler(&self, node_id: NodeId, handler: Arc<dyn DefinitionHandler>) {
        if let Some(node) = self.inner.write().unwrap().nodes.get_mut(&node_id) {
            node.definition_handler = Some(handler);
        }
    }

    pub fn register_executor_handler(&self, node_id: NodeId, handler: Arc<dyn ExecutorHandler>) {
        if let Some(node) = self.inner.write().unwrap().nodes.get_mut(&node_id) {
            node.executor_handler = Some(handler);
        }
    }

    fn master_definition_handler(&self) -> Result<Arc<dyn DefinitionHandler>, TransportError> {
        let inner = self.inner.read().unwrap();
        let master = inner
            .master
            .ok_or_else(|| TransportError::Unreachable("no elected master".to_string()))?;
        inner
            .nodes
            .get(&master)
            .and_then(|node| node.definition_handler.clone())
            .ok_or_else(|| TransportError::Unreachable(format!("master node {master}")))
    }

    fn executor_handler(&self, target: NodeId) -> Result<Arc<dyn ExecutorHandler>, TransportError> {
        self.inner
            .read()
            .unwrap()
            .nodes
            .get(&target)
            .and_then(|node| node.executor_handler.clone())
            .ok_or_else(|| TransportError::Unreachable(format!("node {target}")))
    }
}

/// One node's handle onto the in-process cluster.
pub struct MemTransport {
    hub: Arc<MemCluster>,
    node_id: NodeId,
}

impl MemTransport {
    async fn with_timeout<T>(
        &self,
        action: &str,
        fut: impl std::future::Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        match time::timeout(self.hub.rpc_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(action, node = self.node_id, "benchmark rpc timed out");
                Err(TransportError::Timeout(self.hub.rpc_timeout))
            }
        }
    }
}

#[async_trait]
impl BenchTransport for MemTransport {
    fn local_node_id(&self) -> NodeId {
        self.node_id
    }

    fn is_master(&self) -> bool {
        self.hub.inner.read().unwrap().master == Some(self.node_id)
    }

    fn alive_nodes(&self) -> Vec<NodeId> {
        self.hub.inner.read().unwrap().nodes.keys().copied().collect()
    }

    fn executor_nodes(&self) -> Vec<NodeId> {
        self.hub
            .inner
            .read()
            .unwrap()
            .nodes
            .iter()
            .filter(|(_, node)| node.bench_capable)
            .map(|(id, _)| *id)
            .collect()
    }

    fn subscribe_removals(&self) -> mpsc::UnboundedReceiver<NodeId> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.inner.write().unwrap().removal_subs.push(tx);
        rx
    }

    async fn fetch_definition(
        &self,
        request: DefinitionRequest,
    ) -> Result<BenchmarkDefinition, TransportError> {
        let handler = self.hub.master_definition_handler()?;
        self.with_timeout(ACTION_FETCH_DEFINITION, handler.fetch_definition(request))
            .await
    }

    async fn fetch_results(
        &self,
        target: NodeId,
        request: NodeResultsRequest,
    ) -> Result<NodeResults, TransportError> {
        let handler = self.hub.executor_handler(target)?;
        self.with_timeout(ACTION_FETCH_RESULTS, handler.fetch_results(request))
            .await
    }

    async fn abort_local(&self, target: NodeId, benchmark_id: &str) -> Result<(), TransportError> {
        let handler = self.hub.executor_handler(target)?;
        self.with_timeout(ACTION_ABORT_LOCAL, handler.abort_local(benchmark_id))
            .await
    }
}
