//! Error types for the benchmark engine.
//!
//! The client-visible surface (`BenchError`) is typed because its kinds map
//! to distinct client outcomes (precondition failure, missing benchmark,
//! refusal off-master, …). Layer-internal errors stay close to the layer
//! that produces them and are folded into `BenchError` at the API boundary.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for client-facing results.
pub type BenchResult<T> = Result<T, BenchError>;

/// Errors surfaced to benchmark clients.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Fewer benchmark-capable nodes are alive than the definition requires.
    #[error("insufficient executor nodes: require at least [{required}] found [{available}]")]
    InsufficientExecutors { required: usize, available: usize },

    /// A benchmark with this id is already registered in the cluster.
    #[error("benchmark [{0}] already exists")]
    AlreadyExists(String),

    /// Pause/resume/abort patterns matched no eligible benchmark.
    #[error("no benchmarks found matching [{0}]")]
    UnknownBenchmark(String),

    /// The operation was invoked on a node that is not the elected master.
    #[error("not the elected master")]
    NotMaster,

    /// Leadership moved while the benchmark was in flight; the in-memory
    /// listener is gone. Poll status to reconcile.
    #[error("master changed while benchmark [{0}] was in flight")]
    MasterLost(String),

    /// A client-side deadline elapsed. The benchmark itself keeps running.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid benchmark definition: {0}")]
    InvalidDefinition(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Errors from the cluster-state store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The document version moved under a compare-and-swap update. Callers
    /// retry with bounded backoff; this never reaches a client.
    #[error("stale metadata update: expected version {expected}, found {actual}")]
    Stale { expected: u64, actual: u64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Errors from point-to-point benchmark RPCs.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The responder has no state for this benchmark id.
    #[error("unknown benchmark [{0}]")]
    UnknownBenchmark(String),

    /// The target node is not reachable (removed, or no elected master).
    #[error("node unreachable: {0}")]
    Unreachable(String),

    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),

    /// The caller dropped the call. Side effects already committed to the
    /// state store are not undone.
    #[error("rpc canceled")]
    Canceled,

    #[error("transport failure: {0}")]
    Failed(String),
}

/// Errors raised by the search backend while executing a query.
#[derive(Error, Debug)]
pub enum SearchError {
    /// The whole competition cannot proceed on this node (for example a
    /// query that fails to parse on every shard).
    #[error("fatal search failure: {0}")]
    Fatal(String),

    /// A single query failed; it is recorded and the iteration continues.
    #[error("query failure: {0}")]
    Query(String),
}
