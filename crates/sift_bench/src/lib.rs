//! Distributed benchmark orchestration for the sift search cluster.
//!
//! A client submits a benchmark (named competitions of search requests with
//! iteration/concurrency settings and a required executor count); the
//! coordinator on the elected master assigns executor nodes and drives them
//! through initialize/ready/running/completed via the replicated
//! [`meta::BenchmarkMetaData`] document, with pause/resume/abort mid-run
//! and per-node result aggregation into a single merged response.
//!
//! The external collaborators are traits: [`store::ClusterStateStore`] (a
//! linearizable, change-notifying document store),
//! [`transport::BenchTransport`] (typed point-to-point actions plus master
//! discovery) and [`search::SearchBackend`] (the engine that actually runs
//! queries). In-memory implementations of the first two ship here so a
//! whole cluster can run in one process.

pub mod coordinator;
pub mod error;
pub mod executor;
pub mod liveness;
pub mod meta;
pub mod model;
pub mod results;
pub mod search;
pub mod store;
pub mod transport;

pub use coordinator::{CoordinatorService, PendingBenchmark};
pub use error::{BenchError, BenchResult, SearchError, StoreError, TransportError};
pub use executor::ExecutorService;
pub use liveness::LivenessTracker;
pub use meta::{
    BenchmarkEntry, BenchmarkId, BenchmarkMetaData, BenchmarkState, NodeBenchState, NodeId,
};
pub use model::{
    matches_any, simple_match, BenchmarkDefinition, BenchmarkSettings, Competition, SearchRequest,
    DEFAULT_PERCENTILES,
};
pub use results::{
    merge_competition, percentiles_over, BenchmarkStartResponse, CompetitionIteration,
    CompetitionNodeResult, CompetitionResult, CompetitionSummary, ControlResponse, NodeResultSink,
    PercentileValue,
};
pub use search::{
    AbortFlag, CompetitionRunner, CompetitionRunnerExt, PauseGate, SearchBackend, SearchOutcome,
    SimulatedSearchBackend, FATAL_QUERY_MARKER, QUERY_ERROR_MARKER,
};
pub use store::{
    update_meta, ClusterStateStore, MemStateStore, MetaChange, MetaMutator, MetaSnapshot,
};
pub use transport::{
    BenchTransport, DefinitionHandler, DefinitionRequest, ExecutorHandler, MemCluster,
    MemTransport, NodeResults, NodeResultsRequest, ACTION_ABORT_LOCAL, ACTION_FETCH_DEFINITION,
    ACTION_FETCH_RESULTS,
};
