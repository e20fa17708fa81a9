//! Search execution on one node.
//!
//! `SearchBackend` is the opaque engine that actually answers queries; the
//! orchestration core only sees service times and hit counts.
//! `CompetitionRunner` drives one competition through its warm-up and timed
//! iterations, honoring the pause gate before each iteration and the abort
//! flag between iterations.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;

use crate::error::SearchError;
use crate::model::{BenchmarkSettings, Competition, SearchRequest};
use crate::results::{CompetitionIteration, NodeResultSink};

/// Queries starting with this marker fail fatally in the simulated
/// backend, taking the whole competition down on the node.
pub const FATAL_QUERY_MARKER: &str = "fail:fatal";
/// Queries starting with this marker fail as recoverable per-query errors
/// in the simulated backend.
pub const QUERY_ERROR_MARKER: &str = "fail:query";

/// Outcome of one executed search request.
#[derive(Debug, Clone, Copy)]
pub struct SearchOutcome {
    /// Service time reported by the engine.
    pub took_ms: u64,
    pub hits: u64,
}

/// The search engine, opaque to the orchestration core.
#[async_trait]
pub trait SearchBackend: Send + Sync + 'static {
    async fn execute(&self, request: &SearchRequest) -> Result<SearchOutcome, SearchError>;

    /// Invoked between iterations when the benchmark allows cache clearing.
    async fn clear_caches(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Gate a worker acquires before each iteration; blocks while paused.
pub struct PauseGate {
    paused: watch::Sender<bool>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait until the gate is open.
    pub async fn acquire(&self) {
        let mut rx = self.paused.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// One-way abort flag polled by workers between iterations.
#[derive(Clone, Default)]
pub struct AbortFlag {
    flag: Arc<AtomicBool>,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct IterationOutcome {
    latencies_ms: Vec<u64>,
    attempted: u64,
    hits: u64,
    errors: Vec<String>,
}

/// Drives one competition on one node against a `SearchBackend`.
pub struct CompetitionRunner {
    backend: Arc<dyn SearchBackend>,
}

impl CompetitionRunner {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
trait RunIteration {
    async fn run_iteration(
        &self,
        competition: &Competition,
        settings: &BenchmarkSettings,
    ) -> Result<IterationOutcome, SearchError>;
}

#[async_trait]
impl RunIteration for CompetitionRunner {
    /// One pass over the query set, repeated `multiplier` times with
    /// `concurrency` requests in flight.
    async fn run_iteration(
        &self,
        competition: &Competition,
        settings: &BenchmarkSettings,
    ) -> Result<IterationOutcome, SearchError> {
        let requests: Vec<SearchRequest> = (0..settings.multiplier)
            .flat_map(|_| competition.requests.iter().cloned())
            .collect();

        let mut outcome = IterationOutcome {
            latencies_ms: Vec::with_capacity(requests.len()),
            attempted: 0,
            hits: 0,
            errors: Vec::new(),
        };

        let backend = self.backend.clone();
        let mut dispatch = stream::iter(requests)
            .map(move |request| {
                let backend = backend.clone();
                async move { backend.execute(&request).await }
            })
            .buffer_unordered(settings.concurrency.max(1));

        while let Some(result) = dispatch.next().await {
            outcome.attempted += 1;
            match result {
                Ok(executed) => {
                    outcome.latencies_ms.push(executed.took_ms);
                    outcome.hits += executed.hits;
                }
                Err(SearchError::Query(message)) => outcome.errors.push(message),
                // Dropping the stream cancels the in-flight requests.
                Err(fatal @ SearchError::Fatal(_)) => return Err(fatal),
            }
        }

        Ok(outcome)
    }
}

#[async_trait]
pub trait CompetitionRunnerExt {
    /// Run the competition to completion, abort or fatal failure.
    ///
    /// Per-query errors are recorded in `sink` and execution continues;
    /// only a fatal error is returned. An abort observed at a checkpoint
    /// ends the run early with `Ok`; the caller inspects the flag.
    async fn run(
        &self,
        competition: &Competition,
        settings: &BenchmarkSettings,
        pause: &PauseGate,
        abort: &AbortFlag,
        sink: &NodeResultSink,
    ) -> Result<(), SearchError>;
}

#[async_trait]
impl CompetitionRunnerExt for CompetitionRunner {
    async fn run(
        &self,
        competition: &Competition,
        settings: &BenchmarkSettings,
        pause: &PauseGate,
        abort: &AbortFlag,
        sink: &NodeResultSink,
    ) -> Result<(), SearchError> {
        let percentiles = competition.effective_percentiles();
        sink.begin(&competition.name, settings.iterations);

        if settings.warmup {
            pause.acquire().await;
            if abort.is_set() {
                return Ok(());
            }
            let started = Instant::now();
            let outcome = self.run_iteration(competition, settings).await?;
            sink.set_warmup(&competition.name, started.elapsed().as_millis() as u64);
            for error in outcome.errors {
                sink.record_error(&competition.name, format!("warmup: {error}"));
            }
        }

        for _ in 0..settings.iterations {
            pause.acquire().await;
            if abort.is_set() {
                return Ok(());
            }

            let outcome = self.run_iteration(competition, settings).await?;
            for error in &outcome.errors {
                sink.record_error(&competition.name, error.clone());
            }
            sink.record_iteration(
                &competition.name,
                CompetitionIteration::from_samples(
                    outcome.latencies_ms,
                    outcome.attempted,
                    outcome.hits,
                    &percentiles,
                ),
            );

            if abort.is_set() {
                return Ok(());
            }
            if settings.allow_cache_clearing {
                if let Err(err) = self.backend.clear_caches().await {
                    sink.record_error(&competition.name, format!("cache clear failed: {err}"));
                }
            }
        }
        Ok(())
    }
}

/// Deterministic stand-in for the search engine: service times are derived
/// from a hash of the request, and the `fail:` markers inject errors.
pub struct SimulatedSearchBackend {
    base_latency_ms: u64,
    latency_spread_ms: u64,
    /// Real wall-clock delay per query, so drivers can stretch a run out
    /// far enough to pause or abort it.
    pace: Option<std::time::Duration>,
}

impl SimulatedSearchBackend {
    pub fn new(base_latency_ms: u64, latency_spread_ms: u64) -> Self {
        Self {
            base_latency_ms,
            latency_spread_ms,
            pace: None,
        }
    }

    pub fn paced(base_latency_ms: u64, latency_spread_ms: u64, pace: std::time::Duration) -> Self {
        Self {
            base_latency_ms,
            latency_spread_ms,
            pace: Some(pace),
        }
    }
}

#[async_trait]
impl SearchBackend for SimulatedSearchBackend {
    async fn execute(&self, request: &SearchRequest) -> Result<SearchOutcome, SearchError> {
        if let Some(pace) = self.pace {
            tokio::time::sleep(pace).await;
        }
        if request.query.starts_with(FATAL_QUERY_MARKER) {
            return Err(SearchError::Fatal(format!(
                "query does not parse: {}",
                request.query
            )));
        }
        if request.query.starts_with(QUERY_ERROR_MARKER) {
            return Err(SearchError::Query(format!(
                "query failed on index [{}]: {}",
                request.index, request.query
            )));
        }

        let mut hasher = DefaultHasher::new();
        request.index.hash(&mut hasher);
        request.query.hash(&mut hasher);
        let digest = hasher.finish();

        let spread = if self.latency_spread_ms == 0 {
            0
        } else {
            digest % (self.latency_spread_ms + 1)
        };
        Ok(SearchOutcome {
            took_ms: self.base_latency_ms + spread,
            hits: 1 + (digest >> 8) % 4,
        })
    }
}
