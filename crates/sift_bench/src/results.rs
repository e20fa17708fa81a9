//! Benchmark result types and per-node result aggregation.
//!
//! Executors produce one `CompetitionNodeResult` per competition; the
//! coordinator merges them into a `CompetitionResult` with a summary
//! roll-up. Raw per-query latency samples travel with the node results so
//! the merged percentiles are computed over the concatenated samples, not
//! over pre-aggregated values.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::meta::{BenchmarkState, NodeBenchState, NodeId};

/// One percentile key/value pair of a latency distribution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value: f64,
}

/// Percentile values over `samples` at the given keys, with linear
/// interpolation between adjacent sorted samples.
pub fn percentiles_over(samples: &[u64], keys: &[f64]) -> Vec<PercentileValue> {
    let mut sorted: Vec<u64> = samples.to_vec();
    sorted.sort_unstable();

    keys.iter()
        .map(|&percentile| {
            let value = if sorted.is_empty() {
                0.0
            } else if sorted.len() == 1 {
                sorted[0] as f64
            } else {
                let rank = (percentile / 100.0) * (sorted.len() - 1) as f64;
                let lower = rank.floor() as usize;
                let upper = (lower + 1).min(sorted.len() - 1);
                let fraction = rank - lower as f64;
                sorted[lower] as f64 + fraction * (sorted[upper] as f64 - sorted[lower] as f64)
            };
            PercentileValue { percentile, value }
        })
        .collect()
}

/// Statistics for one timed iteration on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitionIteration {
    /// Sum of per-query service times in this iteration.
    pub total_time_ms: u64,
    /// Queries attempted (successful and errored).
    pub num_queries: u64,
    pub total_hits: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub mean_ms: f64,
    pub queries_per_second: f64,
    pub millis_per_hit: f64,
    pub percentile_values: Vec<PercentileValue>,
    /// Per-query service times of the successful queries, kept for the
    /// cluster-wide percentile roll-up.
    pub latencies_ms: Vec<u64>,
}

impl CompetitionIteration {
    pub fn from_samples(
        latencies_ms: Vec<u64>,
        num_queries: u64,
        total_hits: u64,
        percentiles: &[f64],
    ) -> Self {
        let total_time_ms: u64 = latencies_ms.iter().sum();
        let min_ms = latencies_ms.iter().copied().min().unwrap_or(0);
        let max_ms = latencies_ms.iter().copied().max().unwrap_or(0);
        let mean_ms = if latencies_ms.is_empty() {
            0.0
        } else {
            total_time_ms as f64 / latencies_ms.len() as f64
        };
        let queries_per_second = if total_time_ms == 0 {
            0.0
        } else {
            num_queries as f64 * 1000.0 / total_time_ms as f64
        };
        let millis_per_hit = if total_hits == 0 {
            0.0
        } else {
            total_time_ms as f64 / total_hits as f64
        };
        let percentile_values = percentiles_over(&latencies_ms, percentiles);

        Self {
            total_time_ms,
            num_queries,
            total_hits,
            min_ms,
            max_ms,
            mean_ms,
            queries_per_second,
            millis_per_hit,
            percentile_values,
            latencies_ms,
        }
    }
}

/// Everything one node produced for one competition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitionNodeResult {
    pub node_id: NodeId,
    pub competition_name: String,
    pub requested_iterations: usize,
    pub completed_iterations: usize,
    pub total_executed_queries: u64,
    pub warmup_took_ms: u64,
    pub iterations: Vec<CompetitionIteration>,
    /// Non-fatal per-query errors recorded while this node executed.
    pub errors: Vec<String>,
}

impl CompetitionNodeResult {
    pub fn new(node_id: NodeId, competition_name: impl Into<String>, requested: usize) -> Self {
        Self {
            node_id,
            competition_name: competition_name.into(),
            requested_iterations: requested,
            completed_iterations: 0,
            total_executed_queries: 0,
            warmup_took_ms: 0,
            iterations: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn total_time_ms(&self) -> u64 {
        self.iterations.iter().map(|i| i.total_time_ms).sum()
    }

    fn sample_count(&self) -> usize {
        self.iterations.iter().map(|i| i.latencies_ms.len()).sum()
    }

    fn mean_ms(&self) -> Option<f64> {
        let samples = self.sample_count();
        (samples > 0).then(|| self.total_time_ms() as f64 / samples as f64)
    }
}

/// Cluster-wide roll-up over all node results of one competition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitionSummary {
    pub total_time_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    /// Equal-weighted mean of the per-node mean latencies.
    pub mean_ms: f64,
    /// Computed from summed totals, not averaged per node.
    pub queries_per_second: f64,
    pub millis_per_hit: f64,
    pub avg_warmup_ms: f64,
    pub total_requested_iterations: u64,
    pub total_completed_iterations: u64,
    pub total_queries: u64,
    pub percentile_values: Vec<PercentileValue>,
}

impl CompetitionSummary {
    pub fn from_node_results(node_results: &[CompetitionNodeResult], percentiles: &[f64]) -> Self {
        let mut total_time_ms = 0u64;
        let mut total_queries = 0u64;
        let mut total_hits = 0u64;
        let mut min_ms = u64::MAX;
        let mut max_ms = 0u64;
        let mut samples: Vec<u64> = Vec::new();

        for node in node_results {
            for iteration in &node.iterations {
                total_time_ms += iteration.total_time_ms;
                total_queries += iteration.num_queries;
                total_hits += iteration.total_hits;
                if !iteration.latencies_ms.is_empty() {
                    min_ms = min_ms.min(iteration.min_ms);
                    max_ms = max_ms.max(iteration.max_ms);
                }
                samples.extend_from_slice(&iteration.latencies_ms);
            }
        }
        if min_ms == u64::MAX {
            min_ms = 0;
        }

        let node_means: Vec<f64> = node_results.iter().filter_map(|n| n.mean_ms()).collect();
        let mean_ms = if node_means.is_empty() {
            0.0
        } else {
            node_means.iter().sum::<f64>() / node_means.len() as f64
        };

        let queries_per_second = if total_time_ms == 0 {
            0.0
        } else {
            total_queries as f64 * 1000.0 / total_time_ms as f64
        };
        let millis_per_hit = if total_hits == 0 {
            0.0
        } else {
            total_time_ms as f64 / total_hits as f64
        };
        let avg_warmup_ms = if node_results.is_empty() {
            0.0
        } else {
            node_results.iter().map(|n| n.warmup_took_ms).sum::<u64>() as f64
                / node_results.len() as f64
        };

        Self {
            total_time_ms,
            min_ms,
            max_ms,
            mean_ms,
            queries_per_second,
            millis_per_hit,
            avg_warmup_ms,
            total_requested_iterations: node_results
                .iter()
                .map(|n| n.requested_iterations as u64)
                .sum(),
            total_completed_iterations: node_results
                .iter()
                .map(|n| n.completed_iterations as u64)
                .sum(),
            total_queries,
            percentile_values: percentiles_over(&samples, percentiles),
        }
    }
}

/// Merged result of one competition across every reporting node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitionResult {
    pub competition_name: String,
    pub concurrency: usize,
    pub multiplier: usize,
    pub node_results: Vec<CompetitionNodeResult>,
    pub summary: CompetitionSummary,
}

/// Merge per-node results of one competition into a single result.
pub fn merge_competition(
    competition_name: &str,
    concurrency: usize,
    multiplier: usize,
    percentiles: &[f64],
    mut node_results: Vec<CompetitionNodeResult>,
) -> CompetitionResult {
    node_results.sort_by_key(|n| n.node_id);
    let summary = CompetitionSummary::from_node_results(&node_results, percentiles);
    CompetitionResult {
        competition_name: competition_name.to_string(),
        concurrency,
        multiplier,
        node_results,
        summary,
    }
}

/// The response delivered to the client that started a benchmark; also the
/// element type of status listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkStartResponse {
    pub benchmark_id: String,
    pub state: BenchmarkState,
    pub errors: Vec<String>,
    pub competition_results: BTreeMap<String, CompetitionResult>,
}

impl BenchmarkStartResponse {
    pub fn new(benchmark_id: impl Into<String>, state: BenchmarkState) -> Self {
        Self {
            benchmark_id: benchmark_id.into(),
            state,
            errors: Vec::new(),
            competition_results: BTreeMap::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Echoed per-node states for a pause, resume or abort operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlResponse {
    pub node_states: BTreeMap<String, BTreeMap<NodeId, NodeBenchState>>,
}

impl ControlResponse {
    pub fn record(&mut self, benchmark_id: &str, node: NodeId, state: NodeBenchState) {
        self.node_states
            .entry(benchmark_id.to_string())
            .or_default()
            .insert(node, state);
    }
}

/// Mutex-guarded buffer the executor worker writes competition results
/// into. The dispatch task and the status RPC handler only ever snapshot
/// it, so partial results are available at any point of a run.
#[derive(Debug)]
pub struct NodeResultSink {
    node_id: NodeId,
    inner: Mutex<BTreeMap<String, CompetitionNodeResult>>,
}

impl NodeResultSink {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Start tracking a competition. A no-op when already tracked.
    pub fn begin(&self, competition_name: &str, requested_iterations: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(competition_name.to_string()).or_insert_with(|| {
            CompetitionNodeResult::new(self.node_id, competition_name, requested_iterations)
        });
    }

    pub fn set_warmup(&self, competition_name: &str, took_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(result) = inner.get_mut(competition_name) {
            result.warmup_took_ms = took_ms;
        }
    }

    pub fn record_iteration(&self, competition_name: &str, iteration: CompetitionIteration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(result) = inner.get_mut(competition_name) {
            result.completed_iterations += 1;
            result.total_executed_queries += iteration.num_queries;
            result.iterations.push(iteration);
        }
    }

    pub fn record_error(&self, competition_name: &str, message: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(result) = inner.get_mut(competition_name) {
            result.errors.push(message.into());
        }
    }

    /// Current results, one per started competition.
    pub fn snapshot(&self) -> Vec<CompetitionNodeResult> {
        self.inner.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DEFAULT_PERCENTILES;

    fn node_result(node_id: NodeId, samples: &[&[u64]]) -> CompetitionNodeResult {
        let mut result = CompetitionNodeResult::new(node_id, "c1", samples.len());
        for iteration in samples {
            let queries = iteration.len() as u64;
            result.completed_iterations += 1;
            result.total_executed_queries += queries;
            result.iterations.push(CompetitionIteration::from_samples(
                iteration.to_vec(),
                queries,
                queries,
                &DEFAULT_PERCENTILES,
            ));
        }
        result
    }

    #[test]
    fn percentiles_interpolate_linearly() {
        let samples = vec![10, 20, 30, 40, 50];
        let values = percentiles_over(&samples, &[50.0, 75.0, 100.0]);
        assert_eq!(values[0].value, 30.0);
        assert_eq!(values[1].value, 40.0);
        assert_eq!(values[2].value, 50.0);

        // Rank 25% of four gaps lands halfway between the first two samples.
        let values = percentiles_over(&[10, 20], &[50.0]);
        assert_eq!(values[0].value, 15.0);
    }

    #[test]
    fn percentiles_are_monotone() {
        let samples: Vec<u64> = (0..101u64).map(|i| (i * 13) % 97).collect();
        let keys: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        let values = percentiles_over(&samples, &keys);
        for pair in values.windows(2) {
            assert!(pair[0].value <= pair[1].value + 1e-6);
        }
    }

    #[test]
    fn percentiles_over_empty_and_single_samples() {
        assert_eq!(percentiles_over(&[], &[50.0])[0].value, 0.0);
        assert_eq!(percentiles_over(&[42], &[10.0, 99.0])[1].value, 42.0);
    }

    #[test]
    fn iteration_statistics_from_samples() {
        let iteration =
            CompetitionIteration::from_samples(vec![10, 30, 20], 3, 6, &DEFAULT_PERCENTILES);
        assert_eq!(iteration.total_time_ms, 60);
        assert_eq!(iteration.min_ms, 10);
        assert_eq!(iteration.max_ms, 30);
        assert_eq!(iteration.mean_ms, 20.0);
        assert_eq!(iteration.queries_per_second, 50.0);
        assert_eq!(iteration.millis_per_hit, 10.0);
    }

    #[test]
    fn summary_sums_totals_and_averages_node_means() {
        let nodes = vec![
            node_result(1, &[&[10, 20]]), // node mean 15
            node_result(2, &[&[40, 50]]), // node mean 45
        ];
        let summary = CompetitionSummary::from_node_results(&nodes, &DEFAULT_PERCENTILES);
        assert_eq!(summary.total_time_ms, 120);
        assert_eq!(summary.total_queries, 4);
        assert_eq!(summary.min_ms, 10);
        assert_eq!(summary.max_ms, 50);
        assert_eq!(summary.mean_ms, 30.0);
        // 4 queries in 120ms of summed latency.
        assert!((summary.queries_per_second - 4.0 * 1000.0 / 120.0).abs() < 1e-9);
        assert_eq!(summary.total_completed_iterations, 2);
    }

    #[test]
    fn merge_orders_node_results_by_node_id() {
        let merged = merge_competition(
            "c1",
            1,
            1,
            &DEFAULT_PERCENTILES,
            vec![node_result(9, &[&[5]]), node_result(3, &[&[5]])],
        );
        let ids: Vec<NodeId> = merged.node_results.iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec![3, 9]);
    }

    #[test]
    fn sink_accumulates_iterations_and_errors() {
        let sink = NodeResultSink::new(7);
        sink.begin("c1", 2);
        sink.begin("c1", 2); // idempotent
        sink.set_warmup("c1", 12);
        sink.record_iteration(
            "c1",
            CompetitionIteration::from_samples(vec![5], 1, 1, &DEFAULT_PERCENTILES),
        );
        sink.record_error("c1", "query failed");

        let results = sink.snapshot();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node_id, 7);
        assert_eq!(results[0].completed_iterations, 1);
        assert_eq!(results[0].total_executed_queries, 1);
        assert_eq!(results[0].warmup_took_ms, 12);
        assert_eq!(results[0].errors, vec!["query failed".to_string()]);
    }
}
