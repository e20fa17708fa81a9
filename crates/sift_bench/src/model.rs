//! Benchmark definitions as submitted by clients.

use serde::{Deserialize, Serialize};

use crate::error::BenchError;

/// Percentile keys reported when a competition does not configure its own.
pub const DEFAULT_PERCENTILES: [f64; 6] = [10.0, 25.0, 50.0, 75.0, 90.0, 99.0];

/// One search request, opaque to the orchestration engine. The backend is
/// the only component that interprets `query`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchRequest {
    pub index: String,
    pub query: String,
}

impl SearchRequest {
    pub fn new(index: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            query: query.into(),
        }
    }
}

/// Execution knobs for a benchmark or a single competition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BenchmarkSettings {
    /// Timed iterations per competition per node.
    pub iterations: usize,
    /// Requests in flight per iteration on a node.
    pub concurrency: usize,
    /// Repetitions of the query set within one iteration.
    pub multiplier: usize,
    /// Run one untimed pass before measuring.
    pub warmup: bool,
    /// Allow the node to clear caches between iterations.
    pub allow_cache_clearing: bool,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            iterations: 1,
            concurrency: 1,
            multiplier: 1,
            warmup: false,
            allow_cache_clearing: false,
        }
    }
}

/// A named group of search requests with its own execution knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Competition {
    pub name: String,
    /// Per-competition settings; when absent the benchmark-level settings
    /// apply as-is.
    pub settings: Option<BenchmarkSettings>,
    pub requests: Vec<SearchRequest>,
    /// Percentile keys for this competition's roll-up. Defaults to
    /// [`DEFAULT_PERCENTILES`].
    pub percentiles: Option<Vec<f64>>,
}

impl Competition {
    pub fn new(name: impl Into<String>, requests: Vec<SearchRequest>) -> Self {
        Self {
            name: name.into(),
            settings: None,
            requests,
            percentiles: None,
        }
    }

    pub fn with_settings(mut self, settings: BenchmarkSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn effective_settings(&self, defaults: &BenchmarkSettings) -> BenchmarkSettings {
        self.settings.unwrap_or(*defaults)
    }

    pub fn effective_percentiles(&self) -> Vec<f64> {
        self.percentiles
            .clone()
            .unwrap_or_else(|| DEFAULT_PERCENTILES.to_vec())
    }
}

/// A client-submitted benchmark: an ordered set of competitions to run on
/// `num_executor_nodes` nodes. Immutable from creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkDefinition {
    pub benchmark_id: String,
    pub competitions: Vec<Competition>,
    pub num_executor_nodes: usize,
    pub settings: BenchmarkSettings,
}

impl BenchmarkDefinition {
    pub fn new(benchmark_id: impl Into<String>) -> Self {
        Self {
            benchmark_id: benchmark_id.into(),
            competitions: Vec::new(),
            num_executor_nodes: 1,
            settings: BenchmarkSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: BenchmarkSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_executors(mut self, num: usize) -> Self {
        self.num_executor_nodes = num;
        self
    }

    pub fn add_competition(mut self, competition: Competition) -> Self {
        self.competitions.push(competition);
        self
    }

    /// Reject definitions the engine cannot run before any cluster state is
    /// touched.
    pub fn validate(&self) -> Result<(), BenchError> {
        let invalid = |msg: String| BenchError::InvalidDefinition(msg);

        if self.benchmark_id.is_empty() {
            return Err(invalid("benchmark id must not be empty".to_string()));
        }
        if self.num_executor_nodes < 1 {
            return Err(invalid("num_executor_nodes must be >= 1".to_string()));
        }
        if self.competitions.is_empty() {
            return Err(invalid("at least one competition is required".to_string()));
        }

        let mut seen = std::collections::BTreeSet::new();
        for competition in &self.competitions {
            if competition.name.is_empty() {
                return Err(invalid("competition name must not be empty".to_string()));
            }
            if !seen.insert(competition.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate competition name [{}]",
                    competition.name
                )));
            }
            if competition.requests.is_empty() {
                return Err(invalid(format!(
                    "competition [{}] has no search requests",
                    competition.name
                )));
            }

            let settings = competition.effective_settings(&self.settings);
            if settings.iterations < 1 || settings.concurrency < 1 || settings.multiplier < 1 {
                return Err(invalid(format!(
                    "competition [{}]: iterations, concurrency and multiplier must be >= 1",
                    competition.name
                )));
            }

            for p in competition.effective_percentiles() {
                if !(p > 0.0 && p <= 100.0) {
                    return Err(invalid(format!(
                        "competition [{}]: percentile {p} out of range (0, 100]",
                        competition.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Minimal `*`/`?` wildcard match used for benchmark id patterns.
pub fn simple_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();

    let (mut pi, mut si) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while si < input.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == input[si]) {
            pi += 1;
            si += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star = Some(pi);
            mark = si;
            pi += 1;
        } else if let Some(sp) = star {
            // Backtrack: let the last `*` swallow one more character.
            pi = sp + 1;
            mark += 1;
            si = mark;
        } else {
            return false;
        }
    }

    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

/// True when `input` matches any of `patterns`. An empty pattern list means
/// "match everything".
pub fn matches_any(patterns: &[String], input: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| simple_match(p, input))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> BenchmarkDefinition {
        BenchmarkDefinition::new("bench-1")
            .with_executors(2)
            .add_competition(Competition::new(
                "c1",
                vec![SearchRequest::new("idx", "match_all")],
            ))
    }

    #[test]
    fn valid_definition_passes() {
        definition().validate().unwrap();
    }

    #[test]
    fn rejects_empty_competitions_and_requests() {
        let empty = BenchmarkDefinition::new("bench-1");
        assert!(matches!(
            empty.validate(),
            Err(BenchError::InvalidDefinition(_))
        ));

        let mut def = definition();
        def.competitions[0].requests.clear();
        assert!(def.validate().is_err());
    }

    #[test]
    fn rejects_zero_iterations() {
        let mut def = definition();
        def.settings.iterations = 0;
        assert!(def.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_competition_names() {
        let def = definition().add_competition(Competition::new(
            "c1",
            vec![SearchRequest::new("idx", "match_all")],
        ));
        assert!(def.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_percentiles() {
        let mut def = definition();
        def.competitions[0].percentiles = Some(vec![50.0, 101.0]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn competition_settings_override_benchmark_settings() {
        let defaults = BenchmarkSettings {
            iterations: 5,
            ..BenchmarkSettings::default()
        };
        let competition = Competition::new("c1", vec![SearchRequest::new("idx", "q")]);
        assert_eq!(competition.effective_settings(&defaults).iterations, 5);

        let overridden = competition.with_settings(BenchmarkSettings {
            iterations: 2,
            ..defaults
        });
        assert_eq!(overridden.effective_settings(&defaults).iterations, 2);
    }

    #[test]
    fn simple_match_handles_wildcards() {
        assert!(simple_match("*", "anything"));
        assert!(simple_match("bench-*", "bench-17"));
        assert!(simple_match("bench-?", "bench-7"));
        assert!(!simple_match("bench-?", "bench-17"));
        assert!(simple_match("*-17", "bench-17"));
        assert!(simple_match("b*h-1?", "bench-17"));
        assert!(!simple_match("bench", "bench-17"));
        assert!(simple_match("", ""));
        assert!(!simple_match("", "x"));
    }

    #[test]
    fn matches_any_with_empty_patterns_matches_all() {
        assert!(matches_any(&[], "whatever"));
        assert!(matches_any(&["a*".to_string(), "b*".to_string()], "bench"));
        assert!(!matches_any(&["a*".to_string()], "bench"));
    }
}
