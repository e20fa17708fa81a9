//! Replicated benchmark metadata document.
//!
//! `BenchmarkMetaData` is the single authoritative piece of shared state:
//! one entry per active benchmark, carrying the global lifecycle state and
//! the per-node state of every assigned executor. All cross-node
//! coordination goes through this document; there are no side channels.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Logical node identifier within the cluster.
pub type NodeId = u64;

/// Opaque benchmark identifier, unique within the cluster.
pub type BenchmarkId = String;

/// Global lifecycle state of a benchmark.
///
/// Allowed transitions: `INITIALIZING -> {RUNNING | FAILED}`,
/// `RUNNING <-> {PAUSED | RESUMING}`, `{RUNNING, PAUSED} -> {COMPLETED,
/// FAILED, ABORTED}`. Terminal states are final; the entry is deleted once
/// the client has been answered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BenchmarkState {
    Initializing,
    Running,
    Paused,
    Resuming,
    Completed,
    Failed,
    Aborted,
}

impl BenchmarkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Per-executor state of a benchmark on one node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeBenchState {
    Initializing,
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl NodeBenchState {
    /// Whether this node is done executing, successfully or otherwise.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// One benchmark record in the replicated document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BenchmarkEntry {
    pub benchmark_id: BenchmarkId,
    pub state: BenchmarkState,
    /// Per-node states, keyed by executor node. Keys never change after
    /// creation; executors only flip their own value.
    pub node_state_map: BTreeMap<NodeId, NodeBenchState>,
    /// The nodes chosen at start, in assignment order.
    pub concrete_nodes: Vec<NodeId>,
}

impl BenchmarkEntry {
    /// New entry with the whole assignment in `INITIALIZING`.
    pub fn new(benchmark_id: impl Into<BenchmarkId>, nodes: &[NodeId]) -> Self {
        Self {
            benchmark_id: benchmark_id.into(),
            state: BenchmarkState::Initializing,
            node_state_map: nodes
                .iter()
                .map(|id| (*id, NodeBenchState::Initializing))
                .collect(),
            concrete_nodes: nodes.to_vec(),
        }
    }

    pub fn node_state(&self, node: NodeId) -> Option<NodeBenchState> {
        self.node_state_map.get(&node).copied()
    }

    /// True when every live node reports exactly `target`.
    ///
    /// Nodes reporting `FAILED` and nodes for which `alive` returns false do
    /// not factor in, so a dead or failed minority cannot wedge the quorum.
    pub fn all_alive_in_state(
        &self,
        target: NodeBenchState,
        alive: impl Fn(NodeId) -> bool,
    ) -> bool {
        self.node_state_map.iter().all(|(node, state)| {
            *state == NodeBenchState::Failed || !alive(*node) || *state == target
        })
    }

    /// Like [`Self::all_alive_in_state`], but nodes that already finished
    /// do not factor in either. Pause/resume echoes use this: a node that
    /// completed while the pause was in flight cannot echo anything.
    pub fn all_alive_unfinished_in_state(
        &self,
        target: NodeBenchState,
        alive: impl Fn(NodeId) -> bool,
    ) -> bool {
        self.node_state_map.iter().all(|(node, state)| {
            *state == NodeBenchState::Failed
                || !alive(*node)
                || state.is_finished()
                || *state == target
        })
    }

    /// True when every live node is in a finished state (`COMPLETED`,
    /// `FAILED` or `ABORTED`).
    pub fn all_alive_finished(&self, alive: impl Fn(NodeId) -> bool) -> bool {
        self.node_state_map
            .iter()
            .all(|(node, state)| !alive(*node) || state.is_finished())
    }

    /// True when every assigned node is dead or `FAILED`. A benchmark in
    /// this situation can never make progress and is failed as a whole.
    pub fn all_failed_or_dead(&self, alive: impl Fn(NodeId) -> bool) -> bool {
        !self.node_state_map.is_empty()
            && self
                .node_state_map
                .iter()
                .all(|(node, state)| *state == NodeBenchState::Failed || !alive(*node))
    }
}

/// The replicated document: all active benchmarks, keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BenchmarkMetaData {
    pub entries: BTreeMap<BenchmarkId, BenchmarkEntry>,
}

impl BenchmarkMetaData {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, benchmark_id: &str) -> Option<&BenchmarkEntry> {
        self.entries.get(benchmark_id)
    }

    /// Entries of `current` that are new or changed relative to `previous`.
    ///
    /// Listeners may still re-observe an entry they already handled (the
    /// same commit is fanned out once per subscriber, and quorum conditions
    /// can hold across several commits), so consumers stay idempotent.
    pub fn delta<'a>(
        previous: &BenchmarkMetaData,
        current: &'a BenchmarkMetaData,
    ) -> Vec<&'a BenchmarkEntry> {
        current
            .entries
            .values()
            .filter(|entry| {
                previous
                    .entries
                    .get(&entry.benchmark_id)
                    .map_or(true, |prev| prev != *entry)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(states: &[(NodeId, NodeBenchState)]) -> BenchmarkEntry {
        let nodes: Vec<NodeId> = states.iter().map(|(id, _)| *id).collect();
        let mut entry = BenchmarkEntry::new("bench", &nodes);
        for (id, state) in states {
            entry.node_state_map.insert(*id, *state);
        }
        entry
    }

    #[test]
    fn quorum_requires_every_live_node() {
        let entry = make_entry(&[
            (1, NodeBenchState::Ready),
            (2, NodeBenchState::Ready),
            (3, NodeBenchState::Initializing),
        ]);
        assert!(!entry.all_alive_in_state(NodeBenchState::Ready, |_| true));
        // Node 3 dead: the remaining pair carries the quorum.
        assert!(entry.all_alive_in_state(NodeBenchState::Ready, |id| id != 3));
    }

    #[test]
    fn failed_nodes_do_not_factor_into_quorum() {
        let entry = make_entry(&[
            (1, NodeBenchState::Completed),
            (2, NodeBenchState::Failed),
            (3, NodeBenchState::Completed),
        ]);
        assert!(entry.all_alive_in_state(NodeBenchState::Completed, |_| true));
        assert!(entry.all_alive_finished(|_| true));
    }

    #[test]
    fn all_failed_or_dead_detects_wedged_benchmarks() {
        let mixed = make_entry(&[(1, NodeBenchState::Failed), (2, NodeBenchState::Running)]);
        assert!(!mixed.all_failed_or_dead(|_| true));
        assert!(mixed.all_failed_or_dead(|id| id != 2));

        let all_failed = make_entry(&[(1, NodeBenchState::Failed), (2, NodeBenchState::Failed)]);
        assert!(all_failed.all_failed_or_dead(|_| true));
    }

    #[test]
    fn finished_states_include_failure_and_abort() {
        let entry = make_entry(&[
            (1, NodeBenchState::Completed),
            (2, NodeBenchState::Aborted),
            (3, NodeBenchState::Failed),
        ]);
        assert!(entry.all_alive_finished(|_| true));
        let running = make_entry(&[(1, NodeBenchState::Running)]);
        assert!(!running.all_alive_finished(|_| true));
    }

    #[test]
    fn delta_returns_new_and_changed_entries() {
        let mut previous = BenchmarkMetaData::default();
        previous
            .entries
            .insert("a".to_string(), BenchmarkEntry::new("a", &[1]));

        let mut current = previous.clone();
        current
            .entries
            .insert("b".to_string(), BenchmarkEntry::new("b", &[2]));
        current.entries.get_mut("a").unwrap().state = BenchmarkState::Running;

        let delta = BenchmarkMetaData::delta(&previous, &current);
        let ids: Vec<&str> = delta.iter().map(|e| e.benchmark_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(BenchmarkMetaData::delta(&current, &current).is_empty());
    }

    #[test]
    fn entry_serializes_with_wire_field_names() {
        let entry = BenchmarkEntry::new("bench-1", &[7, 9]);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["benchmark_id"], "bench-1");
        assert_eq!(json["state"], "INITIALIZING");
        assert_eq!(json["node_state_map"]["7"], "INITIALIZING");
        assert_eq!(json["concrete_nodes"][1], 9);
    }
}
