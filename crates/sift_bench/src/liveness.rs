//! Per-benchmark executor liveness.
//!
//! Each (benchmark, node) pair carries one atomic alive bit. The bit is
//! cleared when the cluster reports the node removed and is never set back:
//! a node reconnecting under the same id is dead for any run it was part
//! of. Quorum predicates consult these bits so dead nodes cannot wedge a
//! benchmark.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::meta::NodeId;

#[derive(Default)]
pub struct LivenessTracker {
    benchmarks: RwLock<HashMap<String, HashMap<NodeId, Arc<AtomicBool>>>>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the assignment of a freshly started benchmark, all alive.
    pub fn register(&self, benchmark_id: &str, nodes: &[NodeId]) {
        let mut benchmarks = self.benchmarks.write().unwrap();
        let entry = benchmarks.entry(benchmark_id.to_string()).or_default();
        for node in nodes {
            entry
                .entry(*node)
                .or_insert_with(|| Arc::new(AtomicBool::new(true)));
        }
    }

    /// Drop all liveness state of a finished benchmark.
    pub fn forget(&self, benchmark_id: &str) {
        self.benchmarks.write().unwrap().remove(benchmark_id);
    }

    /// Whether `node` is still alive for `benchmark_id`. Unknown pairs are
    /// dead.
    pub fn is_alive(&self, benchmark_id: &str, node: NodeId) -> bool {
        self.benchmarks
            .read()
            .unwrap()
            .get(benchmark_id)
            .and_then(|nodes| nodes.get(&node))
            .map(|bit| bit.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Clear the alive bit of `node` for every benchmark referencing it.
    /// Returns the benchmarks whose bit actually flipped, so callers log
    /// each death once.
    pub fn mark_removed(&self, node: NodeId) -> Vec<String> {
        let benchmarks = self.benchmarks.read().unwrap();
        let mut affected = Vec::new();
        for (benchmark_id, nodes) in benchmarks.iter() {
            if let Some(bit) = nodes.get(&node) {
                if bit
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    affected.push(benchmark_id.clone());
                }
            }
        }
        affected
    }
}
