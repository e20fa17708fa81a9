//! End-to-end lifecycle scenarios on an in-process cluster.

mod common;

use common::*;
use std::sync::Arc;

use sift_bench::{
    BenchError, BenchmarkState, ClusterStateStore, Competition, CoordinatorService,
    LivenessTracker, SearchRequest,
};

#[tokio::test]
async fn happy_path_three_nodes_merges_all_results() {
    let cluster = start_cluster(3, false).await;

    let pending = cluster
        .coordinator
        .start_benchmark(definition("b1", 3, 2))
        .await
        .unwrap();
    let response = pending.wait_for(WAIT_TIMEOUT).await.unwrap();

    assert_eq!(response.benchmark_id, "b1");
    assert_eq!(response.state, BenchmarkState::Completed);
    assert!(!response.has_errors());

    let result = &response.competition_results["c1"];
    assert_eq!(result.node_results.len(), 3);
    for node in &result.node_results {
        assert_eq!(node.requested_iterations, 2);
        assert_eq!(node.completed_iterations, 2);
        assert_eq!(node.iterations.len(), 2);
        assert_eq!(node.total_executed_queries, 2);
    }
    // 3 nodes x 2 iterations x 1 request.
    assert_eq!(result.summary.total_queries, 6);
    assert_eq!(result.summary.total_completed_iterations, 6);
    assert!(result.summary.queries_per_second > 0.0);

    // Percentile keys come back monotone.
    for pair in result.summary.percentile_values.windows(2) {
        assert!(pair[0].value <= pair[1].value + 1e-6);
    }

    // The entry is deleted once the client has its response.
    wait_for_entry_gone(&cluster.store, "b1").await;
}

#[tokio::test]
async fn single_executor_behaves_like_many() {
    let cluster = start_cluster(1, false).await;

    let response = cluster
        .coordinator
        .start_benchmark(definition("solo", 1, 1))
        .await
        .unwrap()
        .wait_for(WAIT_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(response.state, BenchmarkState::Completed);
    let result = &response.competition_results["c1"];
    assert_eq!(result.node_results.len(), 1);
    // iterations = 1, multiplier = 1: exactly one iteration with one query.
    assert_eq!(result.node_results[0].iterations.len(), 1);
    assert_eq!(result.summary.total_queries, 1);
}

#[tokio::test]
async fn insufficient_executors_fails_before_any_state_write() {
    let cluster = start_cluster(1, false).await;

    let err = cluster
        .coordinator
        .start_benchmark(definition("big", 2, 1))
        .await
        .unwrap_err();
    match err {
        BenchError::InsufficientExecutors {
            required,
            available,
        } => {
            assert_eq!(required, 2);
            assert_eq!(available, 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Nothing was written to cluster state.
    let snapshot = cluster.store.read().await;
    assert_eq!(snapshot.version, 0);
    assert!(snapshot.meta.is_empty());
}

#[tokio::test]
async fn duplicate_benchmark_id_is_rejected() {
    let cluster = start_cluster(1, true).await;

    let pending = cluster
        .coordinator
        .start_benchmark(definition("dup", 1, 1))
        .await
        .unwrap();
    wait_for_state(&cluster.store, "dup", BenchmarkState::Running).await;

    let err = cluster
        .coordinator
        .start_benchmark(definition("dup", 1, 1))
        .await
        .unwrap_err();
    match err {
        BenchError::AlreadyExists(id) => assert_eq!(id, "dup"),
        other => panic!("unexpected error: {other:?}"),
    }

    cluster.executors[0].backend.release_all();
    let response = pending.wait_for(WAIT_TIMEOUT).await.unwrap();
    assert_eq!(response.state, BenchmarkState::Completed);
}

#[tokio::test]
async fn operations_refuse_off_master() {
    let cluster = start_cluster(1, false).await;

    // A coordinator living on a non-master node refuses every operation.
    let transport = cluster.cluster.add_node(99, false);
    let off_master = Arc::new(CoordinatorService::new(
        cluster.store.clone(),
        transport,
        Arc::new(LivenessTracker::new()),
    ));

    let version_before = cluster.store.read().await.version;

    assert!(matches!(
        off_master
            .start_benchmark(definition("b1", 1, 1))
            .await
            .unwrap_err(),
        BenchError::NotMaster
    ));
    assert!(matches!(
        off_master
            .pause_benchmark(&["*".to_string()], None)
            .await
            .unwrap_err(),
        BenchError::NotMaster
    ));
    assert!(matches!(
        off_master.list_benchmarks(&[]).await.unwrap_err(),
        BenchError::NotMaster
    ));

    // Refusal never mutates cluster state.
    assert_eq!(cluster.store.read().await.version, version_before);
}

#[tokio::test]
async fn fatal_queries_fail_the_benchmark_on_all_nodes() {
    let cluster = start_cluster(2, false).await;

    let def = definition("fatal", 2, 3).add_competition(Competition::new(
        "broken",
        vec![SearchRequest::new("idx", "fail:fatal not a query")],
    ));
    let response = cluster
        .coordinator
        .start_benchmark(def)
        .await
        .unwrap()
        .wait_for(WAIT_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(response.state, BenchmarkState::Failed);
    assert!(response.has_errors());
    wait_for_entry_gone(&cluster.store, "fatal").await;
}

#[tokio::test]
async fn query_errors_are_reported_but_the_run_completes() {
    let cluster = start_cluster(2, false).await;

    let def = definition("errs", 2, 2).add_competition(Competition::new(
        "flaky",
        vec![
            SearchRequest::new("idx", "match_all"),
            SearchRequest::new("idx", "fail:query boom"),
        ],
    ));
    let response = cluster
        .coordinator
        .start_benchmark(def)
        .await
        .unwrap()
        .wait_for(WAIT_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(response.state, BenchmarkState::Completed);
    assert!(response.has_errors());

    let flaky = &response.competition_results["flaky"];
    assert_eq!(flaky.node_results.len(), 2);
    for node in &flaky.node_results {
        assert_eq!(node.completed_iterations, 2);
        // Both queries count as attempted; only one produced a sample.
        assert_eq!(node.iterations[0].num_queries, 2);
        assert_eq!(node.iterations[0].latencies_ms.len(), 1);
        assert!(!node.errors.is_empty());
    }
}
