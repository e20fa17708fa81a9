//! Partial failure: node deaths, master loss and orphaned entries.

mod common;

use common::*;

use sift_bench::{update_meta, BenchError, BenchmarkEntry, BenchmarkState, NodeBenchState};

#[tokio::test]
async fn node_death_mid_run_completes_with_the_survivors() {
    let cluster = start_cluster(3, true).await;

    let pending = cluster
        .coordinator
        .start_benchmark(definition("b1", 3, 5))
        .await
        .unwrap();
    wait_for_state(&cluster.store, "b1", BenchmarkState::Running).await;

    for node in &cluster.executors {
        node.backend.allow(1);
    }
    for node in &cluster.executors {
        wait_for_executed(&node.backend, 1).await;
    }

    // Kill the middle node after its first iteration; the others finish.
    let dead = cluster.executors[1].node_id;
    cluster.cluster.remove_node(dead);
    cluster.executors[0].backend.release_all();
    cluster.executors[2].backend.release_all();

    let response = pending.wait_for(WAIT_TIMEOUT).await.unwrap();
    assert_eq!(response.state, BenchmarkState::Completed);

    let result = &response.competition_results["c1"];
    assert_eq!(result.node_results.len(), 2);
    assert!(result.node_results.iter().all(|n| n.node_id != dead));
    for node in &result.node_results {
        assert_eq!(node.completed_iterations, 5);
    }
}

#[tokio::test]
async fn all_nodes_dying_fails_the_benchmark() {
    let cluster = start_cluster(2, true).await;

    let pending = cluster
        .coordinator
        .start_benchmark(definition("b1", 2, 5))
        .await
        .unwrap();

    for node in &cluster.executors {
        cluster.cluster.remove_node(node.node_id);
    }

    let response = pending.wait_for(WAIT_TIMEOUT).await.unwrap();
    assert_eq!(response.state, BenchmarkState::Failed);
    assert!(response
        .errors
        .iter()
        .any(|error| error.contains("all nodes failed")));
    wait_for_entry_gone(&cluster.store, "b1").await;
}

#[tokio::test]
async fn death_after_completion_drops_that_nodes_results() {
    let cluster = start_cluster(2, true).await;

    let pending = cluster
        .coordinator
        .start_benchmark(definition("b1", 2, 2))
        .await
        .unwrap();
    wait_for_state(&cluster.store, "b1", BenchmarkState::Running).await;

    // First node runs to completion and reports COMPLETED.
    cluster.executors[0].backend.release_all();
    let done = cluster.executors[0].node_id;
    wait_for_meta(&cluster.store, "first node to complete", |meta| {
        meta.entry("b1").and_then(|e| e.node_state(done)) == Some(NodeBenchState::Completed)
    })
    .await;

    // It dies before the coordinator ever fetches results from it.
    cluster.cluster.remove_node(done);
    cluster.executors[1].backend.release_all();

    let response = pending.wait_for(WAIT_TIMEOUT).await.unwrap();
    assert_eq!(response.state, BenchmarkState::Completed);

    let result = &response.competition_results["c1"];
    assert_eq!(result.node_results.len(), 1);
    assert_eq!(result.node_results[0].node_id, cluster.executors[1].node_id);
}

#[tokio::test]
async fn orphaned_entries_are_removed_by_the_master() {
    let cluster = start_cluster(1, false).await;

    // An entry the coordinator has no internal state for, as left behind by
    // a crashed master.
    update_meta(cluster.store.as_ref(), &|meta| {
        meta.entries
            .insert("ghost".to_string(), BenchmarkEntry::new("ghost", &[42]));
        Ok(true)
    })
    .await
    .unwrap();

    wait_for_entry_gone(&cluster.store, "ghost").await;
}

#[tokio::test]
async fn master_loss_fails_pending_benchmarks() {
    let cluster = start_cluster(1, true).await;

    let pending = cluster
        .coordinator
        .start_benchmark(definition("b1", 1, 5))
        .await
        .unwrap();
    wait_for_state(&cluster.store, "b1", BenchmarkState::Running).await;

    // Leadership moves; the next observed event fails the in-flight run.
    cluster.cluster.set_master(cluster.executors[0].node_id);
    cluster.executors[0].backend.release_all();

    let err = pending.wait_for(WAIT_TIMEOUT).await.unwrap_err();
    match err {
        BenchError::MasterLost(id) => assert_eq!(id, "b1"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn redundant_commits_do_not_disturb_a_run() {
    let cluster = start_cluster(1, true).await;

    let pending = cluster
        .coordinator
        .start_benchmark(definition("b1", 1, 2))
        .await
        .unwrap();
    wait_for_state(&cluster.store, "b1", BenchmarkState::Running).await;

    // Commit the document unchanged a few times; subscribers re-observe
    // the same entry content and must treat it as a no-op.
    for _ in 0..3 {
        update_meta(cluster.store.as_ref(), &|_meta| Ok(true))
            .await
            .unwrap();
    }

    cluster.executors[0].backend.release_all();
    let response = pending.wait_for(WAIT_TIMEOUT).await.unwrap();
    assert_eq!(response.state, BenchmarkState::Completed);
    assert_eq!(
        response.competition_results["c1"]
            .summary
            .total_completed_iterations,
        2
    );
}
