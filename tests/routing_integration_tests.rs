mod common;

use common::*;
use replica_balancer::{AppError, LoadBalancingAlgorithm, NodeState, WriteOutcome};
use std::time::Duration;

#[tokio::test]
async fn test_weighted_reads_then_write_with_node_down() -> TestResult {
    let cluster = TestCluster::builder()
        .node("A", 3)
        .node("B", 1)
        .node("C", 1)
        .algorithm(LoadBalancingAlgorithm::WeightedRoundRobin)
        .build()
        .await?;
    let lb = &cluster.balancer;

    let mut served = Vec::new();
    for _ in 0..5 {
        served.push(served_by(&lb.route_select("SELECT * FROM users").await?));
    }
    assert_eq!(served, vec!["A", "A", "A", "B", "C"]);

    cluster.replica("B").set_available(false);
    assert_eq!(cluster.probe().await, 1);
    assert_eq!(lb.registry().state("B").await?, NodeState::Down);

    let report = lb
        .route_write("INSERT INTO users (name) VALUES ('ada')")
        .await?;
    assert_eq!(report.executed(), 2);
    assert_eq!(report.logged(), 1);
    assert!(matches!(report.outcome("B"), Some(WriteOutcome::Logged { .. })));
    assert_eq!(
        cluster.replica("A").writes(),
        vec!["INSERT INTO users (name) VALUES ('ada')"]
    );
    assert!(cluster.replica("B").writes().is_empty());
    assert_eq!(lb.command_log().len("B").await, 1);

    // B is out of rotation for reads
    for _ in 0..8 {
        assert_ne!(served_by(&lb.route_select("SELECT 1").await?), "B");
    }

    cluster.replica("B").set_available(true);
    assert_eq!(cluster.probe().await, 1);
    assert_eq!(lb.registry().state("B").await?, NodeState::Up);
    assert!(lb.command_log().is_empty("B").await);
    assert_eq!(
        cluster.replica("B").writes(),
        vec!["INSERT INTO users (name) VALUES ('ada')"]
    );
    Ok(())
}

#[tokio::test]
async fn test_all_nodes_down() -> TestResult {
    let cluster = TestCluster::builder().nodes(&["db1", "db2"]).build().await?;
    let lb = &cluster.balancer;

    for replica in cluster.replicas.values() {
        replica.set_available(false);
    }
    assert_eq!(cluster.probe().await, 2);

    assert!(matches!(
        lb.route_select("SELECT 1").await,
        Err(AppError::NoAvailableNode(_))
    ));

    let report = lb.route_write("DELETE FROM sessions").await?;
    assert_eq!(report.executed(), 0);
    assert_eq!(report.logged(), 2);
    for replica in cluster.replicas.values() {
        assert!(replica.executed().is_empty());
    }
    assert_eq!(lb.command_log().total_len().await, 2);
    Ok(())
}

#[tokio::test]
async fn test_round_robin_skips_disabled_node() -> TestResult {
    let cluster = TestCluster::builder()
        .nodes(&["db1", "db2", "db3"])
        .build()
        .await?;
    let lb = &cluster.balancer;

    lb.disable_node("db2").await?;
    let mut served = Vec::new();
    for _ in 0..4 {
        served.push(served_by(&lb.route_select("SELECT 1").await?));
    }
    assert_eq!(served, vec!["db1", "db3", "db1", "db3"]);
    Ok(())
}

#[tokio::test]
async fn test_least_response_time_prefers_fast_node() -> TestResult {
    let cluster = TestCluster::builder()
        .nodes(&["slow", "fast"])
        .algorithm(LoadBalancingAlgorithm::LeastResponseTime)
        .build()
        .await?;
    cluster
        .replica("slow")
        .set_latency(Duration::from_millis(30));
    cluster.probe().await;

    for _ in 0..3 {
        assert_eq!(
            served_by(&cluster.balancer.route_select("SELECT 1").await?),
            "fast"
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_strategy_switch_at_runtime() -> TestResult {
    let cluster = TestCluster::builder()
        .node("a", 2)
        .node("b", 1)
        .build()
        .await?;
    let lb = &cluster.balancer;

    assert_eq!(served_by(&lb.route_select("SELECT 1").await?), "a");
    assert_eq!(served_by(&lb.route_select("SELECT 1").await?), "b");

    lb.set_strategy(LoadBalancingAlgorithm::WeightedRoundRobin);
    let mut served = Vec::new();
    for _ in 0..3 {
        served.push(served_by(&lb.route_select("SELECT 1").await?));
    }
    assert_eq!(served, vec!["a", "a", "b"]);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_reads_and_writes() -> TestResult {
    let cluster = TestCluster::builder()
        .nodes(&["db1", "db2", "db3"])
        .build()
        .await?;
    let lb = std::sync::Arc::new(cluster.balancer);

    let mut handles = Vec::new();
    for i in 0..20 {
        let lb = lb.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                lb.route_select("SELECT 1").await.map(|_| ())
            } else {
                lb.route_write(&format!("INSERT INTO t VALUES ({})", i))
                    .await
                    .map(|_| ())
            }
        }));
    }
    for handle in handles {
        handle.await??;
    }

    for replica in cluster.replicas.values() {
        assert_eq!(replica.writes().len(), 10);
    }
    let served: u64 = lb.nodes().await.iter().map(|n| n.queries_served).sum();
    assert_eq!(served, 10);
    Ok(())
}
