#![allow(dead_code)]

use replica_balancer::core::command_log::CommandLogStore;
use replica_balancer::core::health_monitor::HealthCheckConfig;
use replica_balancer::{LoadBalancer, LoadBalancingAlgorithm, MemoryDriver};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A balancer over in-memory replicas, addressable by node name
pub struct TestCluster {
    pub balancer: LoadBalancer,
    pub replicas: HashMap<String, Arc<MemoryDriver>>,
}

impl TestCluster {
    pub fn builder() -> TestClusterBuilder {
        TestClusterBuilder::default()
    }

    pub fn replica(&self, name: &str) -> &Arc<MemoryDriver> {
        &self.replicas[name]
    }

    /// Run one probe cycle and wait for any recovery it started
    pub async fn probe(&self) -> usize {
        let changed = self.balancer.monitor().run_check().await.len();
        self.balancer.coordinator().wait_for_recoveries().await;
        changed
    }
}

pub struct TestClusterBuilder {
    nodes: Vec<(String, u32)>,
    algorithm: LoadBalancingAlgorithm,
    log_path: Option<PathBuf>,
    probe_interval: Duration,
}

impl Default for TestClusterBuilder {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            algorithm: LoadBalancingAlgorithm::RoundRobin,
            log_path: None,
            probe_interval: Duration::from_millis(25),
        }
    }
}

impl TestClusterBuilder {
    pub fn node(mut self, name: &str, weight: u32) -> Self {
        self.nodes.push((name.to_string(), weight));
        self
    }

    pub fn nodes(mut self, names: &[&str]) -> Self {
        for name in names {
            self.nodes.push((name.to_string(), 1));
        }
        self
    }

    pub fn algorithm(mut self, algorithm: LoadBalancingAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub async fn build(self) -> TestResult<TestCluster> {
        let command_log = match &self.log_path {
            Some(path) => CommandLogStore::open(path).await?,
            None => CommandLogStore::in_memory(),
        };
        let balancer = LoadBalancer::new(
            command_log,
            self.algorithm,
            HealthCheckConfig {
                probe_interval: self.probe_interval,
                probe_timeout: Duration::from_millis(100),
            },
            Duration::from_millis(250),
        )
        .await;

        let mut replicas = HashMap::new();
        for (name, weight) in &self.nodes {
            let replica = Arc::new(MemoryDriver::new(name.clone()));
            balancer.add_node(name, replica.clone(), *weight).await?;
            replicas.insert(name.clone(), replica);
        }

        Ok(TestCluster { balancer, replicas })
    }
}

/// Name of the node that served a read
pub fn served_by(rows: &[serde_json::Map<String, serde_json::Value>]) -> String {
    rows.first()
        .and_then(|row| row.get("node"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
