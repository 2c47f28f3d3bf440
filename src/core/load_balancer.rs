//! Load balancer facade
//!
//! Entry point for callers: reads go to one enabled node chosen by the
//! current routing strategy, writes fan out to every registered node. For
//! each node the live-or-log decision is taken under the registry read lock,
//! so a concurrent state change never makes a write both executed and logged
//! on the same node, nor neither.

use futures::future::join_all;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BalancerConfig, NodeConfig};
use crate::core::command_log::{CommandEntry, CommandLogStore};
use crate::core::failover::{FailoverCoordinator, RecoveryOutcome};
use crate::core::health_monitor::{HealthCheckConfig, HealthMonitor, NodeStateObserver};
use crate::core::node_registry::{DisableReason, Node, NodeRegistry, NodeState};
use crate::core::routing::{LoadBalancingAlgorithm, RoutingStrategy};
use crate::error::{AppError, Result};
use crate::infrastructure::driver::{execute_with_timeout, DriverError, NodeDriver, RowSet};
use crate::sql::{classify, StatementKind};

/// Live attempts per node for one write before it is reported failed
const MAX_WRITE_ATTEMPTS: usize = 3;

/// What happened to a write on one node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteOutcome {
    Executed { rows: RowSet },
    /// Captured in the node's command log for replay
    Logged { entry_id: Uuid },
    /// Refused or timed out on an `UP` node, or the node kept flapping
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeWriteResult {
    pub node: String,
    #[serde(flatten)]
    pub outcome: WriteOutcome,
}

/// Per-node results of a write broadcast, in registration order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastReport {
    pub statement: String,
    pub results: Vec<NodeWriteResult>,
}

impl BroadcastReport {
    pub fn executed(&self) -> usize {
        self.count(|o| matches!(o, WriteOutcome::Executed { .. }))
    }

    pub fn logged(&self) -> usize {
        self.count(|o| matches!(o, WriteOutcome::Logged { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, WriteOutcome::Failed { .. }))
    }

    pub fn outcome(&self, node: &str) -> Option<&WriteOutcome> {
        self.results
            .iter()
            .find(|r| r.node == node)
            .map(|r| &r.outcome)
    }

    /// Fail with `WriteBroadcastPartialFailure` when any node failed
    pub fn into_result(self) -> Result<Self> {
        let failed = self.failed();
        if failed > 0 {
            return Err(AppError::WriteBroadcastPartialFailure {
                failed,
                total: self.results.len(),
            });
        }
        Ok(self)
    }

    fn count(&self, pred: impl Fn(&WriteOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Result of `LoadBalancer::execute`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryOutcome {
    Rows { node: String, rows: RowSet },
    Broadcast(BroadcastReport),
}

/// Operator view of a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub weight: u32,
    pub state: NodeState,
    pub disable_reason: Option<DisableReason>,
    pub last_latency_ms: Option<u64>,
    pub last_probe: Option<chrono::DateTime<chrono::Utc>>,
    pub pending_commands: usize,
    pub queries_served: u64,
}

enum Dispatch {
    Live(Arc<dyn NodeDriver>),
    Logged(Uuid),
}

pub struct LoadBalancer {
    registry: Arc<NodeRegistry>,
    command_log: Arc<CommandLogStore>,
    strategy: Mutex<RoutingStrategy>,
    coordinator: Arc<FailoverCoordinator>,
    monitor: Arc<HealthMonitor>,
    operation_timeout: Duration,
}

impl LoadBalancer {
    /// Build a balancer with no nodes; the coordinator is subscribed to the monitor
    pub async fn new(
        command_log: CommandLogStore,
        algorithm: LoadBalancingAlgorithm,
        health: HealthCheckConfig,
        operation_timeout: Duration,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new());
        let command_log = Arc::new(command_log);
        let coordinator = Arc::new(FailoverCoordinator::new(
            registry.clone(),
            command_log.clone(),
            operation_timeout,
        ));
        let monitor = Arc::new(HealthMonitor::new(registry.clone(), health));
        monitor
            .subscribe(coordinator.clone() as Arc<dyn NodeStateObserver>)
            .await;

        info!(strategy = %algorithm, "Load balancer created");

        Self {
            registry,
            command_log,
            strategy: Mutex::new(RoutingStrategy::new(algorithm)),
            coordinator,
            monitor,
            operation_timeout,
        }
    }

    /// Build from configuration, creating each node's driver with `connect`
    pub async fn from_config<F>(config: &BalancerConfig, mut connect: F) -> Result<Self>
    where
        F: FnMut(&NodeConfig) -> Result<Arc<dyn NodeDriver>>,
    {
        config.validate()?;
        let command_log = match &config.command_log.path {
            Some(path) => CommandLogStore::open(path).await?,
            None => CommandLogStore::in_memory(),
        };

        let balancer = Self::new(
            command_log,
            config.routing.strategy,
            config.health_check(),
            config.operation_timeout(),
        )
        .await;

        for node in &config.nodes {
            let driver = connect(node)?;
            balancer.add_node(&node.name, driver, node.weight).await?;
        }
        Ok(balancer)
    }

    /// Register a node.
    ///
    /// A node with pending log entries from a previous run starts `DOWN` so
    /// its first successful probe replays them.
    pub async fn add_node(&self, name: &str, driver: Arc<dyn NodeDriver>, weight: u32) -> Result<()> {
        let pending = self.command_log.len(name).await;
        let state = if pending > 0 {
            info!(node = %name, pending = pending, "Node has pending commands, starting DOWN");
            NodeState::Down
        } else {
            NodeState::Up
        };
        self.registry
            .add_node_in_state(name, driver, weight, state)
            .await
    }

    /// Take a node out of rotation until `enable_node` is called
    pub async fn disable_node(&self, name: &str) -> Result<()> {
        self.coordinator.handle_down(name, DisableReason::Manual).await
    }

    /// Clear a manual override and bring the node back through recovery
    pub async fn enable_node(&self, name: &str) -> Result<RecoveryOutcome> {
        if self.registry.state(name).await? == NodeState::Up {
            return Ok(RecoveryOutcome::AlreadyUp);
        }
        self.registry.clear_manual_override(name).await?;
        self.coordinator.recover(name).await
    }

    pub fn set_strategy(&self, algorithm: LoadBalancingAlgorithm) {
        let mut strategy = self.lock_strategy();
        if strategy.algorithm() != algorithm {
            info!(from = %strategy.algorithm(), to = %algorithm, "Routing strategy changed");
            *strategy = RoutingStrategy::new(algorithm);
        }
    }

    pub fn strategy(&self) -> LoadBalancingAlgorithm {
        self.lock_strategy().algorithm()
    }

    /// Run a read on one enabled node.
    ///
    /// A node found unreachable is taken out of rotation and the read moves
    /// to the next selection.
    pub async fn route_select(&self, sql: &str) -> Result<RowSet> {
        self.route_select_on(sql).await.map(|(_, rows)| rows)
    }

    async fn route_select_on(&self, sql: &str) -> Result<(String, RowSet)> {
        let attempts = self.registry.len().await.max(1);

        for _ in 0..attempts {
            let enabled = self.registry.enabled_nodes().await;
            let selected = self.lock_strategy().select(&enabled)?;
            let Some(node) = enabled.iter().find(|n| n.name == selected) else {
                continue;
            };

            let started = Instant::now();
            match execute_with_timeout(node.driver.as_ref(), sql, self.operation_timeout).await {
                Ok(rows) => {
                    let latency = started.elapsed();
                    self.registry.record_query(&node.name, latency).await?;
                    debug!(node = %node.name, latency = ?latency, rows = rows.len(), "Read served");
                    return Ok((node.name.clone(), rows));
                }
                Err(e) if e.is_unavailable() => {
                    warn!(node = %node.name, error = %e, "Read target unreachable, trying another node");
                    self.coordinator
                        .handle_down(&node.name, DisableReason::HealthCheck)
                        .await?;
                }
                Err(e) => {
                    return Err(AppError::Driver {
                        node: node.name.clone(),
                        source: e,
                    })
                }
            }
        }

        Err(AppError::NoAvailableNode(
            "Every selected node was unreachable".to_string(),
        ))
    }

    /// Broadcast a write to every registered node.
    ///
    /// `UP` nodes execute it now, the others get it logged for replay.
    pub async fn route_write(&self, sql: &str) -> Result<BroadcastReport> {
        let nodes = self.registry.all_nodes().await;
        if nodes.is_empty() {
            return Err(AppError::NoAvailableNode(
                "No database nodes registered".to_string(),
            ));
        }

        let results = join_all(nodes.iter().map(|node| self.write_to(node, sql))).await;
        let report = BroadcastReport {
            statement: sql.to_string(),
            results,
        };

        if report.failed() > 0 {
            warn!(
                executed = report.executed(),
                logged = report.logged(),
                failed = report.failed(),
                "Write broadcast partially failed"
            );
        } else {
            debug!(
                executed = report.executed(),
                logged = report.logged(),
                "Write broadcast complete"
            );
        }
        Ok(report)
    }

    async fn write_to(&self, node: &Node, sql: &str) -> NodeWriteResult {
        NodeWriteResult {
            node: node.name.clone(),
            outcome: self.write_outcome(&node.name, sql).await,
        }
    }

    /// Run the write live or log it. An `Unavailable` answer means the
    /// statement did not run, so the node is marked DOWN and the decision is
    /// taken again; the node may already be back UP by then.
    async fn write_outcome(&self, name: &str, sql: &str) -> WriteOutcome {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let driver = match self.dispatch(name, sql).await {
                Ok(Dispatch::Logged(entry_id)) => return WriteOutcome::Logged { entry_id },
                Ok(Dispatch::Live(driver)) => driver,
                Err(e) => {
                    return WriteOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };

            match execute_with_timeout(driver.as_ref(), sql, self.operation_timeout).await {
                Ok(rows) => return WriteOutcome::Executed { rows },
                Err(DriverError::Unavailable(reason)) => {
                    warn!(node = %name, attempt = attempt, reason = %reason, "Write target unreachable");
                    if let Err(e) = self
                        .coordinator
                        .handle_down(name, DisableReason::HealthCheck)
                        .await
                    {
                        return WriteOutcome::Failed {
                            error: e.to_string(),
                        };
                    }
                }
                Err(e) => {
                    warn!(node = %name, error = %e, "Write failed");
                    return WriteOutcome::Failed {
                        error: e.to_string(),
                    };
                }
            }
        }

        warn!(node = %name, attempts = MAX_WRITE_ATTEMPTS, "Node kept flapping, write not applied");
        WriteOutcome::Failed {
            error: format!(
                "node {} unavailable after {} attempts",
                name, MAX_WRITE_ATTEMPTS
            ),
        }
    }

    /// Decide live or logged against one consistent view of the node. The
    /// read guard is held until the append is persisted.
    async fn dispatch(&self, name: &str, sql: &str) -> Result<Dispatch> {
        let node = self.registry.read_node(name).await?;
        if node.is_enabled() {
            return Ok(Dispatch::Live(node.driver.clone()));
        }
        let entry = CommandEntry::new(name, sql);
        let id = entry.id;
        self.command_log.append(entry).await;
        drop(node);
        Ok(Dispatch::Logged(id))
    }

    /// Classify a statement and route it
    pub async fn execute(&self, sql: &str) -> Result<QueryOutcome> {
        match classify(sql) {
            StatementKind::Select => {
                let (node, rows) = self.route_select_on(sql).await?;
                Ok(QueryOutcome::Rows { node, rows })
            }
            kind if kind.is_write() => Ok(QueryOutcome::Broadcast(self.route_write(sql).await?)),
            StatementKind::Multi => Err(AppError::UnsupportedStatement(
                "Multiple statements in one call are not supported".to_string(),
            )),
            kind => {
                let node = self
                    .registry
                    .enabled_nodes()
                    .await
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        AppError::NoAvailableNode(format!("No enabled node for {:?} statement", kind))
                    })?;
                let rows = execute_with_timeout(node.driver.as_ref(), sql, self.operation_timeout)
                    .await
                    .map_err(|source| AppError::Driver {
                        node: node.name.clone(),
                        source,
                    })?;
                Ok(QueryOutcome::Rows {
                    node: node.name,
                    rows,
                })
            }
        }
    }

    pub async fn nodes(&self) -> Vec<NodeSummary> {
        let mut summaries = Vec::new();
        for node in self.registry.all_nodes().await {
            summaries.push(NodeSummary {
                pending_commands: self.command_log.len(&node.name).await,
                last_latency_ms: node.last_latency.map(|d| d.as_millis() as u64),
                name: node.name,
                weight: node.weight,
                state: node.state,
                disable_reason: node.disable_reason,
                last_probe: node.last_probe,
                queries_served: node.queries_served,
            });
        }
        summaries
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn command_log(&self) -> &Arc<CommandLogStore> {
        &self.command_log
    }

    pub fn coordinator(&self) -> &Arc<FailoverCoordinator> {
        &self.coordinator
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub async fn start_monitoring(&self) {
        self.monitor.start().await;
    }

    pub async fn stop_monitoring(&self) {
        self.monitor.stop().await;
    }

    fn lock_strategy(&self) -> MutexGuard<'_, RoutingStrategy> {
        self.strategy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
