//! Node Registry
//!
//! Authoritative record of every configured database node: identity, weight,
//! availability and the latest probe observations. Availability changes go
//! through one write lock, so a reader of the enabled set never sees a node
//! that is listed and not `UP` at the same time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::infrastructure::driver::NodeDriver;

/// Availability of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    /// In the enabled set, receives reads and live writes
    Up,
    /// Out of the enabled set, writes are captured in its command log
    Down,
    /// Replaying its command log, not yet in the enabled set
    Recovering,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Up => write!(f, "UP"),
            NodeState::Down => write!(f, "DOWN"),
            NodeState::Recovering => write!(f, "RECOVERING"),
        }
    }
}

/// Why a node is out of the enabled set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    /// Disabled by an operator; never re-enabled automatically
    Manual,
    /// Disabled after a failed probe or replay; re-enabled by recovery
    HealthCheck,
}

/// Point-in-time copy of a node record
#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub driver: Arc<dyn NodeDriver>,
    pub weight: u32,
    pub state: NodeState,
    pub disable_reason: Option<DisableReason>,
    pub last_probe: Option<DateTime<Utc>>,
    pub last_latency: Option<Duration>,
    pub queries_served: u64,
}

impl Node {
    pub fn is_enabled(&self) -> bool {
        self.state == NodeState::Up
    }

    pub fn is_manually_disabled(&self) -> bool {
        self.disable_reason == Some(DisableReason::Manual)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("state", &self.state)
            .field("disable_reason", &self.disable_reason)
            .field("last_probe", &self.last_probe)
            .field("last_latency", &self.last_latency)
            .field("queries_served", &self.queries_served)
            .finish()
    }
}

/// NodeRegistry holds every node in registration order
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<Vec<Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node that starts `UP`
    pub async fn add_node(
        &self,
        name: &str,
        driver: Arc<dyn NodeDriver>,
        weight: u32,
    ) -> Result<()> {
        self.add_node_in_state(name, driver, weight, NodeState::Up).await
    }

    /// Register a node with an explicit initial state
    pub async fn add_node_in_state(
        &self,
        name: &str,
        driver: Arc<dyn NodeDriver>,
        weight: u32,
        state: NodeState,
    ) -> Result<()> {
        if name.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Node name must not be empty".to_string(),
            ));
        }
        if weight == 0 {
            return Err(AppError::ValidationError(format!(
                "Node {} must have a positive weight",
                name
            )));
        }

        let mut nodes = self.nodes.write().await;
        if nodes.iter().any(|n| n.name == name) {
            return Err(AppError::DuplicateNode(name.to_string()));
        }

        info!(node = %name, weight = weight, state = %state, "Registering node");

        nodes.push(Node {
            name: name.to_string(),
            driver,
            weight,
            state,
            disable_reason: (state != NodeState::Up).then_some(DisableReason::HealthCheck),
            last_probe: None,
            last_latency: None,
            queries_served: 0,
        });

        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Node> {
        let nodes = self.nodes.read().await;
        nodes
            .iter()
            .find(|n| n.name == name)
            .cloned()
            .ok_or_else(|| AppError::UnknownNode(name.to_string()))
    }

    pub async fn state(&self, name: &str) -> Result<NodeState> {
        self.inspect(name, |node| node.state).await
    }

    /// Snapshot of the `UP` nodes, in registration order
    pub async fn enabled_nodes(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        nodes.iter().filter(|n| n.is_enabled()).cloned().collect()
    }

    /// Snapshot of every node, in registration order
    pub async fn all_nodes(&self) -> Vec<Node> {
        self.nodes.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Run `f` against the node while holding the read lock
    pub async fn inspect<R>(&self, name: &str, f: impl FnOnce(&Node) -> R) -> Result<R> {
        let node = self.read_node(name).await?;
        Ok(f(&node))
    }

    /// Read guard on one node.
    ///
    /// No state transition can happen while the guard is held, so a decision
    /// taken under it holds for the state it observed, even across `.await`.
    pub async fn read_node(&self, name: &str) -> Result<RwLockReadGuard<'_, Node>> {
        let nodes = self.nodes.read().await;
        RwLockReadGuard::try_map(nodes, |nodes| nodes.iter().find(|n| n.name == name))
            .map_err(|_| AppError::UnknownNode(name.to_string()))
    }

    /// Set the availability of a node and return the previous state.
    ///
    /// Entering `UP` clears any disable reason; entering `DOWN` records
    /// `reason`, keeping an existing manual override.
    pub async fn set_state(
        &self,
        name: &str,
        state: NodeState,
        reason: Option<DisableReason>,
    ) -> Result<NodeState> {
        let mut nodes = self.nodes.write().await;
        let node = Self::find_mut(&mut nodes, name)?;
        let previous = node.state;
        Self::apply(node, state, reason);

        if previous != state {
            info!(node = %name, from = %previous, to = %state, "Node state changed");
        }
        Ok(previous)
    }

    /// Move the node from `expected` to `next` only when it is still in
    /// `expected` and `guard` resolves true, all under the write lock.
    pub async fn transition_if(
        &self,
        name: &str,
        expected: NodeState,
        next: NodeState,
        guard: impl Future<Output = bool>,
    ) -> Result<bool> {
        let mut nodes = self.nodes.write().await;
        let state = Self::find_mut(&mut nodes, name)?.state;
        if state != expected || !guard.await {
            debug!(
                node = %name,
                state = %state,
                expected = %expected,
                "Conditional transition skipped"
            );
            return Ok(false);
        }

        let node = Self::find_mut(&mut nodes, name)?;
        Self::apply(node, next, None);
        info!(node = %name, from = %expected, to = %next, "Node state changed");
        Ok(true)
    }

    /// Drop an operator override so automatic recovery applies again
    pub async fn clear_manual_override(&self, name: &str) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let node = Self::find_mut(&mut nodes, name)?;
        if node.disable_reason == Some(DisableReason::Manual) {
            node.disable_reason = Some(DisableReason::HealthCheck);
        }
        Ok(())
    }

    /// Record the outcome of a health probe
    pub async fn record_probe(&self, name: &str, latency: Option<Duration>) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let node = Self::find_mut(&mut nodes, name)?;
        node.last_probe = Some(Utc::now());
        if latency.is_some() {
            node.last_latency = latency;
        }
        Ok(())
    }

    /// Record the latency of a read served by the node
    pub async fn record_query(&self, name: &str, latency: Duration) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let node = Self::find_mut(&mut nodes, name)?;
        node.last_latency = Some(latency);
        node.queries_served += 1;
        Ok(())
    }

    fn find_mut<'a>(nodes: &'a mut [Node], name: &str) -> Result<&'a mut Node> {
        nodes
            .iter_mut()
            .find(|n| n.name == name)
            .ok_or_else(|| AppError::UnknownNode(name.to_string()))
    }

    fn apply(node: &mut Node, state: NodeState, reason: Option<DisableReason>) {
        node.state = state;
        match state {
            NodeState::Up => node.disable_reason = None,
            NodeState::Down => {
                if node.disable_reason != Some(DisableReason::Manual) {
                    node.disable_reason = reason.or(Some(DisableReason::HealthCheck));
                }
            }
            NodeState::Recovering => {}
        }
    }
}
