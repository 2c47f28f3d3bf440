//! Failover and recovery coordination
//!
//! Observes the health monitor. A DOWN notification takes the node out of
//! the enabled set; an UP notification starts a background recovery that
//! drains the node's command log, replays it in order and only then lets the
//! node rejoin. A replay that
//! hits an unavailable node puts the unconfirmed remainder back and leaves
//! the node DOWN for the next attempt.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::command_log::CommandLogStore;
use crate::core::health_monitor::{NodeStateChanged, NodeStateObserver};
use crate::core::node_registry::{DisableReason, NodeRegistry, NodeState};
use crate::error::{AppError, Result};
use crate::infrastructure::driver::{execute_with_timeout, DriverError};

/// How a recovery attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Log replayed and node back in the enabled set
    Recovered { replayed: usize, discarded: usize },
    /// Node was already UP
    AlreadyUp,
    /// Replay stopped; unconfirmed entries were re-queued and the node is DOWN
    Aborted { replayed: usize, requeued: usize },
    /// An operator override keeps the node out of rotation
    ManuallyDisabled,
}

/// Cheap to clone; clones share replay locks and background recoveries
#[derive(Clone)]
pub struct FailoverCoordinator {
    registry: Arc<NodeRegistry>,
    command_log: Arc<CommandLogStore>,
    operation_timeout: Duration,
    replay_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    recoveries: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FailoverCoordinator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        command_log: Arc<CommandLogStore>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            command_log,
            operation_timeout,
            replay_locks: Arc::new(Mutex::new(HashMap::new())),
            recoveries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Take a node out of the enabled set
    pub async fn handle_down(&self, node: &str, reason: DisableReason) -> Result<()> {
        let previous = self
            .registry
            .set_state(node, NodeState::Down, Some(reason))
            .await?;
        if previous != NodeState::Down {
            warn!(node = %node, reason = ?reason, "Node disabled, writes will be logged");
        }
        Ok(())
    }

    /// Replay the node's command log and bring it back `UP`.
    ///
    /// Only one recovery runs per node at a time.
    pub async fn recover(&self, node: &str) -> Result<RecoveryOutcome> {
        let lock = self.replay_lock(node).await;
        let _guard = lock.lock().await;

        let current = self.registry.get(node).await?;
        if current.state == NodeState::Up {
            debug!(node = %node, "Recovery requested for a node that is already UP");
            return Ok(RecoveryOutcome::AlreadyUp);
        }
        if current.is_manually_disabled() {
            info!(node = %node, "Node is manually disabled, skipping recovery");
            return Ok(RecoveryOutcome::ManuallyDisabled);
        }

        self.registry
            .set_state(node, NodeState::Recovering, None)
            .await?;
        let pending = self.command_log.len(node).await;
        info!(node = %node, pending = pending, "Starting recovery");

        let mut replayed = 0;
        let mut discarded = 0;

        loop {
            let batch = self.command_log.drain(node).await;

            if batch.is_empty() {
                let rejoined = self
                    .registry
                    .transition_if(
                        node,
                        NodeState::Recovering,
                        NodeState::Up,
                        self.command_log.is_empty(node),
                    )
                    .await?;
                if rejoined {
                    info!(
                        node = %node,
                        replayed = replayed,
                        discarded = discarded,
                        "Recovery finished, node back in rotation"
                    );
                    return Ok(RecoveryOutcome::Recovered {
                        replayed,
                        discarded,
                    });
                }
                if self.registry.state(node).await? != NodeState::Recovering {
                    // marked DOWN while replaying
                    let requeued = self.command_log.requeue(node).await;
                    return Ok(RecoveryOutcome::Aborted { replayed, requeued });
                }
                // writes arrived after the drain; replay them too
                continue;
            }

            let driver = current.driver.clone();
            for (position, entry) in batch.iter().enumerate() {
                if self.registry.state(node).await? == NodeState::Down {
                    return self.abort(node, replayed, "node marked DOWN during replay").await;
                }

                match execute_with_timeout(driver.as_ref(), &entry.statement, self.operation_timeout)
                    .await
                {
                    Ok(_) => {
                        replayed += 1;
                        if let Err(e) = self.command_log.acknowledge(node, entry.id).await {
                            error!(node = %node, id = %entry.id, error = %e, "Failed to acknowledge replayed command");
                        }
                    }
                    Err(DriverError::Rejected(reason)) => {
                        // replaying a refused statement again cannot succeed
                        discarded += 1;
                        error!(
                            node = %node,
                            id = %entry.id,
                            statement = %entry.statement,
                            reason = %reason,
                            "Replayed command rejected, discarding"
                        );
                        if let Err(e) = self.command_log.acknowledge(node, entry.id).await {
                            error!(node = %node, id = %entry.id, error = %e, "Failed to discard rejected command");
                        }
                    }
                    Err(e) => {
                        let failure = AppError::ReplayFailure {
                            node: node.to_string(),
                            position,
                            reason: e.to_string(),
                        };
                        return self.abort(node, replayed, &failure.to_string()).await;
                    }
                }
            }
        }
    }

    async fn abort(&self, node: &str, replayed: usize, reason: &str) -> Result<RecoveryOutcome> {
        self.registry
            .set_state(node, NodeState::Down, Some(DisableReason::HealthCheck))
            .await?;
        let requeued = self.command_log.requeue(node).await;
        warn!(
            node = %node,
            replayed = replayed,
            requeued = requeued,
            reason = %reason,
            "Recovery aborted, node stays DOWN"
        );
        Ok(RecoveryOutcome::Aborted { replayed, requeued })
    }

    /// Run `recover` on a background task so the caller is not held up by
    /// a long replay
    pub async fn spawn_recovery(&self, node: &str) {
        let coordinator = self.clone();
        let name = node.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = coordinator.recover(&name).await {
                error!(node = %name, error = %e, "Recovery failed");
            }
        });

        let mut recoveries = self.recoveries.lock().await;
        recoveries.retain(|h| !h.is_finished());
        recoveries.push(handle);
    }

    /// Wait for every background recovery started so far
    pub async fn wait_for_recoveries(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.recoveries.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Recovery task ended abnormally");
            }
        }
    }

    async fn replay_lock(&self, node: &str) -> Arc<Mutex<()>> {
        let mut locks = self.replay_locks.lock().await;
        locks
            .entry(node.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl NodeStateObserver for FailoverCoordinator {
    async fn on_state_changed(&self, event: &NodeStateChanged) -> Result<()> {
        match event.new {
            NodeState::Down => self.handle_down(&event.node, DisableReason::HealthCheck).await,
            NodeState::Up => {
                self.spawn_recovery(&event.node).await;
                Ok(())
            }
            NodeState::Recovering => Ok(()),
        }
    }

    fn observer_name(&self) -> &'static str {
        "failover_coordinator"
    }
}
