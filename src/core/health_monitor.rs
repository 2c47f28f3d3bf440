//! Health Monitor
//!
//! Probes every registered node on a fixed interval, whatever its recorded
//! state, and publishes availability transitions to subscribed observers.
//! A node's previous availability is read from the registry, so a node that
//! fell back to `DOWN` during a failed replay is announced `UP` again on the
//! next successful probe. Manually disabled nodes are probed but never
//! announced.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::core::node_registry::{Node, NodeRegistry, NodeState};
use crate::error::{AppError, Result};

/// Health monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

/// Published when a probe disagrees with a node's recorded availability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStateChanged {
    pub node: String,
    pub old: NodeState,
    pub new: NodeState,
    pub timestamp: DateTime<Utc>,
}

/// Subscriber to availability transitions
#[async_trait]
pub trait NodeStateObserver: Send + Sync {
    async fn on_state_changed(&self, event: &NodeStateChanged) -> Result<()>;

    /// Observer name for logging
    fn observer_name(&self) -> &'static str;
}

/// Result of probing one node
#[derive(Debug)]
struct ProbeOutcome {
    node: String,
    result: Result<Duration>,
}

pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    config: HealthCheckConfig,
    observers: RwLock<Vec<Arc<dyn NodeStateObserver>>>,
    is_monitoring: AtomicBool,
    shutdown_notify: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<NodeRegistry>, config: HealthCheckConfig) -> Self {
        Self {
            registry,
            config,
            observers: RwLock::new(Vec::new()),
            is_monitoring: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            task: Mutex::new(None),
        }
    }

    pub async fn subscribe(&self, observer: Arc<dyn NodeStateObserver>) {
        let mut observers = self.observers.write().await;
        if observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            return;
        }
        debug!(observer = observer.observer_name(), "Observer subscribed");
        observers.push(observer);
    }

    pub async fn unsubscribe(&self, observer: &Arc<dyn NodeStateObserver>) {
        self.observers
            .write()
            .await
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    pub fn is_monitoring(&self) -> bool {
        self.is_monitoring.load(Ordering::SeqCst)
    }

    /// Start the background probe loop
    pub async fn start(self: &Arc<Self>) {
        if self.is_monitoring.swap(true, Ordering::SeqCst) {
            warn!("Health monitoring is already running");
            return;
        }

        info!(
            interval = ?self.config.probe_interval,
            timeout = ?self.config.probe_timeout,
            "Starting health monitoring"
        );

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            monitor.monitoring_task().await;
        });
        *self.task.lock().await = Some(handle);
    }

    /// Stop the background probe loop and wait for it to exit
    pub async fn stop(&self) {
        if !self.is_monitoring.swap(false, Ordering::SeqCst) {
            warn!("Health monitoring is not running");
            return;
        }

        self.shutdown_notify.notify_one();
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Health monitoring task ended abnormally");
            }
        }
        info!("Health monitoring stopped");
    }

    async fn monitoring_task(&self) {
        let mut ticker = interval(self.config.probe_interval);

        while self.is_monitoring.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => {
                    let events = self.run_check().await;
                    if !events.is_empty() {
                        debug!(transitions = events.len(), "Probe cycle published transitions");
                    }
                }
                _ = self.shutdown_notify.notified() => {
                    break;
                }
            }
        }
    }

    /// Probe every node once and publish the transitions found
    pub async fn run_check(&self) -> Vec<NodeStateChanged> {
        let nodes = self.registry.all_nodes().await;
        let outcomes = join_all(nodes.iter().map(|node| self.probe(node))).await;

        let mut events = Vec::new();
        for outcome in outcomes {
            let latency = outcome.result.as_ref().ok().copied();
            if let Err(e) = self.registry.record_probe(&outcome.node, latency).await {
                error!(node = %outcome.node, error = %e, "Failed to record probe");
                continue;
            }

            // read after probing so transitions made meanwhile are respected
            let node = match self.registry.get(&outcome.node).await {
                Ok(node) => node,
                Err(e) => {
                    error!(node = %outcome.node, error = %e, "Probed node vanished");
                    continue;
                }
            };
            if node.is_manually_disabled() {
                continue;
            }

            let was_up = node.state != NodeState::Down;
            let is_up = outcome.result.is_ok();
            if was_up == is_up {
                continue;
            }

            let event = NodeStateChanged {
                node: node.name.clone(),
                old: node.state,
                new: if is_up { NodeState::Up } else { NodeState::Down },
                timestamp: Utc::now(),
            };
            self.notify(&event).await;
            events.push(event);
        }

        events
    }

    async fn probe(&self, node: &Node) -> ProbeOutcome {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.probe_timeout, node.driver.probe()).await
        {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => {
                debug!(node = %node.name, error = %e, "Probe failed");
                Err(AppError::Driver {
                    node: node.name.clone(),
                    source: e,
                })
            }
            Err(_) => {
                debug!(node = %node.name, timeout = ?self.config.probe_timeout, "Probe timed out");
                Err(AppError::ProbeTimeout {
                    node: node.name.clone(),
                    timeout: self.config.probe_timeout,
                })
            }
        };

        ProbeOutcome {
            node: node.name.clone(),
            result,
        }
    }

    async fn notify(&self, event: &NodeStateChanged) {
        info!(node = %event.node, from = %event.old, to = %event.new, "Node availability changed");

        let observers = self.observers.read().await.clone();
        for observer in observers {
            if let Err(e) = observer.on_state_changed(event).await {
                error!(
                    observer = observer.observer_name(),
                    node = %event.node,
                    error = %e,
                    "Observer failed to handle state change"
                );
            }
        }
    }
}
