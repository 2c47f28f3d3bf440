//! Core balancing logic
//!
//! Node registry, routing, the command log, health monitoring and the
//! failover coordinator, tied together by the [`LoadBalancer`] facade.

pub mod command_log;
pub mod failover;
pub mod health_monitor;
pub mod load_balancer;
pub mod logging;
pub mod node_registry;
pub mod routing;

pub use command_log::{CommandEntry, CommandLogStore};
pub use failover::{FailoverCoordinator, RecoveryOutcome};
pub use health_monitor::{HealthCheckConfig, HealthMonitor, NodeStateChanged, NodeStateObserver};
pub use load_balancer::{
    BroadcastReport, LoadBalancer, NodeSummary, NodeWriteResult, QueryOutcome, WriteOutcome,
};
pub use node_registry::{DisableReason, Node, NodeRegistry, NodeState};
pub use routing::{LoadBalancingAlgorithm, RoutingStrategy};
