//! Replica Balancer - a load balancer for replicated databases
//!
//! Reads are routed to one healthy node, writes are broadcast to every node.
//! Writes a node misses while it is down are kept in a durable command log
//! and replayed in order before the node rejoins.

pub mod config;
pub mod core;
pub mod error;
pub mod infrastructure;
pub mod sql;

// Re-export commonly used types
pub use crate::core::{
    BroadcastReport, LoadBalancer, LoadBalancingAlgorithm, NodeState, QueryOutcome,
    RecoveryOutcome, WriteOutcome,
};
pub use config::BalancerConfig;
pub use error::{AppError, Result};
pub use infrastructure::{DriverError, MemoryDriver, NodeDriver};
