//! Boundary with the per-node query execution driver
//!
//! The balancer never talks to a database directly. Every node is reached
//! through a [`NodeDriver`], which executes one statement and reports either
//! rows or a failure. Parsing and validating SQL is the driver's concern.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;

/// One result row, column name to value
pub type Row = Map<String, Value>;

/// Rows returned by a statement; empty for most writes
pub type RowSet = Vec<Row>;

/// Statement used by the default probe
pub const DEFAULT_PROBE_STATEMENT: &str = "SELECT 1";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The node could not be reached; the statement was not executed
    #[error("node unavailable: {0}")]
    Unavailable(String),

    /// No answer within the bound; the statement may or may not have run
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The node answered and refused the statement
    #[error("statement rejected: {0}")]
    Rejected(String),
}

impl DriverError {
    /// True when the node is known not to have executed the statement
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DriverError::Unavailable(_))
    }
}

/// Per-node query execution primitive
#[async_trait]
pub trait NodeDriver: Send + Sync {
    /// Execute a single statement against the node
    async fn execute(&self, sql: &str) -> Result<RowSet, DriverError>;

    /// Lightweight liveness query
    async fn probe(&self) -> Result<(), DriverError> {
        self.execute(DEFAULT_PROBE_STATEMENT).await.map(|_| ())
    }
}

/// Run a driver call with a bounded timeout
pub async fn execute_with_timeout(
    driver: &dyn NodeDriver,
    sql: &str,
    timeout: Duration,
) -> Result<RowSet, DriverError> {
    match tokio::time::timeout(timeout, driver.execute(sql)).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout(timeout)),
    }
}
