use std::time::Duration;

use crate::infrastructure::driver::DriverError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("No available node: {0}")]
    NoAvailableNode(String),

    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Probe of node {node} timed out after {timeout:?}")]
    ProbeTimeout { node: String, timeout: Duration },

    #[error("Replay failed for node {node} at entry {position}: {reason}")]
    ReplayFailure {
        node: String,
        position: usize,
        reason: String,
    },

    #[error("Write broadcast partially failed: {failed} of {total} nodes")]
    WriteBroadcastPartialFailure { failed: usize, total: usize },

    #[error("Unsupported statement: {0}")]
    UnsupportedStatement(String),

    #[error("Driver error on node {node}: {source}")]
    Driver {
        node: String,
        #[source]
        source: DriverError,
    },

    #[error("Command log error: {0}")]
    CommandLogError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalServerError(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalServerError(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::ValidationError(format!("YAML error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
