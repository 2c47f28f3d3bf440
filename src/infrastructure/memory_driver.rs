//! In-memory replica used by tests and the console binary

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::driver::{DriverError, NodeDriver, Row, RowSet};
use crate::sql::classify;

#[derive(Debug, Default)]
struct MemoryState {
    executed: Vec<String>,
    rejected: HashSet<String>,
    /// Remaining successful executions before the replica drops
    fail_after: Option<usize>,
    latency: Duration,
}

/// A replica that records the statements it executes
#[derive(Debug)]
pub struct MemoryDriver {
    name: String,
    available: AtomicBool,
    state: Mutex<MemoryState>,
}

impl MemoryDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: AtomicBool::new(true),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Simulate the replica going offline or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Artificial delay applied to every probe and statement
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Refuse this exact statement from now on
    pub fn reject(&self, statement: impl Into<String>) {
        self.lock().rejected.insert(statement.into());
    }

    /// Go offline after `count` more successful executions
    pub fn fail_after(&self, count: usize) {
        self.lock().fail_after = Some(count);
    }

    /// Every statement executed so far, reads included
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    /// Executed statements that change data, in execution order
    pub fn writes(&self) -> Vec<String> {
        self.lock()
            .executed
            .iter()
            .filter(|sql| classify(sql).is_write())
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // a poisoned test replica is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn latency(&self) -> Duration {
        self.lock().latency
    }

    fn check_available(&self) -> Result<(), DriverError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(DriverError::Unavailable(format!(
                "replica {} is offline",
                self.name
            )))
        }
    }
}

#[async_trait]
impl NodeDriver for MemoryDriver {
    async fn execute(&self, sql: &str) -> Result<RowSet, DriverError> {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.check_available()?;

        let mut state = self.lock();
        if state.rejected.contains(sql) {
            return Err(DriverError::Rejected(format!(
                "replica {} refused statement",
                self.name
            )));
        }

        match state.fail_after {
            Some(0) => {
                state.fail_after = None;
                self.available.store(false, Ordering::SeqCst);
                return Err(DriverError::Unavailable(format!(
                    "replica {} dropped",
                    self.name
                )));
            }
            Some(remaining) => state.fail_after = Some(remaining - 1),
            None => {}
        }

        state.executed.push(sql.to_string());

        if classify(sql).is_read() {
            let mut row = Row::new();
            row.insert("node".to_string(), Value::String(self.name.clone()));
            Ok(vec![row])
        } else {
            Ok(Vec::new())
        }
    }

    async fn probe(&self) -> Result<(), DriverError> {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.check_available()
    }
}
