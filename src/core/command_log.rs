//! Command Log Store
//!
//! Per-node FIFO of writes that a node missed while it was not `UP`. Every
//! node's log has two parts: `in_flight` holds a drained batch whose replay is
//! not yet confirmed, `queued` holds everything appended since. The durable
//! file always contains both, in that order, so a crash at any point leaves
//! every unconfirmed write on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// A write captured for later replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub id: Uuid,
    pub statement: String,
    pub node: String,
    pub enqueued_at: DateTime<Utc>,
}

impl CommandEntry {
    pub fn new(node: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            statement: statement.into(),
            node: node.into(),
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct NodeLog {
    in_flight: VecDeque<CommandEntry>,
    queued: VecDeque<CommandEntry>,
}

impl NodeLog {
    fn len(&self) -> usize {
        self.in_flight.len() + self.queued.len()
    }

    fn entries(&self) -> impl Iterator<Item = &CommandEntry> {
        self.in_flight.iter().chain(self.queued.iter())
    }
}

pub struct CommandLogStore {
    logs: Mutex<BTreeMap<String, NodeLog>>,
    path: Option<PathBuf>,
}

impl CommandLogStore {
    /// A store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            logs: Mutex::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Open a durable store, reloading entries left by a previous run
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut logs: BTreeMap<String, NodeLog> = BTreeMap::new();

        if fs::try_exists(&path).await? {
            let content = fs::read(&path).await.map_err(|e| {
                AppError::CommandLogError(format!(
                    "Failed to read command log {}: {}",
                    path.display(),
                    e
                ))
            })?;
            if !content.is_empty() {
                let entries: Vec<CommandEntry> = serde_json::from_slice(&content)
                    .map_err(|e| {
                        AppError::CommandLogError(format!(
                            "Corrupt command log {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                for entry in entries {
                    logs.entry(entry.node.clone())
                        .or_default()
                        .queued
                        .push_back(entry);
                }
            }
            let pending: usize = logs.values().map(NodeLog::len).sum();
            info!(path = %path.display(), pending = pending, "Command log reloaded");
        } else if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        Ok(Self {
            logs: Mutex::new(logs),
            path: Some(path),
        })
    }

    /// Add an entry to the tail of its node's log.
    ///
    /// Returns once the entry is on disk. A persistence failure is reported
    /// but the entry stays queued in memory.
    pub async fn append(&self, entry: CommandEntry) {
        let mut logs = self.logs.lock().await;
        debug!(node = %entry.node, id = %entry.id, "Appending command");
        logs.entry(entry.node.clone())
            .or_default()
            .queued
            .push_back(entry);

        if let Err(e) = self.persist(&logs).await {
            error!(error = %e, "Failed to persist command log after append");
        }
    }

    /// Take every queued entry of `node` for replay.
    ///
    /// The entries move to the in-flight batch and stay on disk until each
    /// one is acknowledged.
    pub async fn drain(&self, node: &str) -> Vec<CommandEntry> {
        let mut logs = self.logs.lock().await;
        let Some(log) = logs.get_mut(node) else {
            return Vec::new();
        };

        let batch: Vec<CommandEntry> = log.queued.drain(..).collect();
        log.in_flight.extend(batch.iter().cloned());
        debug!(node = %node, drained = batch.len(), "Drained command log");
        batch
    }

    /// Confirm that an in-flight entry was executed on its node
    pub async fn acknowledge(&self, node: &str, id: Uuid) -> Result<()> {
        let mut logs = self.logs.lock().await;
        let log = logs.get_mut(node).ok_or_else(|| {
            AppError::CommandLogError(format!("No command log for node {}", node))
        })?;

        let position = log
            .in_flight
            .iter()
            .position(|entry| entry.id == id)
            .ok_or_else(|| {
                AppError::CommandLogError(format!(
                    "Entry {} is not in flight for node {}",
                    id, node
                ))
            })?;
        if position != 0 {
            warn!(node = %node, id = %id, position = position, "Acknowledged entry out of order");
        }
        log.in_flight.remove(position);

        self.persist(&logs).await
    }

    /// Put unconfirmed in-flight entries back ahead of anything queued since.
    ///
    /// The durable order is unchanged, so nothing is rewritten.
    pub async fn requeue(&self, node: &str) -> usize {
        let mut logs = self.logs.lock().await;
        let Some(log) = logs.get_mut(node) else {
            return 0;
        };

        let count = log.in_flight.len();
        while let Some(entry) = log.in_flight.pop_back() {
            log.queued.push_front(entry);
        }
        if count > 0 {
            info!(node = %node, requeued = count, "Re-queued unconfirmed commands");
        }
        count
    }

    /// Every unconfirmed entry of `node`, in execution order
    pub async fn entries(&self, node: &str) -> Vec<CommandEntry> {
        self.logs
            .lock()
            .await
            .get(node)
            .map(|log| log.entries().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, node: &str) -> usize {
        self.logs.lock().await.get(node).map(NodeLog::len).unwrap_or(0)
    }

    pub async fn is_empty(&self, node: &str) -> bool {
        self.len(node).await == 0
    }

    pub async fn total_len(&self) -> usize {
        self.logs.lock().await.values().map(NodeLog::len).sum()
    }

    /// Nodes that still have unconfirmed entries
    pub async fn nodes_with_entries(&self) -> Vec<String> {
        self.logs
            .lock()
            .await
            .iter()
            .filter(|(_, log)| log.len() > 0)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Rewrite the durable file with a temp file and rename.
    ///
    /// Runs under the store lock so rewrites never interleave.
    async fn persist(&self, logs: &BTreeMap<String, NodeLog>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let entries: Vec<&CommandEntry> = logs.values().flat_map(|log| log.entries()).collect();
        let content = serde_json::to_vec_pretty(&entries)?;

        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp).await.map_err(|e| {
            AppError::CommandLogError(format!("Failed to create {}: {}", tmp.display(), e))
        })?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await.map_err(|e| {
            AppError::CommandLogError(format!("Failed to replace {}: {}", path.display(), e))
        })?;
        Ok(())
    }
}
