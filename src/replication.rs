use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AdError;
use crate::models::ad::Ad;

/// Entries the log may keep before trimming the oldest; restore reseeds
/// from the database, so truncation only costs a snapshot read.
pub const DEFAULT_LOG_MAX_LEN: usize = 100_000;

/// Payload of a replication log entry. `request_id` ties the entry back to
/// the caller waiting on the originating replica; other replicas have no
/// channel registered under it and apply silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogPayload {
    Create { request_id: Uuid, ad: Ad },
    Delete { request_id: Uuid, ad_id: Uuid },
}

/// One entry of the ordered stream. The stream id is `0-<version>`, so an
/// entry's position and the version it carries are the same number.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub version: u64,
    pub payload: LogPayload,
}

impl LogEntry {
    pub fn stream_id(&self) -> String {
        format_stream_id(self.version)
    }
}

pub fn format_stream_id(version: u64) -> String {
    format!("0-{version}")
}

pub fn parse_stream_id(id: &str) -> Option<u64> {
    id.strip_prefix("0-")?.parse().ok()
}

/// Append-only ordered stream with caller-chosen ids.
#[async_trait]
pub trait ReplicationLog: Send + Sync {
    /// Append at id `0-<version>`. Ids must be strictly increasing; an
    /// out-of-order append is rejected so a lost lock cannot reorder the
    /// stream.
    async fn append(&self, version: u64, payload: LogPayload) -> Result<(), AdError>;

    /// Read up to `count` entries with ids after `0-<after>`, blocking up to
    /// `block` when nothing newer exists yet. An empty result is an ordinary
    /// outcome, not an error.
    async fn read_after(
        &self,
        after: u64,
        block: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>, AdError>;
}

/// In-process replication stream: a capped deque plus a wakeup for blocked
/// readers. Single-replica deployments and tests run on this; a Redis
/// stream implements the same trait for multi-replica setups.
pub struct InMemoryLog {
    entries: Mutex<VecDeque<LogEntry>>,
    notify: Notify,
    max_len: usize,
}

impl InMemoryLog {
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_len,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, as if the stream had been trimmed away entirely.
    pub fn truncate_all(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[async_trait]
impl ReplicationLog for InMemoryLog {
    async fn append(&self, version: u64, payload: LogPayload) -> Result<(), AdError> {
        {
            let mut entries = self.entries.lock().unwrap();
            let last = entries.back().map(|e| e.version).unwrap_or(0);
            if version <= last {
                return Err(AdError::Log(format!(
                    "out-of-order append: id 0-{version} after 0-{last}"
                )));
            }
            entries.push_back(LogEntry { version, payload });
            while entries.len() > self.max_len {
                entries.pop_front();
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn read_after(
        &self,
        after: u64,
        block: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>, AdError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.notify.notified();
            {
                let entries = self.entries.lock().unwrap();
                let batch: Vec<LogEntry> = entries
                    .iter()
                    .skip_while(|e| e.version <= after)
                    .take(count)
                    .cloned()
                    .collect();
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }
}
