use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ad_service::AdService;
use crate::error::AdError;

/// Task id of the deferred delete scheduled for an ad; idempotent enqueues
/// and cancels key off this.
pub fn delete_task_id(ad_id: Uuid) -> String {
    format!("event:delete-{ad_id}")
}

/// Payload of the deferred delete task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteAdPayload {
    pub ad_id: Uuid,
}

/// Deferred-task queue with at-least-once delivery. `process_at` instants
/// are UTC throughout; scheduling is never done in local time.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Idempotent on `task_id`: enqueueing an id that is already pending
    /// succeeds without changing the stored task.
    async fn enqueue(
        &self,
        task_id: &str,
        payload: serde_json::Value,
        process_at: DateTime<Utc>,
    ) -> Result<(), AdError>;

    /// Idempotent: deleting an unknown id succeeds.
    async fn delete(&self, task_id: &str) -> Result<(), AdError>;
}

/// Consumes due tasks. A failed invocation leaves the task pending, so
/// delivery is at-least-once and handlers must tolerate replays.
#[async_trait]
pub trait TaskConsumer: Send + Sync {
    async fn process(&self, task_id: &str, payload: serde_json::Value) -> Result<(), AdError>;
}

struct PendingTask {
    payload: serde_json::Value,
    process_at: DateTime<Utc>,
}

/// In-process deferred-task queue scanned by a background worker. An
/// asynq-style Redis queue implements the same trait in multi-replica
/// deployments.
#[derive(Default)]
pub struct InProcessTaskQueue {
    pending: DashMap<String, PendingTask>,
}

impl InProcessTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks not yet processed.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.pending.contains_key(task_id)
    }

    async fn drain_due(&self, consumer: &Arc<dyn TaskConsumer>) {
        let now = Utc::now();
        let due: Vec<(String, serde_json::Value)> = self
            .pending
            .iter()
            .filter(|e| e.value().process_at <= now)
            .map(|e| (e.key().clone(), e.value().payload.clone()))
            .collect();
        for (task_id, payload) in due {
            match consumer.process(&task_id, payload).await {
                Ok(()) => {
                    self.pending.remove(&task_id);
                }
                Err(e) => {
                    tracing::warn!("deferred task {task_id} failed, will retry: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl TaskQueue for InProcessTaskQueue {
    async fn enqueue(
        &self,
        task_id: &str,
        payload: serde_json::Value,
        process_at: DateTime<Utc>,
    ) -> Result<(), AdError> {
        self.pending
            .entry(task_id.to_string())
            .or_insert(PendingTask {
                payload,
                process_at,
            });
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<(), AdError> {
        self.pending.remove(task_id);
        Ok(())
    }
}

/// Spawn the queue's scan loop; it stops when the shutdown signal fires.
pub fn spawn_worker(
    queue: Arc<InProcessTaskQueue>,
    consumer: Arc<dyn TaskConsumer>,
    scan_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(scan_interval);
        tracing::info!("expiry worker started");
        loop {
            tokio::select! {
                _ = interval.tick() => queue.drain_due(&consumer).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("expiry worker stopped");
    })
}

/// Deletes the ad named by the payload when its end time arrives. Losing
/// the race with an explicit delete leaves no active row, which the write
/// path reports as success.
pub struct DeleteAdConsumer {
    pub ads: Arc<AdService>,
}

#[async_trait]
impl TaskConsumer for DeleteAdConsumer {
    async fn process(&self, task_id: &str, payload: serde_json::Value) -> Result<(), AdError> {
        let payload: DeleteAdPayload = serde_json::from_value(payload)
            .map_err(|e| AdError::Internal(format!("bad payload for task {task_id}: {e}")))?;
        self.ads.delete_ad(payload.ad_id).await
    }
}
