use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, oneshot, watch};
use uuid::Uuid;

use crate::db::AdDb;
use crate::dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher};
use crate::error::AdError;
use crate::expiry::{DeleteAdPayload, TaskQueue, delete_task_id};
use crate::lock::{DistributedLock, LockOptions};
use crate::models::ad::{Ad, CreateAdRequest, GetAdRequest};
use crate::replication::{LogPayload, ReplicationLog, format_stream_id};

/// Consecutive replication-read failures tolerated before Subscribe hands
/// the error to the Run harness for a backed-off restart.
const MAX_READ_FAILURES: u32 = 3;

/// Write-path and replication tuning.
#[derive(Debug, Clone)]
pub struct AdServiceConfig {
    pub lock_key: String,
    pub stream_name: String,
    pub lock_ttl: Duration,
    pub lock_retry_budget: u32,
    pub read_block: Duration,
    pub read_batch: usize,
    pub request_timeout: Duration,
    pub run_attempts: u32,
}

impl Default for AdServiceConfig {
    fn default() -> Self {
        Self {
            lock_key: "lock:ad".into(),
            stream_name: "ad".into(),
            lock_ttl: Duration::from_millis(100),
            lock_retry_budget: 10,
            read_block: Duration::from_secs(3),
            read_batch: 10,
            request_timeout: Duration::from_secs(3),
            run_attempts: 5,
        }
    }
}

/// Orchestrates the write path (lock → DB → log → expiry task), cold-start
/// restore, and the replication tail feeding the dispatcher.
///
/// A caller's ack never comes from the write path itself: the created or
/// deleted ad reaches memory only through the log tail, and the dispatcher
/// notifies the response channel registered under the request id the log
/// entry carries. On every other replica that id has no channel and the
/// apply is silent.
pub struct AdService {
    dispatcher: Dispatcher,
    db: Arc<AdDb>,
    log: Arc<dyn ReplicationLog>,
    locker: Arc<dyn DistributedLock>,
    tasks: Arc<dyn TaskQueue>,
    cfg: AdServiceConfig,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl AdService {
    pub fn new(
        dispatcher: Dispatcher,
        db: Arc<AdDb>,
        log: Arc<dyn ReplicationLog>,
        locker: Arc<dyn DistributedLock>,
        tasks: Arc<dyn TaskQueue>,
        cfg: AdServiceConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            dispatcher,
            db,
            log,
            locker,
            tasks,
            cfg,
            shutdown: AtomicBool::new(false),
            shutdown_tx,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    /// Version of the last log entry folded into memory.
    pub fn applied_version(&self) -> u64 {
        self.dispatcher.applied_version()
    }

    /// Receiver that flips to `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn lock_options(&self) -> LockOptions {
        LockOptions {
            ttl: self.cfg.lock_ttl,
            retry_budget: self.cfg.lock_retry_budget,
        }
    }

    fn begin_request(&self) -> Result<(), AdError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(AdError::Internal("service is shutting down".into()));
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn end_request(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Validate, persist under the distributed lock with the next version,
    /// publish, schedule expiry, and wait for the local apply.
    pub async fn create_ad(&self, req: CreateAdRequest) -> Result<Uuid, AdError> {
        req.validate()?;
        let ad = req.into_ad(Utc::now());
        self.begin_request()?;
        let result = self.create_inner(ad).await;
        self.end_request();
        result
    }

    async fn create_inner(&self, mut ad: Ad) -> Result<Uuid, AdError> {
        let request_id = Uuid::new_v4();
        let ack = self.dispatcher.register(request_id);

        let lock = match self.locker.obtain(&self.cfg.lock_key, &self.lock_options()).await {
            Ok(lock) => lock,
            Err(e) => {
                self.dispatcher.cancel(request_id);
                return Err(e);
            }
        };

        let inserted = match self.db.insert_with_next_version(&mut ad) {
            Ok(inserted) => inserted,
            Err(e) => {
                lock.release().await;
                self.dispatcher.cancel(request_id);
                return Err(e);
            }
        };
        let Some(version) = inserted else {
            // Retry of a create that already committed; nothing new to
            // publish or apply.
            lock.release().await;
            self.dispatcher.cancel(request_id);
            return Ok(ad.id);
        };

        let payload = LogPayload::Create {
            request_id,
            ad: ad.clone(),
        };
        if let Err(e) = self.log.append(version, payload).await {
            // The row is committed; the DB is the source of truth and the
            // index converges through Restore on the next Run attempt.
            tracing::error!(
                "log append for ad {} at {} failed: {e}",
                ad.id,
                format_stream_id(version)
            );
        }
        lock.release().await;

        match serde_json::to_value(DeleteAdPayload { ad_id: ad.id }) {
            Ok(expiry_payload) => {
                if let Err(e) = self
                    .tasks
                    .enqueue(&delete_task_id(ad.id), expiry_payload, ad.end_at)
                    .await
                {
                    tracing::warn!("could not schedule expiry for ad {}: {e}", ad.id);
                }
            }
            Err(e) => tracing::warn!("could not encode expiry payload for ad {}: {e}", ad.id),
        }

        match self.wait_for_ack(request_id, ack).await? {
            DispatchOutcome::Created { ad_id } => Ok(ad_id),
            DispatchOutcome::Failed(e) => Err(e),
            _ => Err(AdError::Internal("unexpected dispatcher response".into())),
        }
    }

    /// Tombstone the ad under the distributed lock, publish the delete,
    /// cancel its pending expiry task, and wait for the local apply.
    /// Deleting an ad with no active row is success.
    pub async fn delete_ad(&self, ad_id: Uuid) -> Result<(), AdError> {
        self.begin_request()?;
        let result = self.delete_inner(ad_id).await;
        self.end_request();
        result
    }

    async fn delete_inner(&self, ad_id: Uuid) -> Result<(), AdError> {
        let request_id = Uuid::new_v4();
        let ack = self.dispatcher.register(request_id);

        let lock = match self.locker.obtain(&self.cfg.lock_key, &self.lock_options()).await {
            Ok(lock) => lock,
            Err(e) => {
                self.dispatcher.cancel(request_id);
                return Err(e);
            }
        };

        let tombstoned = match self.db.tombstone_with_next_version(ad_id) {
            Ok(tombstoned) => tombstoned,
            Err(e) => {
                lock.release().await;
                self.dispatcher.cancel(request_id);
                return Err(e);
            }
        };
        let Some(version) = tombstoned else {
            // Already deleted or expired; idempotent success.
            lock.release().await;
            self.dispatcher.cancel(request_id);
            return Ok(());
        };

        let payload = LogPayload::Delete { request_id, ad_id };
        if let Err(e) = self.log.append(version, payload).await {
            tracing::error!(
                "log append for delete of {ad_id} at {} failed: {e}",
                format_stream_id(version)
            );
        }
        lock.release().await;

        if let Err(e) = self.tasks.delete(&delete_task_id(ad_id)).await {
            tracing::warn!("could not cancel expiry task for ad {ad_id}: {e}");
        }

        match self.wait_for_ack(request_id, ack).await? {
            DispatchOutcome::Deleted => Ok(()),
            DispatchOutcome::Failed(e) => Err(e),
            _ => Err(AdError::Internal("unexpected dispatcher response".into())),
        }
    }

    async fn wait_for_ack(
        &self,
        request_id: Uuid,
        ack: oneshot::Receiver<DispatchOutcome>,
    ) -> Result<DispatchOutcome, AdError> {
        match tokio::time::timeout(self.cfg.request_timeout, ack).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(AdError::Internal("dispatcher dropped the request".into())),
            Err(_) => {
                self.dispatcher.cancel(request_id);
                Err(AdError::Timeout)
            }
        }
    }

    /// Serve a read from the in-memory index via the dispatcher.
    pub async fn get_ads(&self, req: &GetAdRequest) -> Result<(Vec<Ad>, usize), AdError> {
        let profile = req.profile()?;
        self.begin_request()?;
        let request_id = Uuid::new_v4();
        let outcome = self
            .dispatcher
            .roundtrip(
                request_id,
                DispatchRequest::Query {
                    request_id,
                    profile,
                },
                self.cfg.request_timeout,
            )
            .await;
        self.end_request();
        match outcome? {
            DispatchOutcome::Ads { ads, total } => Ok((ads, total)),
            DispatchOutcome::Failed(e) => Err(e),
            _ => Err(AdError::Internal("unexpected dispatcher response".into())),
        }
    }

    /// Rebuild the in-memory store from the DB and return the version the
    /// replication tail should resume from.
    pub async fn restore(&self) -> Result<u64, AdError> {
        let (applied, ads) = self.db.snapshot()?;
        let count = ads.len();
        let request_id = Uuid::new_v4();
        let outcome = self
            .dispatcher
            .roundtrip(
                request_id,
                DispatchRequest::ApplyBatch {
                    request_id,
                    ads,
                    floor_version: applied,
                },
                self.cfg.request_timeout,
            )
            .await?;
        match outcome {
            DispatchOutcome::BatchApplied { applied_version } => {
                tracing::info!("restored {count} ads, applied version {applied_version}");
                Ok(applied_version)
            }
            DispatchOutcome::Failed(e) => Err(e),
            _ => Err(AdError::Internal("unexpected dispatcher response".into())),
        }
    }

    /// Tail the replication stream from `from`, feeding each newer entry to
    /// the dispatcher and advancing only after the apply is acked. Returns
    /// `Ok` on shutdown; returns an error only after repeated read failures
    /// so the Run harness can back off and re-restore.
    pub async fn subscribe(&self, from: u64) -> Result<(), AdError> {
        let mut last = from;
        let mut failures = 0u32;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tracing::info!(
            "tailing replication stream '{}' from id {}",
            self.cfg.stream_name,
            format_stream_id(last)
        );

        while !self.shutdown.load(Ordering::Acquire) {
            let read = tokio::select! {
                read = self.log.read_after(last, self.cfg.read_block, self.cfg.read_batch) => read,
                _ = shutdown_rx.changed() => break,
            };
            let entries = match read {
                Ok(entries) => {
                    failures = 0;
                    entries
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("replication read failed ({failures}/{MAX_READ_FAILURES}): {e}");
                    if failures >= MAX_READ_FAILURES {
                        return Err(e);
                    }
                    continue;
                }
            };

            for entry in entries {
                let version = entry.version;
                if version <= self.applied_version() {
                    // Already folded in via Restore.
                    last = version;
                    continue;
                }
                let (ack_tx, ack_rx) = oneshot::channel();
                let req = match entry.payload {
                    LogPayload::Create { request_id, ad } => DispatchRequest::ApplyCreate {
                        request_id,
                        ad,
                        applied: Some(ack_tx),
                    },
                    LogPayload::Delete { request_id, ad_id } => DispatchRequest::ApplyDelete {
                        request_id,
                        ad_id,
                        version,
                        applied: Some(ack_tx),
                    },
                };
                self.dispatcher.send(req)?;
                match ack_rx.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        // The entry is consumed either way; the store has
                        // advanced its applied version past it.
                        tracing::error!(
                            "apply of log entry {} failed: {e}",
                            format_stream_id(version)
                        );
                    }
                    Err(_) => {
                        return Err(AdError::Internal("dispatcher stopped".into()));
                    }
                }
                last = version;
            }
        }
        Ok(())
    }

    /// Restore-then-subscribe inside an exponential-backoff harness.
    pub async fn run(&self) {
        let mut backoff = Duration::from_millis(100);
        for attempt in 1..=self.cfg.run_attempts {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            match self.restore().await {
                Ok(applied) => match self.subscribe(applied).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::error!("replication tail failed (attempt {attempt}): {e}")
                    }
                },
                Err(e) => tracing::error!("restore failed (attempt {attempt}): {e}"),
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
        tracing::error!(
            "ad service gave up after {} run attempts",
            self.cfg.run_attempts
        );
    }

    /// Begin shutdown: stop accepting requests, wake the replication tail
    /// and expiry worker, then wait for in-flight requests to drain within
    /// the deadline.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), AdError> {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        let drain = async {
            loop {
                if self.in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
                let notified = self.drained.notified();
                if self.in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, drain)
            .await
            .map_err(|_| AdError::DeadlineExceeded)
    }
}
