use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::AdError;
use crate::models::ad::{Ad, QueryProfile};
use crate::store::InMemoryStore;

/// Completion signal for the replication tail: fires once the mutation has
/// been folded into the store, regardless of whether a caller is waiting.
pub type AppliedAck = oneshot::Sender<Result<(), AdError>>;

/// Work items consumed by the dispatcher task.
pub enum DispatchRequest {
    ApplyCreate {
        request_id: Uuid,
        ad: Ad,
        applied: Option<AppliedAck>,
    },
    ApplyDelete {
        request_id: Uuid,
        ad_id: Uuid,
        version: u64,
        applied: Option<AppliedAck>,
    },
    ApplyBatch {
        request_id: Uuid,
        ads: Vec<Ad>,
        floor_version: u64,
    },
    Query {
        request_id: Uuid,
        profile: QueryProfile,
    },
}

/// Reply delivered to a waiting caller through the response map.
#[derive(Debug)]
pub enum DispatchOutcome {
    Created { ad_id: Uuid },
    Deleted,
    BatchApplied { applied_version: u64 },
    Ads { ads: Vec<Ad>, total: usize },
    Failed(AdError),
}

/// Single-writer dispatcher over the in-memory store.
///
/// One task consumes the request channel: mutations are applied inline, in
/// arrival order; queries are fanned out to per-query tasks that read under
/// the store's shared lock, so a slow read never stalls the write stream.
/// Responses go through a per-request channel registered in `pending`; a
/// request whose entry was removed (caller timed out) completes silently.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<DispatchRequest>,
    shared: Arc<Shared>,
}

struct Shared {
    pending: DashMap<Uuid, oneshot::Sender<DispatchOutcome>>,
    store: Arc<InMemoryStore>,
    running: AtomicBool,
}

impl Dispatcher {
    /// Spawn the consumer task. The task exits once every `Dispatcher`
    /// clone has been dropped and the channel drained.
    pub fn spawn(store: Arc<InMemoryStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            store,
            running: AtomicBool::new(true),
        });
        tokio::spawn(consume(rx, shared.clone()));
        Self { tx, shared }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn applied_version(&self) -> u64 {
        self.shared.store.applied_version()
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.shared.store
    }

    /// Register interest in the response for `request_id`.
    pub fn register(&self, request_id: Uuid) -> oneshot::Receiver<DispatchOutcome> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(request_id, tx);
        rx
    }

    /// Withdraw interest; a late response for this id is discarded.
    pub fn cancel(&self, request_id: Uuid) {
        self.shared.pending.remove(&request_id);
    }

    pub fn send(&self, req: DispatchRequest) -> Result<(), AdError> {
        self.tx
            .send(req)
            .map_err(|_| AdError::Internal("dispatcher is not running".into()))
    }

    /// Register, send, and wait for the response with a deadline. On timeout
    /// the registration is removed so the dispatcher drops the late result.
    pub async fn roundtrip(
        &self,
        request_id: Uuid,
        req: DispatchRequest,
        timeout: std::time::Duration,
    ) -> Result<DispatchOutcome, AdError> {
        let rx = self.register(request_id);
        if let Err(e) = self.send(req) {
            self.cancel(request_id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(AdError::Internal(
                "dispatcher dropped the request".into(),
            )),
            Err(_) => {
                self.cancel(request_id);
                Err(AdError::Timeout)
            }
        }
    }
}

async fn consume(mut rx: mpsc::UnboundedReceiver<DispatchRequest>, shared: Arc<Shared>) {
    tracing::info!("dispatcher started");
    while let Some(req) = rx.recv().await {
        match req {
            DispatchRequest::Query {
                request_id,
                profile,
            } => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let outcome = match shared.store.query(&profile) {
                        Ok((ads, total)) => DispatchOutcome::Ads { ads, total },
                        Err(e) => DispatchOutcome::Failed(e),
                    };
                    shared.complete(request_id, outcome);
                });
            }
            mutation => shared.apply(mutation),
        }
    }
    shared.running.store(false, Ordering::Release);
    tracing::info!("dispatcher stopped");
}

impl Shared {
    /// Deliver `outcome` to the registered waiter, if any is left.
    fn complete(&self, request_id: Uuid, outcome: DispatchOutcome) {
        if let Some((_, tx)) = self.pending.remove(&request_id) {
            let _ = tx.send(outcome);
        }
    }

    fn apply(&self, req: DispatchRequest) {
        match req {
            DispatchRequest::ApplyCreate {
                request_id,
                ad,
                applied,
            } => {
                let ad_id = ad.id;
                let result = self.store.apply_create(ad);
                match &result {
                    Ok(()) => self.complete(request_id, DispatchOutcome::Created { ad_id }),
                    Err(e) => {
                        tracing::error!("apply create for ad {ad_id} failed: {e}");
                        self.complete(
                            request_id,
                            DispatchOutcome::Failed(AdError::Internal(e.to_string())),
                        );
                    }
                }
                if let Some(ack) = applied {
                    let _ = ack.send(result);
                }
            }
            DispatchRequest::ApplyDelete {
                request_id,
                ad_id,
                version,
                applied,
            } => {
                let result = self.store.apply_delete(ad_id, version);
                match &result {
                    Ok(()) => self.complete(request_id, DispatchOutcome::Deleted),
                    Err(e) => {
                        tracing::error!("apply delete for ad {ad_id} failed: {e}");
                        self.complete(
                            request_id,
                            DispatchOutcome::Failed(AdError::Internal(e.to_string())),
                        );
                    }
                }
                if let Some(ack) = applied {
                    let _ = ack.send(result);
                }
            }
            DispatchRequest::ApplyBatch {
                request_id,
                ads,
                floor_version,
            } => {
                let outcome = match self.store.apply_batch(ads, floor_version) {
                    Ok(()) => DispatchOutcome::BatchApplied {
                        applied_version: self.store.applied_version(),
                    },
                    Err(e) => {
                        tracing::error!("apply batch failed: {e}");
                        DispatchOutcome::Failed(AdError::Internal(e.to_string()))
                    }
                };
                self.complete(request_id, outcome);
            }
            DispatchRequest::Query { .. } => unreachable!("queries are fanned out by the consumer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{mock_ad, mock_profile};
    use std::time::Duration;

    #[tokio::test]
    async fn create_then_query_roundtrip() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::spawn(store);

        let ad = mock_ad(1);
        let request_id = Uuid::new_v4();
        let outcome = dispatcher
            .roundtrip(
                request_id,
                DispatchRequest::ApplyCreate {
                    request_id,
                    ad: ad.clone(),
                    applied: None,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::Created { ad_id } => assert_eq!(ad_id, ad.id),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(dispatcher.applied_version(), 1);

        let request_id = Uuid::new_v4();
        let outcome = dispatcher
            .roundtrip(
                request_id,
                DispatchRequest::Query {
                    request_id,
                    profile: mock_profile(),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::Ads { ads, total } => {
                assert_eq!(total, 1);
                assert_eq!(ads[0].id, ad.id);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mutations_apply_in_arrival_order() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::spawn(store);

        let mut acks = Vec::new();
        for version in 1..=20u64 {
            let (tx, rx) = oneshot::channel();
            dispatcher
                .send(DispatchRequest::ApplyCreate {
                    request_id: Uuid::new_v4(),
                    ad: mock_ad(version),
                    applied: Some(tx),
                })
                .unwrap();
            acks.push(rx);
        }
        for ack in acks {
            ack.await.unwrap().unwrap();
        }
        assert_eq!(dispatcher.applied_version(), 20);
        assert_eq!(dispatcher.store().len(), 20);
    }

    #[tokio::test]
    async fn applied_ack_fires_without_a_registered_waiter() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::spawn(store);

        let (tx, rx) = oneshot::channel();
        dispatcher
            .send(DispatchRequest::ApplyCreate {
                request_id: Uuid::new_v4(),
                ad: mock_ad(1),
                applied: Some(tx),
            })
            .unwrap();
        rx.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancelled_request_is_dropped_silently() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::spawn(store.clone());

        store.apply_create(mock_ad(1)).unwrap();

        let request_id = Uuid::new_v4();
        let _rx = dispatcher.register(request_id);
        dispatcher.cancel(request_id);
        dispatcher
            .send(DispatchRequest::Query {
                request_id,
                profile: mock_profile(),
            })
            .unwrap();

        // Give the query task a chance to complete against the empty map.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.is_running());
    }

    #[tokio::test]
    async fn batch_reports_the_applied_version() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::spawn(store);

        let request_id = Uuid::new_v4();
        let outcome = dispatcher
            .roundtrip(
                request_id,
                DispatchRequest::ApplyBatch {
                    request_id,
                    ads: vec![mock_ad(1), mock_ad(2)],
                    floor_version: 4,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::BatchApplied { applied_version } => assert_eq!(applied_version, 4),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn queries_run_while_mutations_continue() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::spawn(store);

        for version in 1..=50u64 {
            dispatcher
                .send(DispatchRequest::ApplyCreate {
                    request_id: Uuid::new_v4(),
                    ad: mock_ad(version),
                    applied: None,
                })
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..50 {
            let d = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                let request_id = Uuid::new_v4();
                d.roundtrip(
                    request_id,
                    DispatchRequest::Query {
                        request_id,
                        profile: mock_profile(),
                    },
                    Duration::from_secs(1),
                )
                .await
            }));
        }
        for h in handles {
            let outcome = h.await.unwrap().unwrap();
            assert!(matches!(
                outcome,
                DispatchOutcome::Ads { .. } | DispatchOutcome::Failed(AdError::NoAdsFound)
            ));
        }
    }
}
