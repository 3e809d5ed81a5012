use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use crate::error::AdError;
use crate::index::MultiAttrIndex;
use crate::models::ad::{Ad, QueryProfile};

/// In-memory ad store: the multi-attribute index plus an id map for delete
/// lookups, guarded by a single read-write lock.
///
/// `applied_version` is the id of the last replication log entry folded into
/// memory; it never decreases. Mutations arriving at or below it are replays
/// and are dropped silently.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    applied_version: AtomicU64,
}

struct Inner {
    ads: HashMap<Uuid, Ad>,
    index: MultiAttrIndex,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                ads: HashMap::new(),
                index: MultiAttrIndex::new(),
            }),
            applied_version: AtomicU64::new(0),
        }
    }

    pub fn applied_version(&self) -> u64 {
        self.applied_version.load(Ordering::Acquire)
    }

    /// Number of ads currently resident.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().ads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fold a create into memory. A version at or below `applied_version`
    /// was already applied (restore overlap or log replay) and is dropped.
    pub fn apply_create(&self, ad: Ad) -> Result<(), AdError> {
        if ad.version <= self.applied_version() {
            tracing::debug!(
                "dropping replayed create for ad {} at version {}",
                ad.id,
                ad.version
            );
            return Ok(());
        }
        let mut inner = self.inner.write().unwrap();
        inner.index.insert(&ad);
        let version = ad.version;
        inner.ads.insert(ad.id, ad);
        self.applied_version.store(version, Ordering::Release);
        Ok(())
    }

    /// Fold a delete into memory. The prior ad's stored predicates drive the
    /// index removal; a delete for an ad this replica never held still
    /// advances the applied version so the tail does not loop on it.
    pub fn apply_delete(&self, ad_id: Uuid, tombstone_version: u64) -> Result<(), AdError> {
        if tombstone_version <= self.applied_version() {
            tracing::debug!(
                "dropping replayed delete for ad {ad_id} at version {tombstone_version}"
            );
            return Ok(());
        }
        let mut inner = self.inner.write().unwrap();
        let removed = match inner.ads.remove(&ad_id) {
            Some(ad) => inner.index.remove(&ad),
            None => {
                tracing::debug!("delete for unknown ad {ad_id} at version {tombstone_version}");
                Ok(())
            }
        };
        self.applied_version
            .store(tombstone_version, Ordering::Release);
        removed
    }

    /// Atomic batch insert used by restore. `floor_version` carries the DB's
    /// `MAX(version)`, which can exceed the newest active ad's version when
    /// the newest row is a tombstone.
    pub fn apply_batch(&self, ads: Vec<Ad>, floor_version: u64) -> Result<(), AdError> {
        let mut inner = self.inner.write().unwrap();
        let mut applied = self.applied_version().max(floor_version);
        for ad in ads {
            applied = applied.max(ad.version);
            inner.index.insert(&ad);
            inner.ads.insert(ad.id, ad);
        }
        self.applied_version.store(applied, Ordering::Release);
        Ok(())
    }

    /// Answer a read under the shared hold.
    pub fn query(&self, profile: &QueryProfile) -> Result<(Vec<Ad>, usize), AdError> {
        let inner = self.inner.read().unwrap();
        let (ids, total) = inner.index.query(profile)?;
        let mut ads = Vec::with_capacity(ids.len());
        for id in ids {
            match inner.ads.get(&id) {
                Some(ad) => ads.push(ad.clone()),
                None => {
                    return Err(AdError::Internal(format!(
                        "ad {id} is indexed but missing from the store"
                    )));
                }
            }
        }
        Ok((ads, total))
    }
}
