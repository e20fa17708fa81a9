//! Cluster-state store contract and in-memory implementation.
//!
//! The store holds the replicated `BenchmarkMetaData` document behind a
//! linearizable compare-and-swap and fans out `(previous, current)` change
//! events in commit order per subscriber. Any store with those properties
//! can stand in; `MemStateStore` is the in-process reference used by the
//! tests and the workload driver.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::meta::BenchmarkMetaData;

/// Retry budget for contended metadata updates.
const UPDATE_RETRY_LIMIT: usize = 8;
/// First backoff step; doubled per retry up to [`UPDATE_BACKOFF_MAX`].
const UPDATE_BACKOFF_START: Duration = Duration::from_millis(5);
const UPDATE_BACKOFF_MAX: Duration = Duration::from_millis(200);

/// A versioned read of the document.
#[derive(Debug, Clone)]
pub struct MetaSnapshot {
    pub version: u64,
    pub meta: BenchmarkMetaData,
}

/// One committed change, delivered to every subscriber in commit order.
#[derive(Debug, Clone)]
pub struct MetaChange {
    pub previous: BenchmarkMetaData,
    pub current: BenchmarkMetaData,
    pub version: u64,
}

/// Mutation applied under the store's compare-and-swap.
///
/// Returns `Ok(true)` to commit, `Ok(false)` when the mutation turned out
/// to be a no-op (nothing is committed and no event is delivered). May run
/// more than once when the update races and is retried.
pub type MetaMutator<'a> = &'a (dyn Fn(&mut BenchmarkMetaData) -> anyhow::Result<bool> + Send + Sync);

/// Linearizable, change-notifying holder of the benchmark document.
#[async_trait]
pub trait ClusterStateStore: Send + Sync + 'static {
    /// Current document (possibly empty) with its version.
    async fn read(&self) -> MetaSnapshot;

    /// Apply `mutate` atomically against `expected_version`. Fails with
    /// [`StoreError::Stale`] when the version has moved.
    async fn try_update(
        &self,
        expected_version: u64,
        mutate: MetaMutator<'_>,
    ) -> Result<MetaSnapshot, StoreError>;

    /// Change events in commit order for this subscriber.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<MetaChange>;
}

/// Apply `mutate` with the bounded-backoff retry loop every writer uses.
/// `Stale` is absorbed here; only retry exhaustion or mutator errors escape.
pub async fn update_meta(
    store: &dyn ClusterStateStore,
    mutate: MetaMutator<'_>,
) -> anyhow::Result<MetaSnapshot> {
    let mut backoff = UPDATE_BACKOFF_START;
    for attempt in 0..UPDATE_RETRY_LIMIT {
        let snapshot = store.read().await;
        match store.try_update(snapshot.version, mutate).await {
            Ok(next) => return Ok(next),
            Err(StoreError::Stale { .. }) => {
                tracing::debug!(attempt, "metadata update raced, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(UPDATE_BACKOFF_MAX);
            }
            Err(StoreError::Internal(err)) => return Err(err),
        }
    }
    anyhow::bail!("metadata update still contended after {UPDATE_RETRY_LIMIT} attempts")
}

struct StoreInner {
    version: u64,
    meta: BenchmarkMetaData,
    subscribers: Vec<mpsc::UnboundedSender<MetaChange>>,
}

/// In-memory store: a single mutex guards the document, the version counter
/// and the subscriber fan-out, so events leave in commit order.
pub struct MemStateStore {
    inner: Mutex<StoreInner>,
}

impl MemStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                version: 0,
                meta: BenchmarkMetaData::default(),
                subscribers: Vec::new(),
            }),
        }
    }
}

impl Default for MemStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterStateStore for MemStateStore {
    async fn read(&self) -> MetaSnapshot {
        let inner = self.inner.lock().unwrap();
        MetaSnapshot {
            version: inner.version,
            meta: inner.meta.clone(),
        }
    }

    async fn try_update(
        &self,
        expected_version: u64,
        mutate: MetaMutator<'_>,
    ) -> Result<MetaSnapshot, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.version != expected_version {
            return Err(StoreError::Stale {
                expected: expected_version,
                actual: inner.version,
            });
        }

        let mut next = inner.meta.clone();
        if !mutate(&mut next)? {
            return Ok(MetaSnapshot {
                version: inner.version,
                meta: inner.meta.clone(),
            });
        }

        let previous = std::mem::replace(&mut inner.meta, next);
        inner.version += 1;
        let change = MetaChange {
            previous,
            current: inner.meta.clone(),
            version: inner.version,
        };
        inner
            .subscribers
            .retain(|tx| tx.send(change.clone()).is_ok());

        Ok(MetaSnapshot {
            version: inner.version,
            meta: inner.meta.clone(),
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<MetaChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }
}
