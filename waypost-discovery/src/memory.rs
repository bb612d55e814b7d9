//! In-memory coordination store (for testing/development)
//!
//! Behaves like a single etcd member: leases expire when they are not
//! renewed, expiry deletes the attached keys and notifies watchers, and a
//! keepalive stream renews its lease only while it is being polled.

use crate::store::{
    KeepAliveAck, KeepAliveStream, KeyValue, KvStore, LeaseId, StoreError, WatchEvent,
    WatchEventKind, WatchStream,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::time::Instant;
use tracing::debug;

/// Upper bound between two expiry sweeps of an open watch
const REAP_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_BUFFER: usize = 1024;

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: i64,
}

struct Inner {
    state: RwLock<State>,
    events: broadcast::Sender<WatchEvent>,
    unavailable: AtomicBool,
    epoch: watch::Sender<u64>,
}

/// In-memory [`KvStore`] with store-enforced lease expiry
///
/// ```
/// use waypost_discovery::{InMemoryStore, KvStore};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryStore::new();
/// let lease = store.grant_lease(10).await.unwrap();
/// store.put("/services/api/1", b"{}".to_vec(), Some(lease)).await.unwrap();
///
/// let found = store.get_prefix("/services/api/").await.unwrap();
/// assert_eq!(found[0].key, "/services/api/1");
///
/// store.revoke_lease(lease).await.unwrap();
/// assert!(store.is_empty().await);
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (epoch, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                events,
                unavailable: AtomicBool::new(false),
                epoch,
            }),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// End every open watch stream, as a dropped connection would
    pub fn disconnect_watchers(&self) {
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        self.inner.purge_expired().await;
        self.inner.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of live leases
    pub async fn lease_count(&self) -> usize {
        self.inner.purge_expired().await;
        self.inner.state.read().await.leases.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn notify(&self, kind: WatchEventKind, key: String, value: Vec<u8>) {
        // No receivers is fine
        let _ = self.events.send(WatchEvent { kind, key, value });
    }

    /// Drop expired leases together with their keys
    async fn purge_expired(&self) {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            debug!(lease = %id, "lease expired");
            remove_lease(&mut state, id, self);
        }
    }

    async fn next_deadline(&self) -> Option<Instant> {
        let state = self.state.read().await;
        state.leases.values().map(|lease| lease.deadline).min()
    }

    async fn renew(&self, id: LeaseId) -> Result<KeepAliveAck, StoreError> {
        self.check()?;
        self.purge_expired().await;

        let mut state = self.state.write().await;
        let lease = state.leases.get_mut(&id).ok_or(StoreError::LeaseExpired(id))?;
        lease.deadline = Instant::now() + lease.ttl;

        Ok(KeepAliveAck {
            lease: id,
            ttl: lease.ttl.as_secs() as i64,
        })
    }
}

fn remove_lease(state: &mut State, id: LeaseId, inner: &Inner) -> bool {
    let Some(lease) = state.leases.remove(&id) else {
        return false;
    };

    for key in lease.keys {
        let owned = state
            .entries
            .get(&key)
            .is_some_and(|entry| entry.lease == Some(id));
        if owned {
            state.entries.remove(&key);
            inner.notify(WatchEventKind::Delete, key, Vec::new());
        }
    }

    true
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.inner.check()?;
        self.inner.purge_expired().await;

        let state = self.inner.state.read().await;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
        self.inner.check()?;
        self.inner.purge_expired().await;

        let mut state = self.inner.state.write().await;

        if let Some(id) = lease {
            let lease = state.leases.get_mut(&id).ok_or(StoreError::LeaseExpired(id))?;
            lease.keys.insert(key.to_string());
        }

        let previous = state.entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );

        if let Some(old) = previous.and_then(|entry| entry.lease).filter(|old| Some(*old) != lease) {
            if let Some(old_lease) = state.leases.get_mut(&old) {
                old_lease.keys.remove(key);
            }
        }

        self.inner.notify(WatchEventKind::Put, key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.check()?;
        self.inner.purge_expired().await;

        let mut state = self.inner.state.write().await;
        if let Some(entry) = state.entries.remove(key) {
            if let Some(lease) = entry.lease.and_then(|id| state.leases.get_mut(&id)) {
                lease.keys.remove(key);
            }
            self.inner.notify(WatchEventKind::Delete, key.to_string(), Vec::new());
        }

        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        self.inner.check()?;

        let watcher = Watcher {
            inner: self.inner.clone(),
            events: self.inner.events.subscribe(),
            epoch: self.inner.epoch.subscribe(),
            prefix: prefix.to_string(),
            done: false,
        };

        Ok(futures::stream::unfold(watcher, Watcher::next).boxed())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        self.inner.check()?;
        self.inner.purge_expired().await;

        let ttl = Duration::from_secs(ttl_secs.max(1) as u64);
        let mut state = self.inner.state.write().await;
        state.next_lease += 1;
        let id = LeaseId(state.next_lease);

        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );

        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        self.inner.check()?;
        self.inner.purge_expired().await;

        let ttl = {
            let state = self.inner.state.read().await;
            state.leases.get(&lease).ok_or(StoreError::LeaseExpired(lease))?.ttl
        };

        let renewer = Renewer {
            inner: self.inner.clone(),
            lease,
            interval: (ttl / 3).max(Duration::from_millis(10)),
            first: true,
            done: false,
        };

        Ok(futures::stream::unfold(renewer, Renewer::next).boxed())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.inner.check()?;
        self.inner.purge_expired().await;

        let mut state = self.inner.state.write().await;
        if remove_lease(&mut state, lease, &self.inner) {
            Ok(())
        } else {
            Err(StoreError::LeaseExpired(lease))
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct Renewer {
    inner: Arc<Inner>,
    lease: LeaseId,
    interval: Duration,
    first: bool,
    done: bool,
}

impl Renewer {
    async fn next(mut self) -> Option<(Result<KeepAliveAck, StoreError>, Self)> {
        if self.done {
            return None;
        }

        if self.first {
            self.first = false;
        } else {
            tokio::time::sleep(self.interval).await;
        }

        let ack = self.inner.renew(self.lease).await;
        if ack.is_err() {
            self.done = true;
        }
        Some((ack, self))
    }
}

enum WatchStep {
    Event(WatchEvent),
    Lagged(u64),
    Sweep,
    Skip,
    End,
}

struct Watcher {
    inner: Arc<Inner>,
    events: broadcast::Receiver<WatchEvent>,
    epoch: watch::Receiver<u64>,
    prefix: String,
    done: bool,
}

impl Watcher {
    async fn next(mut self) -> Option<(Result<WatchEvent, StoreError>, Self)> {
        if self.done {
            return None;
        }

        loop {
            let sweep_at = self
                .inner
                .next_deadline()
                .await
                .map_or(Instant::now() + REAP_INTERVAL, |at| {
                    at.min(Instant::now() + REAP_INTERVAL)
                });

            let step = tokio::select! {
                _ = self.epoch.changed() => WatchStep::End,
                received = self.events.recv() => match received {
                    Ok(event) if event.key.starts_with(&self.prefix) => WatchStep::Event(event),
                    Ok(_) => WatchStep::Skip,
                    Err(broadcast::error::RecvError::Lagged(missed)) => WatchStep::Lagged(missed),
                    Err(broadcast::error::RecvError::Closed) => WatchStep::End,
                },
                _ = tokio::time::sleep_until(sweep_at) => WatchStep::Sweep,
            };

            match step {
                WatchStep::Event(event) => return Some((Ok(event), self)),
                WatchStep::Lagged(missed) => {
                    self.done = true;
                    return Some((Err(StoreError::WatchLagged(missed)), self));
                }
                WatchStep::Sweep => self.inner.purge_expired().await,
                WatchStep::Skip => {}
                WatchStep::End => return None,
            }
        }
    }
}
