//! Service lookup with an optional watch-driven cache
//!
//! Without the cache every lookup reads the store. With it, the first lookup
//! of a name populates the cache and starts one background watch for that
//! name; every change under the name triggers a full re-read that replaces
//! the cached list wholesale. Readers therefore always see a complete
//! snapshot, either the old list or the new one.

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::etcd::EtcdStore;
use crate::service::{Service, service_prefix};
use crate::store::{KvStore, with_deadline};
use crate::strategy::{RandomStrategy, SelectionStrategy};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use waypost_config::Validate;

/// Service discovery trait
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// All live instances of `name`
    ///
    /// Fails with [`DiscoveryError::ServiceNotFound`] when none are registered.
    async fn get_services(&self, name: &str) -> Result<Arc<[Service]>>;

    /// One instance of `name`, chosen at random
    async fn get(&self, name: &str) -> Result<Service> {
        self.get_with(name, &RandomStrategy).await
    }

    /// One instance of `name`, chosen by `strategy`
    async fn get_with(&self, name: &str, strategy: &dyn SelectionStrategy) -> Result<Service> {
        let services = self.get_services(name).await?;
        if services.is_empty() {
            return Err(DiscoveryError::EmptySelection(name.to_string()));
        }

        let idx = strategy.select(&services);
        services
            .get(idx)
            .cloned()
            .ok_or_else(|| DiscoveryError::EmptySelection(name.to_string()))
    }

    /// Backend name
    fn name(&self) -> &str;
}

struct Shared<S> {
    store: Arc<S>,
    config: DiscoveryConfig,
    cache: RwLock<HashMap<String, Arc<[Service]>>>,
    refresh_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Discovery over a [`KvStore`]
///
/// # Examples
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use waypost_discovery::*;
///
/// let discovery = StoreDiscovery::new(
///     Arc::new(InMemoryStore::new()),
///     DiscoveryConfig::default().with_cache(true),
/// );
///
/// let instance = discovery.get_with("api", &RoundRobinStrategy::new()).await?;
/// println!("calling {}", instance.address);
/// ```
pub struct StoreDiscovery<S: KvStore> {
    shared: Arc<Shared<S>>,
    watchers: parking_lot::Mutex<HashMap<String, JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl<S: KvStore> StoreDiscovery<S> {
    pub fn new(store: Arc<S>, config: DiscoveryConfig) -> Self {
        let (stop, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                store,
                config,
                cache: RwLock::new(HashMap::new()),
                refresh_locks: parking_lot::Mutex::new(HashMap::new()),
            }),
            watchers: parking_lot::Mutex::new(HashMap::new()),
            stop,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    /// Cached instances of `name`, without touching the store
    pub async fn cached_services(&self, name: &str) -> Option<Arc<[Service]>> {
        self.shared.cache.read().await.get(name).cloned()
    }

    /// Whether a background watch runs for `name`
    pub fn is_watching(&self, name: &str) -> bool {
        self.watchers
            .lock()
            .get(name)
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop every watch task and wait for them to exit
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);

        let tasks: Vec<(String, JoinHandle<()>)> = self.watchers.lock().drain().collect();
        for (name, task) in tasks {
            if let Err(e) = task.await {
                warn!(service = %name, error = %e, "Watch task failed");
            }
        }
    }

    fn ensure_watch(&self, name: &str) {
        if *self.stop.borrow() {
            return;
        }

        let mut watchers = self.watchers.lock();
        if watchers.get(name).is_some_and(|task| !task.is_finished()) {
            return;
        }

        let task = tokio::spawn(watch_service(
            self.shared.clone(),
            name.to_string(),
            self.stop.subscribe(),
        ));
        watchers.insert(name.to_string(), task);
    }
}

impl StoreDiscovery<EtcdStore> {
    /// Validate `config` and connect to etcd
    pub async fn connect(config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;
        let store = EtcdStore::connect(&config.store)
            .await
            .map_err(DiscoveryError::Connection)?;
        Ok(Self::new(Arc::new(store), config))
    }
}

impl<S: KvStore> Shared<S> {
    /// Read and decode every record of `name`, skipping malformed ones
    async fn fetch(&self, name: &str) -> Result<Vec<Service>> {
        let prefix = service_prefix(&self.config.store.prefix, name);
        let kvs = with_deadline(self.config.store.request_timeout, self.store.get_prefix(&prefix))
            .await
            .map_err(DiscoveryError::StoreRead)?;

        let services = kvs
            .into_iter()
            .filter_map(|kv| match Service::from_bytes(&kv.value) {
                Ok(service) => Some(service),
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "Skipping malformed service record");
                    None
                }
            })
            .collect();

        Ok(services)
    }

    fn refresh_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Replace the cached list of `name`; the previous list survives failures
    async fn refresh(&self, name: &str) {
        let lock = self.refresh_lock(name);
        let _guard = lock.lock().await;

        match self.fetch(name).await {
            Ok(services) => {
                let count = services.len();
                self.cache
                    .write()
                    .await
                    .insert(name.to_string(), Arc::from(services));
                debug!(service = %name, instances = count, "Refreshed service cache");
            }
            Err(e) => {
                warn!(service = %name, error = %e, "Cache refresh failed, keeping previous entry");
            }
        }
    }
}

#[async_trait]
impl<S: KvStore> ServiceDiscovery for StoreDiscovery<S> {
    async fn get_services(&self, name: &str) -> Result<Arc<[Service]>> {
        if !self.shared.config.enable_cache {
            let services = self.shared.fetch(name).await?;
            if services.is_empty() {
                return Err(DiscoveryError::ServiceNotFound(name.to_string()));
            }
            return Ok(Arc::from(services));
        }

        if let Some(services) = self.cached_services(name).await {
            if services.is_empty() {
                return Err(DiscoveryError::ServiceNotFound(name.to_string()));
            }
            return Ok(services);
        }

        let services = self.shared.fetch(name).await?;
        if services.is_empty() {
            return Err(DiscoveryError::ServiceNotFound(name.to_string()));
        }

        let services = self
            .shared
            .cache
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::from(services))
            .clone();

        self.ensure_watch(name);

        if services.is_empty() {
            return Err(DiscoveryError::ServiceNotFound(name.to_string()));
        }
        Ok(services)
    }

    fn name(&self) -> &str {
        self.shared.store.name()
    }
}

impl<S: KvStore> Drop for StoreDiscovery<S> {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

/// Keep the cache entry of `name` in sync until stopped
///
/// Every (re)subscription is followed by a refresh so changes made while the
/// watch was down are picked up.
async fn watch_service<S: KvStore>(shared: Arc<Shared<S>>, name: String, mut stop: watch::Receiver<bool>) {
    let prefix = service_prefix(&shared.config.store.prefix, &name);
    let min = shared.config.watch_backoff_min;
    let max = shared.config.watch_backoff_max;
    let mut backoff = min;

    loop {
        if *stop.borrow() {
            break;
        }

        match with_deadline(shared.config.store.request_timeout, shared.store.watch(&prefix)).await {
            Ok(mut events) => {
                debug!(service = %name, "Watching service");
                shared.refresh(&name).await;

                loop {
                    tokio::select! {
                        _ = stop.changed() => {
                            debug!(service = %name, "Watch stopped");
                            return;
                        }
                        event = events.next() => match event {
                            Some(Ok(event)) => {
                                trace!(service = %name, key = %event.key, kind = ?event.kind, "Watch event");
                                backoff = min;
                                shared.refresh(&name).await;
                            }
                            Some(Err(e)) => {
                                warn!(service = %name, error = %e, "Watch failed");
                                break;
                            }
                            None => {
                                debug!(service = %name, "Watch stream ended");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(service = %name, error = %e, "Failed to open watch");
            }
        }

        debug!(service = %name, backoff = ?backoff, "Reconnecting watch");
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(max);
    }

    debug!(service = %name, "Watch stopped");
}
