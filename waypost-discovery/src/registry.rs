//! Lease-bound service registration
//!
//! A [`LeaseRegistry`] owns at most one registration. The record is written
//! under a store lease that a background task keeps alive; when the process
//! dies the renewals stop and the store removes the record once the TTL
//! runs out.

use crate::address::resolve;
use crate::config::RegistryConfig;
use crate::error::{DiscoveryError, Result};
use crate::etcd::EtcdStore;
use crate::service::{CREATED_FORMAT, Service};
use crate::store::{KeepAliveStream, KvStore, LeaseId, with_deadline};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use waypost_config::Validate;

/// Service registry trait
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Register an instance and keep it alive; returns the persisted record
    async fn register(&self, service: Service) -> Result<Service>;

    /// Remove an instance and stop keeping it alive
    async fn deregister(&self, service: &Service) -> Result<()>;

    /// Backend name
    fn name(&self) -> &str;
}

/// Lifecycle of the registration owned by a [`LeaseRegistry`]
///
/// `Unregistered -> Registering -> Registered -> Deregistering -> Deregistered`.
/// A failed registration falls back to `Unregistered`. Deregistering is only
/// accepted from `Registered`, or again from `Deregistered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Deregistering,
    Deregistered,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
            RegistrationState::Deregistering => "deregistering",
            RegistrationState::Deregistered => "deregistered",
        };
        f.write_str(s)
    }
}

struct Registration {
    state: RegistrationState,
    lease: Option<LeaseId>,
    keepalive: Option<JoinHandle<()>>,
}

/// Registry writing lease-bound records into a [`KvStore`]
///
/// # Examples
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use waypost_discovery::*;
///
/// let store = Arc::new(InMemoryStore::new());
/// let registry = LeaseRegistry::new(store, RegistryConfig::default().with_lease_ttl(10));
///
/// let registered = registry.register(Service::new("api", ":8080")).await?;
/// // ...
/// registry.deregister(&registered).await?;
/// ```
pub struct LeaseRegistry<S: KvStore> {
    store: Arc<S>,
    config: RegistryConfig,
    registration: Mutex<Registration>,
    stop: watch::Sender<bool>,
}

impl<S: KvStore> LeaseRegistry<S> {
    pub fn new(store: Arc<S>, config: RegistryConfig) -> Self {
        let (stop, _) = watch::channel(false);

        Self {
            store,
            config,
            registration: Mutex::new(Registration {
                state: RegistrationState::Unregistered,
                lease: None,
                keepalive: None,
            }),
            stop,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Current lifecycle state
    pub fn state(&self) -> RegistrationState {
        self.registration.lock().state
    }

    /// Lease backing the current registration
    pub fn lease(&self) -> Option<LeaseId> {
        self.registration.lock().lease
    }

    /// Stop renewing the lease. Safe to call any number of times.
    ///
    /// The record stays in the store until the lease expires.
    pub fn stop_keepalive(&self) {
        self.stop.send_replace(true);
    }

    fn set_state(&self, state: RegistrationState) {
        self.registration.lock().state = state;
    }

    async fn write(&self, mut service: Service) -> Result<Service> {
        if service.instance_id.is_empty() {
            service.instance_id = Uuid::new_v4().simple().to_string();
        }
        if service.created.is_empty() {
            service.created = chrono::Utc::now().format(CREATED_FORMAT).to_string();
        }

        service.address = resolve(&service.address).map_err(|source| DiscoveryError::AddressResolution {
            address: service.address.clone(),
            source,
        })?;

        let deadline = self.config.store.request_timeout;
        let lease = with_deadline(deadline, self.store.grant_lease(self.config.lease_ttl))
            .await
            .map_err(DiscoveryError::LeaseGrant)?;

        let key = service.key(&self.config.store.prefix);
        let value = service.to_bytes()?;

        if let Err(e) = with_deadline(deadline, self.store.put(&key, value, Some(lease))).await {
            warn!(key = %key, lease = %lease, error = %e, "Registration write failed, lease left to expire");
            return Err(DiscoveryError::StoreWrite(e));
        }

        let acks = with_deadline(deadline, self.store.keep_alive(lease))
            .await
            .map_err(DiscoveryError::KeepAlive)?;

        self.stop.send_replace(false);
        let task = tokio::spawn(renew_lease(
            acks,
            self.stop.subscribe(),
            lease,
            service.name.clone(),
        ));

        let mut registration = self.registration.lock();
        registration.lease = Some(lease);
        registration.keepalive = Some(task);
        drop(registration);

        info!(
            service = %service.name,
            instance = %service.instance_id,
            address = %service.address,
            lease = %lease,
            "Registered service"
        );

        Ok(service)
    }
}

impl LeaseRegistry<EtcdStore> {
    /// Validate `config` and connect to etcd
    pub async fn connect(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        let store = EtcdStore::connect(&config.store)
            .await
            .map_err(DiscoveryError::Connection)?;
        Ok(Self::new(Arc::new(store), config))
    }
}

#[async_trait]
impl<S: KvStore> ServiceRegistry for LeaseRegistry<S> {
    async fn register(&self, service: Service) -> Result<Service> {
        if service.name.is_empty() {
            return Err(DiscoveryError::Validation("service name cannot be empty".to_string()));
        }

        {
            let mut registration = self.registration.lock();
            if registration.state != RegistrationState::Unregistered {
                return Err(DiscoveryError::Validation(format!(
                    "registry is {}, only one registration per registry",
                    registration.state
                )));
            }
            registration.state = RegistrationState::Registering;
        }

        match self.write(service).await {
            Ok(service) => {
                self.set_state(RegistrationState::Registered);
                Ok(service)
            }
            Err(e) => {
                self.set_state(RegistrationState::Unregistered);
                Err(e)
            }
        }
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        if service.name.is_empty() {
            return Err(DiscoveryError::Validation("service name cannot be empty".to_string()));
        }

        resolve(&service.address).map_err(|source| DiscoveryError::AddressResolution {
            address: service.address.clone(),
            source,
        })?;

        let previous = {
            let mut registration = self.registration.lock();
            match registration.state {
                RegistrationState::Registered | RegistrationState::Deregistered => {}
                state => {
                    return Err(DiscoveryError::Validation(format!(
                        "registry is {}, nothing to deregister",
                        state
                    )));
                }
            }
            std::mem::replace(&mut registration.state, RegistrationState::Deregistering)
        };

        let key = service.key(&self.config.store.prefix);
        let deadline = self.config.store.request_timeout;

        if let Err(e) = with_deadline(deadline, self.store.delete(&key)).await {
            self.set_state(previous);
            return Err(DiscoveryError::StoreWrite(e));
        }

        self.stop_keepalive();

        let (task, lease) = {
            let mut registration = self.registration.lock();
            (registration.keepalive.take(), registration.lease.take())
        };

        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(service = %service.name, error = %e, "Keepalive task failed");
        }

        if let Some(lease) = lease
            && let Err(e) = with_deadline(deadline, self.store.revoke_lease(lease)).await
        {
            debug!(lease = %lease, error = %e, "Lease revoke failed, leaving it to expire");
        }

        self.set_state(RegistrationState::Deregistered);
        info!(service = %service.name, instance = %service.instance_id, "Deregistered service");

        Ok(())
    }

    fn name(&self) -> &str {
        self.store.name()
    }
}

impl<S: KvStore> Drop for LeaseRegistry<S> {
    fn drop(&mut self) {
        self.stop_keepalive();
    }
}

/// Drain renewal acks until stopped, or until the store gives up on the lease
async fn renew_lease(
    mut acks: KeepAliveStream,
    mut stop: watch::Receiver<bool>,
    lease: LeaseId,
    service: String,
) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!(service = %service, lease = %lease, "Keepalive stopped");
                    return;
                }
            }
            ack = acks.next() => match ack {
                Some(Ok(ack)) => {
                    trace!(service = %service, lease = %lease, ttl = ack.ttl, "Lease renewed");
                }
                Some(Err(e)) => {
                    warn!(service = %service, lease = %lease, error = %e, "Lease keepalive failed");
                    return;
                }
                None => {
                    warn!(service = %service, lease = %lease, "Lease keepalive stream ended");
                    return;
                }
            }
        }
    }
}
