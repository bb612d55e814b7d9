//! Service registration and discovery for waypost
//!
//! This crate registers service instances in a coordination store under a
//! lease and finds them again, optionally through a watch-driven cache.
//!
//! ## Features
//!
//! - **Lease-bound registration** - records disappear when their owner stops renewing
//! - **Wildcard resolution** - `:8080` / `0.0.0.0:8080` become a routable address
//! - **Cached discovery** - per-name cache kept fresh by a store watch
//! - **Selection strategies** - random, round-robin, first, weighted or any closure
//! - **Multiple backends** - etcd, or in-memory for tests
//!
//! ## Quick Start
//!
//! ### In-Memory Store (Testing)
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waypost_discovery::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryStore::new());
//!
//!     let registry = LeaseRegistry::new(store.clone(), RegistryConfig::default());
//!     let registered = registry.register(Service::new("api", ":8080")).await?;
//!
//!     let discovery = StoreDiscovery::new(store, DiscoveryConfig::default().with_cache(true));
//!     let instance = discovery.get("api").await?;
//!     println!("Found: {}", instance.address);
//!
//!     registry.deregister(&registered).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### etcd
//!
//! ```rust,ignore
//! use waypost_discovery::*;
//!
//! let registry = LeaseRegistry::connect(
//!     RegistryConfig::new(["http://localhost:2379"]).with_lease_ttl(30),
//! )
//! .await?;
//!
//! let discovery = StoreDiscovery::connect(DiscoveryConfig::new(["http://localhost:2379"])).await?;
//! let instance = discovery.get_with("api", &RoundRobinStrategy::new()).await?;
//! ```

pub mod address;
pub mod config;
pub mod discovery;
pub mod error;
pub mod etcd;
pub mod memory;
pub mod registry;
pub mod service;
pub mod store;
pub mod strategy;

pub use address::{AddressError, NetAddr, local_addr, resolve};
pub use config::{DiscoveryConfig, RegistryConfig, StoreConfig};
pub use discovery::{ServiceDiscovery, StoreDiscovery};
pub use error::{DiscoveryError, Result};
pub use etcd::EtcdStore;
pub use memory::InMemoryStore;
pub use registry::{LeaseRegistry, RegistrationState, ServiceRegistry};
pub use service::{Service, service_prefix};
pub use store::{
    KeepAliveAck, KeepAliveStream, KeyValue, KvStore, LeaseId, StoreError, WatchEvent,
    WatchEventKind, WatchStream,
};
pub use strategy::{
    FirstStrategy, RandomStrategy, RoundRobinStrategy, SelectionStrategy, WeightedStrategy,
};
