//! Register an instance, discover it, and deregister on Ctrl-C.
//!
//! Talks to etcd when endpoints are configured, through `waypost.toml`
//! (`[registry]` section) or the environment, otherwise runs against the
//! in-memory store.
//!
//! ```bash
//! cargo run --example register_and_discover
//! WAYPOST_REGISTRY__ENDPOINTS=http://127.0.0.1:2379 cargo run --example register_and_discover
//! ```

use std::error::Error;
use std::sync::Arc;
use waypost::prelude::*;
use waypost::waypost_log::{info, warn};

const SERVICE_NAME: &str = "greeter";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = ConfigBuilder::new()
        .with_prefix("WAYPOST")
        .add_optional_file("waypost.toml")
        .load_dotenv(None)
        .load_env()
        .build()?;

    let log = if config.has("log") {
        config.section::<LogConfig>("log")?
    } else {
        LogConfig::from_env()
    };
    let _guard = log.init()?;

    let registry_config = if config.has("registry") {
        RegistryConfig::from_config(&config, "registry")?
    } else {
        RegistryConfig::default().with_lease_ttl(10)
    };

    let discovery_config = if config.has("discovery") {
        DiscoveryConfig::from_config(&config, "discovery")?
    } else {
        DiscoveryConfig {
            store: registry_config.store.clone(),
            ..Default::default()
        }
        .with_cache(true)
    };

    let address: String = config.get_or("service.address", ":8080".to_string());
    let service = Service::new(SERVICE_NAME, address)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_tag("demo", "true");

    if config.has("registry.endpoints") {
        info!(endpoints = ?registry_config.store.endpoints, "Using etcd");
        let registry = LeaseRegistry::connect(registry_config).await?;
        let discovery = StoreDiscovery::connect(discovery_config).await?;

        run(&registry, &discovery, service).await?;
        discovery.shutdown().await;
    } else {
        info!("No endpoints configured, using the in-memory store");
        let store = Arc::new(InMemoryStore::new());
        let registry = LeaseRegistry::new(store.clone(), registry_config);
        let discovery = StoreDiscovery::new(store, discovery_config);

        run(&registry, &discovery, service).await?;
        discovery.shutdown().await;
    }

    Ok(())
}

async fn run(
    registry: &impl ServiceRegistry,
    discovery: &impl ServiceDiscovery,
    service: Service,
) -> Result<(), Box<dyn Error>> {
    let registered = registry.register(service).await?;
    info!(
        instance = %registered.instance_id,
        address = %registered.address,
        backend = registry.name(),
        "Registered"
    );

    let round_robin = RoundRobinStrategy::new();
    match discovery.get_with(SERVICE_NAME, &round_robin).await {
        Ok(instance) => info!(instance = %instance.instance_id, address = %instance.address, "Discovered"),
        Err(e) if e.is_not_found() => warn!("Registration not visible yet"),
        Err(e) => return Err(e.into()),
    }

    info!("Press Ctrl-C to deregister and exit");
    tokio::signal::ctrl_c().await?;

    registry.deregister(&registered).await?;
    info!(instance = %registered.instance_id, "Deregistered");

    Ok(())
}
