// Waypost - client-side service registry and discovery
//
// Registers service instances under store leases and finds them again
// through cached, watch-refreshed lookups.

// Re-export the discovery engine
pub use waypost_discovery::*;

// Re-export supporting crates
pub use waypost_config;

#[cfg(feature = "log")]
pub use waypost_log;

/// Prelude for common imports
///
/// ```rust,ignore
/// use waypost::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        DiscoveryConfig,
        DiscoveryError,
        EtcdStore,
        InMemoryStore,
        KvStore,
        LeaseRegistry,
        RandomStrategy,
        RegistryConfig,
        RoundRobinStrategy,
        SelectionStrategy,
        Service,
        ServiceDiscovery,
        ServiceRegistry,
        StoreDiscovery,
    };

    pub use waypost_config::{ConfigBuilder, ConfigManager, Validate};

    #[cfg(feature = "log")]
    pub use waypost_log::{LogConfig, LogFormat, LogLevel};
}
