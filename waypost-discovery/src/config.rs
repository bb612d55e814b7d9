//! Registry and discovery configuration
//!
//! Plain structures with documented defaults. They deserialize from any
//! `waypost-config` source (TOML/JSON files, `.env`, environment), e.g.
//!
//! ```toml
//! [registry]
//! endpoints = ["http://etcd-0:2379", "http://etcd-1:2379"]
//! prefix = "registry"
//! lease_ttl = 30
//!
//! [discovery]
//! endpoints = "http://etcd-0:2379,http://etcd-1:2379"
//! enable_cache = true
//! ```

use crate::error::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use waypost_config::{ConfigManager, ConfigValidator, Validate};

/// Default store endpoint
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";

/// Default key namespace
pub const DEFAULT_PREFIX: &str = "registry";

/// Default lease TTL in seconds
pub const DEFAULT_LEASE_TTL: i64 = 60;

/// Connection settings shared by the registry and discovery
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store addresses, tried in order (default `http://127.0.0.1:2379`)
    #[serde(deserialize_with = "string_or_list")]
    pub endpoints: Vec<String>,

    /// Connection deadline (default 5s)
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,

    /// Deadline of every unary store call (default 3s)
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Key namespace (default `registry`)
    pub prefix: String,

    #[serde(deserialize_with = "opt_scalar_string")]
    pub username: Option<String>,

    #[serde(deserialize_with = "opt_scalar_string")]
    pub password: Option<String>,
}

impl StoreConfig {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(3),
            prefix: DEFAULT_PREFIX.to_string(),
            username: None,
            password: None,
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("endpoints", &self.endpoints)
            .field("dial_timeout", &self.dial_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("prefix", &self.prefix)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Validate for StoreConfig {
    fn validate(&self) -> waypost_config::Result<()> {
        if self.endpoints.is_empty() {
            return Err(waypost_config::ConfigError::ValidationError(
                "endpoints cannot be empty".to_string(),
            ));
        }
        for endpoint in &self.endpoints {
            ConfigValidator::is_url(endpoint, "endpoints")?;
        }
        ConfigValidator::not_empty(&self.prefix, "prefix")?;
        if self.prefix.ends_with('/') {
            return Err(waypost_config::ConfigError::ValidationError(
                "prefix must not end with '/'".to_string(),
            ));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(waypost_config::ConfigError::ValidationError(
                "username and password must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(flatten)]
    pub store: StoreConfig,

    /// Lease TTL in seconds (default 60)
    pub lease_ttl: i64,
}

impl RegistryConfig {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store: StoreConfig::new(endpoints),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.store.prefix = prefix.into();
        self
    }

    pub fn with_lease_ttl(mut self, secs: i64) -> Self {
        self.lease_ttl = secs;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.store.dial_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.store.request_timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.store.username = Some(username.into());
        self.store.password = Some(password.into());
        self
    }

    /// Read and validate the `section` of a loaded configuration
    pub fn from_config(config: &ConfigManager, section: &str) -> Result<Self> {
        Ok(config.load_validated(section)?)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

impl Validate for RegistryConfig {
    fn validate(&self) -> waypost_config::Result<()> {
        self.store.validate()?;
        ConfigValidator::in_range(self.lease_ttl, 1, i64::from(i32::MAX), "lease_ttl")
    }
}

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    #[serde(flatten)]
    pub store: StoreConfig,

    /// Cache lookups and keep them fresh with a watch (default off)
    #[serde(alias = "enable_watch")]
    pub enable_cache: bool,

    /// First reconnect delay of a broken watch (default 100ms)
    #[serde(with = "duration_secs")]
    pub watch_backoff_min: Duration,

    /// Reconnect delay cap of a broken watch (default 30s)
    #[serde(with = "duration_secs")]
    pub watch_backoff_max: Duration,
}

impl DiscoveryConfig {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store: StoreConfig::new(endpoints),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.store.prefix = prefix.into();
        self
    }

    /// Enable the watch-backed cache
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = enabled;
        self
    }

    pub fn with_watch_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.watch_backoff_min = min;
        self.watch_backoff_max = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.store.request_timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.store.username = Some(username.into());
        self.store.password = Some(password.into());
        self
    }

    /// Read and validate the `section` of a loaded configuration
    pub fn from_config(config: &ConfigManager, section: &str) -> Result<Self> {
        Ok(config.load_validated(section)?)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            enable_cache: false,
            watch_backoff_min: Duration::from_millis(100),
            watch_backoff_max: Duration::from_secs(30),
        }
    }
}

impl Validate for DiscoveryConfig {
    fn validate(&self) -> waypost_config::Result<()> {
        self.store.validate()?;
        if self.watch_backoff_min.is_zero() || self.watch_backoff_min > self.watch_backoff_max {
            return Err(waypost_config::ConfigError::ValidationError(
                "watch_backoff_min must be positive and not exceed watch_backoff_max".to_string(),
            ));
        }
        Ok(())
    }
}

/// Accept either a list or a comma separated string (handy for env vars)
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::One(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Raw::Many(v) => v,
    })
}

/// Credentials may arrive typed as numbers or booleans from env sources
fn opt_scalar_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_))) => {
            Some(other.to_string())
        }
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "expected a string, got {}",
                other
            )));
        }
    })
}

/// Durations as (fractional) seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        let secs = match Raw::deserialize(deserializer)? {
            Raw::Number(n) => n,
            Raw::Text(s) => s.trim().parse::<f64>().map_err(D::Error::custom)?,
        };

        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let registry = RegistryConfig::default();
        assert_eq!(registry.lease_ttl, 60);
        assert_eq!(registry.store.prefix, "registry");
        assert_eq!(registry.store.dial_timeout, Duration::from_secs(5));

        let discovery = DiscoveryConfig::default();
        assert!(!discovery.enable_cache);
        assert!(discovery.validate().is_ok());
    }

    #[test]
    fn test_deserialize_flat_section() {
        let json = serde_json::json!({
            "endpoints": "http://a:2379, http://b:2379",
            "prefix": "services",
            "lease_ttl": 15,
            "dial_timeout": 1.5,
        });

        let config: RegistryConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.store.endpoints, vec!["http://a:2379", "http://b:2379"]);
        assert_eq!(config.store.prefix, "services");
        assert_eq!(config.lease_ttl, 15);
        assert_eq!(config.store.dial_timeout, Duration::from_millis(1500));
        assert_eq!(config.store.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_numeric_credentials() {
        let json = serde_json::json!({ "username": "root", "password": 1234 });
        let config: StoreConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.password.as_deref(), Some("1234"));

        let json = serde_json::json!({ "password": ["nope"] });
        assert!(serde_json::from_value::<StoreConfig>(json).is_err());
    }

    #[test]
    fn test_enable_watch_alias() {
        let json = serde_json::json!({ "enable_watch": true });
        let config: DiscoveryConfig = serde_json::from_value(json).unwrap();
        assert!(config.enable_cache);
    }

    #[test]
    fn test_validation() {
        assert!(RegistryConfig::default().with_lease_ttl(0).validate().is_err());
        assert!(RegistryConfig::default().with_prefix("a/").validate().is_err());
        assert!(RegistryConfig::new(["etcd:2379"]).validate().is_err());
        assert!(RegistryConfig::new(Vec::<String>::new()).validate().is_err());

        let mut half_credentials = RegistryConfig::default();
        half_credentials.store.username = Some("root".into());
        assert!(half_credentials.validate().is_err());

        let backoff = DiscoveryConfig::default()
            .with_watch_backoff(Duration::from_secs(10), Duration::from_secs(1));
        assert!(backoff.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = RegistryConfig::default().with_credentials("root", "s3cret");
        let debug = format!("{:?}", config);
        assert!(debug.contains("root"));
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn test_from_config_section() {
        let manager = ConfigManager::new();
        manager
            .set(
                "discovery",
                serde_json::json!({ "endpoints": ["http://etcd:2379"], "enable_cache": true }),
            )
            .unwrap();

        let config = DiscoveryConfig::from_config(&manager, "discovery").unwrap();
        assert!(config.enable_cache);
        assert_eq!(config.store.endpoints, vec!["http://etcd:2379"]);

        assert!(RegistryConfig::from_config(&manager, "missing").is_err());
    }
}
