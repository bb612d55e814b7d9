//! Layered configuration for waypost
//!
//! Values come from TOML/JSON files, `.env` files and environment variables
//! and are kept as one JSON tree. Typed sections are read back with serde:
//!
//! ```rust,ignore
//! use waypost_config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .with_prefix("WAYPOST")
//!     .add_optional_file("waypost.toml")
//!     .load_env()
//!     .build()?;
//!
//! let ttl: i64 = config.get("registry.lease_ttl")?;
//! ```

pub mod builder;
pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use builder::ConfigBuilder;
pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use validation::{ConfigValidator, Validate};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

/// Thread-safe configuration tree
#[derive(Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Map<String, Value>>>,
    env_prefix: Option<String>,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(Map::new())),
            env_prefix: None,
        }
    }

    /// Create with environment variable prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            config: Arc::new(RwLock::new(Map::new())),
            env_prefix: Some(prefix.into()),
        }
    }

    pub fn env_prefix(&self) -> Option<&str> {
        self.env_prefix.as_deref()
    }

    /// Load configuration from environment variables
    pub fn load_env(&self) -> Result<()> {
        let loader = EnvLoader::new(self.env_prefix.clone());
        self.merge_value(loader.load()?)
    }

    /// Load a `.env` file into the process environment, then the environment
    ///
    /// Without a path a missing `.env` is ignored. Variables already set in
    /// the environment win over the file.
    pub fn load_dotenv(&self, path: Option<&Path>) -> Result<()> {
        if let Some(path) = path {
            dotenvy::from_path(path).map_err(|e| ConfigError::LoadError(e.to_string()))?;
        } else {
            dotenvy::dotenv().ok();
        }
        self.load_env()
    }

    /// Load a configuration file, detecting the format from its name
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = ConfigLoader::auto(&path)?.load_file(&path)?;
        self.merge_value(data)
    }

    /// Load a configuration file of an explicit format
    pub fn load_file_as(&self, path: impl AsRef<Path>, format: FileFormat) -> Result<()> {
        let data = ConfigLoader::new(format).load_file(path)?;
        self.merge_value(data)
    }

    /// Deep-merge a JSON object into the configuration
    pub fn merge_value(&self, value: Value) -> Result<()> {
        let Value::Object(source) = value else {
            return Err(ConfigError::ParseError(
                "configuration root must be an object".to_string(),
            ));
        };

        merge_into(&mut self.config.write(), source);
        Ok(())
    }

    /// Set a configuration value; dotted keys create nested tables
    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let json_value = serde_json::to_value(value)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        let path: Vec<String> = key.split('.').map(String::from).collect();
        env::insert_path(&mut self.config.write(), &path, json_value);

        Ok(())
    }

    /// Get a configuration value by key or dotted path
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .get_value(key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))?;

        serde_json::from_value(value).map_err(|e| ConfigError::DeserializationError {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Raw value at `key`
    pub fn get_value(&self, key: &str) -> Option<Value> {
        lookup(&self.config.read(), key).cloned()
    }

    /// Read a whole section into a typed structure
    pub fn section<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.get(name)
    }

    /// Get a configuration value with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        self.get(key)
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        self.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.get(key)
    }

    /// Check if a key or dotted path exists
    pub fn has(&self, key: &str) -> bool {
        lookup(&self.config.read(), key).is_some()
    }

    /// Top-level keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.config.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Deep-merge another manager into this one; `other` wins on conflicts
    pub fn merge(&self, other: &ConfigManager) -> Result<()> {
        let snapshot = other.config.read().clone();
        merge_into(&mut self.config.write(), snapshot);
        Ok(())
    }

    /// The whole tree as one JSON object
    pub fn to_value(&self) -> Value {
        Value::Object(self.config.read().clone())
    }

    /// Deserialize a section and validate it
    pub fn load_validated<T: DeserializeOwned + Validate>(&self, section: &str) -> Result<T> {
        let validated: T = self.section(section)?;
        validated.validate()?;
        Ok(validated)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(value) = map.get(key) {
        return Some(value);
    }

    let mut segments = key.split('.');
    let first = map.get(segments.next()?)?;
    segments.try_fold(first, |node, segment| node.get(segment))
}

fn merge_into(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match value {
            Value::Object(incoming) => {
                if let Some(Value::Object(existing)) = target.get_mut(&key) {
                    merge_into(existing, incoming);
                } else {
                    target.insert(key, Value::Object(incoming));
                }
            }
            value => {
                target.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_set_and_get() {
        let manager = ConfigManager::new();
        manager.set("test_key", "test_value").unwrap();

        let value: String = manager.get("test_key").unwrap();
        assert_eq!(value, "test_value");
    }

    #[test]
    fn test_get_or_default() {
        let manager = ConfigManager::new();

        let value: String = manager.get_or("missing_key", "default_value".to_string());
        assert_eq!(value, "default_value");
    }

    #[test]
    fn test_missing_key() {
        let manager = ConfigManager::new();
        let err = manager.get::<String>("registry").unwrap_err();
        assert!(err.is_missing());
    }

    #[test]
    fn test_dotted_paths() {
        let manager = ConfigManager::new();
        manager.set("registry.lease_ttl", 30).unwrap();
        manager.set("registry.prefix", "services").unwrap();

        assert_eq!(manager.get_int("registry.lease_ttl").unwrap(), 30);
        assert!(manager.has("registry.prefix"));
        assert!(!manager.has("registry.missing"));
        assert_eq!(manager.keys(), vec!["registry"]);
        assert_eq!(
            manager.get_value("registry").unwrap(),
            json!({ "lease_ttl": 30, "prefix": "services" })
        );
    }

    #[test]
    fn test_type_conversions() {
        let manager = ConfigManager::new();

        manager.set("string_key", "hello").unwrap();
        manager.set("int_key", 42i64).unwrap();
        manager.set("bool_key", true).unwrap();

        assert_eq!(manager.get_string("string_key").unwrap(), "hello");
        assert_eq!(manager.get_int("int_key").unwrap(), 42);
        assert!(manager.get_bool("bool_key").unwrap());

        let err = manager.get_int("string_key").unwrap_err();
        assert!(matches!(err, ConfigError::DeserializationError { key, .. } if key == "string_key"));
    }

    #[test]
    fn test_deep_merge() {
        let base = ConfigManager::new();
        base.merge_value(json!({ "registry": { "prefix": "a", "lease_ttl": 10 } })).unwrap();

        let overrides = ConfigManager::new();
        overrides.set("registry.lease_ttl", 20).unwrap();

        base.merge(&overrides).unwrap();
        assert_eq!(
            base.to_value(),
            json!({ "registry": { "prefix": "a", "lease_ttl": 20 } })
        );

        assert!(base.merge_value(json!([1])).is_err());
    }

    #[derive(Debug, Deserialize)]
    struct Section {
        name: String,
        port: u16,
    }

    impl Validate for Section {
        fn validate(&self) -> Result<()> {
            ConfigValidator::not_empty(&self.name, "name")?;
            ConfigValidator::in_range(self.port, 1, u16::MAX, "port")
        }
    }

    #[test]
    fn test_section_and_validation() {
        let manager = ConfigManager::new();
        manager.set("server", json!({ "name": "api", "port": 8080 })).unwrap();

        let section: Section = manager.section("server").unwrap();
        assert_eq!(section.name, "api");
        assert_eq!(section.port, 8080);

        let validated: Section = manager.load_validated("server").unwrap();
        assert_eq!(validated.port, 8080);

        manager.set("server.name", "").unwrap();
        assert!(matches!(
            manager.load_validated::<Section>("server"),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            manager.load_validated::<Section>("client"),
            Err(ConfigError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waypost.toml");
        std::fs::write(&path, "[registry]\nlease_ttl = 15\n").unwrap();

        let manager = ConfigManager::new();
        manager.load_file(&path).unwrap();
        assert_eq!(manager.get_int("registry.lease_ttl").unwrap(), 15);

        assert!(manager.load_file(dir.path().join("waypost.yaml")).is_err());
    }

    #[test]
    fn test_load_dotenv_missing_path() {
        let manager = ConfigManager::with_prefix("WAYPOST_TEST_NOPE");
        let result = manager.load_dotenv(Some(Path::new("/nonexistent/.env")));
        assert!(matches!(result, Err(ConfigError::LoadError(_))));
    }
}
