//! Service registration records

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Format used when the registry stamps `created`
pub const CREATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A registered service instance, as persisted in the store
///
/// Unknown fields are ignored and missing fields default, so records written
/// by newer or older peers still decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    /// Transport family, e.g. `tcp`
    pub network: String,

    /// Logical service name, groups instances
    pub name: String,

    /// `host:port`; never a wildcard host once registered
    pub address: String,

    /// Unique within `name`; generated at registration when empty
    pub instance_id: String,

    /// Free-form version tag
    pub version: String,

    /// Creation timestamp; stamped at registration when empty
    pub created: String,

    /// Opaque metadata
    pub metadata: HashMap<String, serde_json::Value>,

    /// Opaque tags
    pub tags: HashMap<String, String>,
}

impl Service {
    /// Create a `tcp` service record
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: "tcp".to_string(),
            name: name.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_created(mut self, created: impl Into<String>) -> Self {
        self.created = created.into();
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Store key of this instance: `prefix/name/instance_id`
    pub fn key(&self, prefix: &str) -> String {
        format!("{}/{}/{}", prefix, self.name, self.instance_id)
    }

    /// Serialize for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a stored record
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Key prefix holding every instance of `name`
///
/// The trailing `/` keeps `api` from matching the instances of `api-gateway`.
pub fn service_prefix(prefix: &str, name: &str) -> String {
    format!("{}/{}/", prefix, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_builder() {
        let service = Service::new("api", "10.0.0.1:8080")
            .with_instance_id("i-1")
            .with_version("v1")
            .with_tag("zone", "eu-1")
            .with_metadata("weight", 3);

        assert_eq!(service.network, "tcp");
        assert_eq!(service.name, "api");
        assert_eq!(service.key("registry"), "registry/api/i-1");
        assert_eq!(service.tags.get("zone").map(String::as_str), Some("eu-1"));
        assert_eq!(service.metadata.get("weight"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn test_service_prefix() {
        assert_eq!(service_prefix("registry", "api"), "registry/api/");
        assert!(!"registry/api-gateway/i-1".starts_with(&service_prefix("registry", "api")));
    }

    #[test]
    fn test_record_uses_snake_case_fields() {
        let service = Service::new("api", "10.0.0.1:8080").with_instance_id("i-1");
        let value: serde_json::Value = serde_json::from_slice(&service.to_bytes().unwrap()).unwrap();

        assert_eq!(value["instance_id"], "i-1");
        assert_eq!(value["network"], "tcp");
    }

    #[test]
    fn test_decode_is_forward_compatible() {
        let raw = br#"{"name":"api","address":"10.0.0.1:80","instance_id":"x","region":"eu"}"#;
        let service = Service::from_bytes(raw).unwrap();

        assert_eq!(service.name, "api");
        assert!(service.version.is_empty());
        assert!(service.metadata.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Service::from_bytes(b"not json").is_err());
    }
}
