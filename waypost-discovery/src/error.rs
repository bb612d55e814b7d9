//! Error types surfaced by the registry and discovery engines

use crate::address::AddressError;
use crate::store::StoreError;
use thiserror::Error;

/// Service registry / discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// `source` tells a malformed address apart from a host without a usable interface
    #[error("Failed to resolve address {address}: {source}")]
    AddressResolution {
        address: String,
        #[source]
        source: AddressError,
    },

    #[error("Failed to grant lease: {0}")]
    LeaseGrant(#[source] StoreError),

    #[error("Failed to start lease keepalive: {0}")]
    KeepAlive(#[source] StoreError),

    #[error("Store write failed: {0}")]
    StoreWrite(#[source] StoreError),

    #[error("Store read failed: {0}")]
    StoreRead(#[source] StoreError),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No instance could be selected for service: {0}")]
    EmptySelection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to connect to store: {0}")]
    Connection(#[source] StoreError),
}

impl DiscoveryError {
    /// True for the expected "no instances registered" outcome.
    ///
    /// Everything else is a transport, store or caller error and usually
    /// deserves a different handling (retry with backoff, fail fast...).
    pub fn is_not_found(&self) -> bool {
        matches!(self, DiscoveryError::ServiceNotFound(_))
    }
}

impl From<waypost_config::ConfigError> for DiscoveryError {
    fn from(err: waypost_config::ConfigError) -> Self {
        DiscoveryError::InvalidConfiguration(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinguishable() {
        assert!(DiscoveryError::ServiceNotFound("api".into()).is_not_found());
        assert!(!DiscoveryError::StoreRead(StoreError::Unavailable("down".into())).is_not_found());
        assert!(!DiscoveryError::EmptySelection("api".into()).is_not_found());
    }

    #[test]
    fn test_resolution_error_message() {
        let err = DiscoveryError::AddressResolution {
            address: "badaddr".into(),
            source: AddressError::Format("missing port in address".into()),
        };
        assert_eq!(
            err.to_string(),
            "Failed to resolve address badaddr: Invalid address format: missing port in address"
        );
    }
}
