//! Coordination store capability
//!
//! The registry and discovery engines only need a handful of operations from
//! the backing store: prefix reads, writes bound to a lease, deletes, prefix
//! watches and lease management. [`KvStore`] captures exactly that, so the
//! engines run unchanged over etcd ([`crate::EtcdStore`]) or the in-process
//! [`crate::InMemoryStore`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Store-level errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to decode store response: {0}")]
    Decode(String),

    #[error("Lease {0} expired or not found")]
    LeaseExpired(LeaseId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Watch fell behind by {0} events")]
    WatchLagged(u64),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("No store endpoints configured")]
    NoEndpoints,
}

/// Opaque, store-issued lease handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A key/value pair read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Kind of change delivered by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A single change under a watched prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// Empty for deletes
    pub value: Vec<u8>,
}

/// Acknowledgement of a lease renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub lease: LeaseId,
    /// Remaining TTL in seconds as reported by the store
    pub ttl: i64,
}

/// Stream of changes under a prefix; ends when the store stops delivering.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Stream of renewal acks; the lease is renewed only while it is polled.
pub type KeepAliveStream = BoxStream<'static, Result<KeepAliveAck, StoreError>>;

/// Coordination store operations consumed by the registry and discovery
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// All live key/values whose key starts with `prefix`
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// Write `value` under `key`, attached to `lease` when given
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError>;

    /// Delete `key`; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Subscribe to changes under `prefix`
    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError>;

    /// Grant a lease with the given TTL in seconds
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, StoreError>;

    /// Open the renewal stream for `lease`
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError>;

    /// Revoke `lease`, deleting every key attached to it
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Backend name, e.g. `etcd`
    fn name(&self) -> &'static str;
}

/// Bound a unary store call by `deadline`.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| StoreError::Timeout(deadline))?
}

/// Smallest key strictly greater than every key starting with `prefix`.
///
/// Returns an empty vector when no such key exists (prefix of all `0xff`),
/// which etcd interprets as "to the end of the keyspace".
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end(b"registry/api/"), b"registry/api0".to_vec());
        assert_eq!(prefix_range_end(b"a\xff"), b"b".to_vec());
        assert_eq!(prefix_range_end(b"\xff\xff"), Vec::<u8>::new());
    }

    #[test]
    fn test_lease_display_is_hex() {
        assert_eq!(LeaseId(255).to_string(), "ff");
    }

    #[tokio::test]
    async fn test_with_deadline_times_out() {
        let result: Result<(), StoreError> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_deadline_passes_result() {
        let result = with_deadline(Duration::from_secs(1), async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
