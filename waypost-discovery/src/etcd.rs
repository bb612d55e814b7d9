//! etcd coordination store over the v3 JSON gateway
//!
//! Keys and values travel base64 encoded, 64-bit integers may come back as
//! JSON strings, and streaming endpoints (`/v3/watch`) answer with one JSON
//! document per line for as long as the connection stays open.

use crate::config::StoreConfig;
use crate::store::{
    KeepAliveAck, KeepAliveStream, KeyValue, KvStore, LeaseId, StoreError, WatchEvent,
    WatchEventKind, WatchStream, prefix_range_end, with_deadline,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// etcd store client
///
/// Cheap to clone; clones share the HTTP connection pool and auth token.
///
/// # Examples
///
/// ```rust,ignore
/// use waypost_discovery::{EtcdStore, StoreConfig};
///
/// let etcd = EtcdStore::connect(&StoreConfig::new(["http://localhost:2379"])).await?;
/// ```
#[derive(Clone)]
pub struct EtcdStore {
    inner: Arc<Client>,
}

struct Credentials {
    username: String,
    password: String,
}

struct Client {
    endpoints: Vec<String>,
    current: AtomicUsize,
    http: reqwest::Client,
    request_timeout: Duration,
    credentials: Option<Credentials>,
    token: RwLock<Option<String>>,
}

impl EtcdStore {
    /// Build a client without touching the network
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        if config.endpoints.is_empty() {
            return Err(StoreError::NoEndpoints);
        }

        for endpoint in &config.endpoints {
            url::Url::parse(endpoint)
                .map_err(|e| StoreError::Unavailable(format!("invalid endpoint {}: {}", endpoint, e)))?;
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.dial_timeout)
            .build()?;

        let credentials = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        Ok(Self {
            inner: Arc::new(Client {
                endpoints: config
                    .endpoints
                    .iter()
                    .map(|e| e.trim_end_matches('/').to_string())
                    .collect(),
                current: AtomicUsize::new(0),
                http,
                request_timeout: config.request_timeout,
                credentials,
                token: RwLock::new(None),
            }),
        })
    }

    /// Build a client and authenticate when credentials are configured
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let store = Self::new(config)?;

        if store.inner.credentials.is_some() {
            with_deadline(config.dial_timeout, store.inner.authenticate()).await?;
        }

        info!(endpoints = ?store.inner.endpoints, "connected to etcd");
        Ok(store)
    }

    /// Configured endpoints, in failover order
    pub fn endpoints(&self) -> &[String] {
        &self.inner.endpoints
    }
}

impl Client {
    async fn authenticate(&self) -> Result<(), StoreError> {
        let Some(credentials) = &self.credentials else {
            return Ok(());
        };

        let body = serde_json::json!({
            "name": credentials.username,
            "password": credentials.password,
        });

        let response = self.send_once("/v3/auth/authenticate", &body, None).await?;
        let auth: AuthResponse = decode(response).await?;
        if auth.token.is_empty() {
            return Err(StoreError::Auth("empty token".to_string()));
        }

        *self.token.write().await = Some(auth.token);
        debug!("authenticated against etcd");
        Ok(())
    }

    /// POST `body` to `path`, failing over across endpoints and refreshing
    /// the auth token once on 401.
    async fn send(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response, StoreError> {
        let mut refreshed = false;

        loop {
            let token = self.token.read().await.clone();
            let response = self.send_once(path, body, token.as_deref()).await?;

            if response.status() == StatusCode::UNAUTHORIZED && self.credentials.is_some() && !refreshed {
                refreshed = true;
                self.authenticate().await?;
                continue;
            }

            return check_status(response).await;
        }
    }

    async fn send_once(
        &self,
        path: &str,
        body: &serde_json::Value,
        token: Option<&str>,
    ) -> Result<reqwest::Response, StoreError> {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..self.endpoints.len() {
            let idx = (start + offset) % self.endpoints.len();
            let url = format!("{}{}", self.endpoints[idx], path);

            let mut request = self.http.post(&url).json(body);
            if let Some(token) = token {
                request = request.header(reqwest::header::AUTHORIZATION, token);
            }

            match request.send().await {
                Ok(response) => {
                    self.current.store(idx, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoints[idx], error = %e, "etcd endpoint unreachable");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map_or(StoreError::NoEndpoints, StoreError::Http))
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T, StoreError> {
        let response = self.send(path, &body).await?;
        decode(response).await
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<KeepAliveAck, StoreError> {
        let body = serde_json::json!({ "ID": lease.0.to_string() });
        let envelope: KeepAliveEnvelope = self.post("/v3/lease/keepalive", body).await?;

        if let Some(error) = envelope.error {
            return Err(StoreError::Unavailable(error.message));
        }

        match envelope.result {
            Some(result) if result.ttl > 0 => Ok(KeepAliveAck {
                lease,
                ttl: result.ttl,
            }),
            _ => Err(StoreError::LeaseExpired(lease)),
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    if status == StatusCode::UNAUTHORIZED.as_u16() {
        return Err(StoreError::Auth(body));
    }
    Err(StoreError::Status { status, body })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, StoreError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode(e.to_string()))
}

fn encode(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

fn decode_b64(value: &str) -> Result<Vec<u8>, StoreError> {
    general_purpose::STANDARD
        .decode(value)
        .map_err(|e| StoreError::Decode(e.to_string()))
}

fn range_end(prefix: &str) -> Vec<u8> {
    let end = prefix_range_end(prefix.as_bytes());
    if end.is_empty() { vec![0] } else { end }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let body = serde_json::json!({
            "key": encode(prefix.as_bytes()),
            "range_end": encode(&range_end(prefix)),
        });

        let response: RangeResponse =
            with_deadline(self.inner.request_timeout, self.inner.post("/v3/kv/range", body)).await?;

        response
            .kvs
            .into_iter()
            .map(|kv| kv.decode())
            .collect()
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
        let mut body = serde_json::json!({
            "key": encode(key.as_bytes()),
            "value": encode(&value),
        });
        if let Some(lease) = lease {
            body["lease"] = serde_json::Value::String(lease.0.to_string());
        }

        let _: serde_json::Value =
            with_deadline(self.inner.request_timeout, self.inner.post("/v3/kv/put", body)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let body = serde_json::json!({ "key": encode(key.as_bytes()) });

        let _: serde_json::Value =
            with_deadline(self.inner.request_timeout, self.inner.post("/v3/kv/deleterange", body))
                .await?;
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        let body = serde_json::json!({
            "create_request": {
                "key": encode(prefix.as_bytes()),
                "range_end": encode(&range_end(prefix)),
            }
        });

        // Only establishing the stream is deadline bound
        let response =
            with_deadline(self.inner.request_timeout, self.inner.send("/v3/watch", &body)).await?;

        let decoder = WatchDecoder {
            body: response.bytes_stream().boxed(),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        };

        Ok(futures::stream::unfold(decoder, WatchDecoder::next).boxed())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        let body = serde_json::json!({ "TTL": ttl_secs, "ID": 0 });

        let response: LeaseGrantResponse =
            with_deadline(self.inner.request_timeout, self.inner.post("/v3/lease/grant", body))
                .await?;

        if !response.error.is_empty() {
            return Err(StoreError::Unavailable(response.error));
        }
        if response.id == 0 {
            return Err(StoreError::Decode("lease grant returned no ID".to_string()));
        }

        Ok(LeaseId(response.id))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        // The first renewal doubles as an existence check
        let first = with_deadline(self.inner.request_timeout, self.inner.keep_alive_once(lease)).await?;

        let renewer = Renewer {
            client: self.inner.clone(),
            lease,
            pending: Some(first),
            interval: renew_interval(first.ttl),
            done: false,
        };

        Ok(futures::stream::unfold(renewer, Renewer::next).boxed())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        let body = serde_json::json!({ "ID": lease.0.to_string() });

        let _: serde_json::Value =
            with_deadline(self.inner.request_timeout, self.inner.post("/v3/lease/revoke", body))
                .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "etcd"
    }
}

fn renew_interval(ttl: i64) -> Duration {
    Duration::from_millis((ttl.max(1) as u64 * 1000) / 3)
}

struct Renewer {
    client: Arc<Client>,
    lease: LeaseId,
    pending: Option<KeepAliveAck>,
    interval: Duration,
    done: bool,
}

impl Renewer {
    async fn next(mut self) -> Option<(Result<KeepAliveAck, StoreError>, Self)> {
        if self.done {
            return None;
        }
        if let Some(ack) = self.pending.take() {
            return Some((Ok(ack), self));
        }

        tokio::time::sleep(self.interval).await;

        let ack = with_deadline(self.client.request_timeout, self.client.keep_alive_once(self.lease)).await;
        match &ack {
            Ok(ack) => self.interval = renew_interval(ack.ttl),
            Err(_) => self.done = true,
        }
        Some((ack, self))
    }
}

struct WatchDecoder {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Vec<u8>,
    pending: VecDeque<WatchEvent>,
    done: bool,
}

impl WatchDecoder {
    async fn next(mut self) -> Option<(Result<WatchEvent, StoreError>, Self)> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some((Ok(event), self));
            }
            if self.done {
                return None;
            }

            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                match parse_watch_line(&line) {
                    Ok(events) => self.pending.extend(events),
                    Err(e) => {
                        self.done = true;
                        return Some((Err(e), self));
                    }
                }
                continue;
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.done = true;
                    return Some((Err(StoreError::Http(e)), self));
                }
                None => {
                    self.done = true;
                    let rest = std::mem::take(&mut self.buffer);
                    if let Ok(events) = parse_watch_line(&rest) {
                        self.pending.extend(events);
                    }
                }
            }
        }
    }
}

/// Decode one line of the `/v3/watch` response stream
fn parse_watch_line(line: &[u8]) -> Result<Vec<WatchEvent>, StoreError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    let envelope: WatchEnvelope =
        serde_json::from_slice(line).map_err(|e| StoreError::Decode(e.to_string()))?;

    if let Some(error) = envelope.error {
        return Err(StoreError::Unavailable(error.message));
    }

    let Some(result) = envelope.result else {
        return Ok(Vec::new());
    };

    if result.canceled {
        return Err(StoreError::Unavailable(format!(
            "watch canceled: {}",
            result.cancel_reason
        )));
    }

    result
        .events
        .into_iter()
        .map(|event| {
            let kind = if event.kind == "DELETE" {
                WatchEventKind::Delete
            } else {
                WatchEventKind::Put
            };
            let kv = event.kv.decode()?;
            Ok(WatchEvent {
                kind,
                key: kv.key,
                value: kv.value,
            })
        })
        .collect()
}

/// Accept int64 as JSON string or number
fn int64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawKv {
    key: String,
    value: String,
}

impl RawKv {
    fn decode(self) -> Result<KeyValue, StoreError> {
        let key = String::from_utf8(decode_b64(&self.key)?)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(KeyValue {
            key,
            value: decode_b64(&self.value)?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RangeResponse {
    kvs: Vec<RawKv>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LeaseGrantResponse {
    #[serde(rename = "ID", deserialize_with = "int64")]
    id: i64,
    #[serde(rename = "TTL", deserialize_with = "int64")]
    #[allow(dead_code)]
    ttl: i64,
    error: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LeaseKeepAliveResult {
    #[serde(rename = "TTL", deserialize_with = "int64")]
    ttl: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GatewayError {
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KeepAliveEnvelope {
    result: Option<LeaseKeepAliveResult>,
    error: Option<GatewayError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    kv: RawKv,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WatchResult {
    canceled: bool,
    cancel_reason: String,
    events: Vec<RawEvent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WatchEnvelope {
    result: Option<WatchResult>,
    error: Option<GatewayError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthResponse {
    token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etcd_store_creation() {
        let etcd = EtcdStore::new(&StoreConfig::new(["http://localhost:2379/"])).unwrap();
        assert_eq!(etcd.endpoints(), ["http://localhost:2379".to_string()]);
        assert_eq!(etcd.name(), "etcd");
    }

    #[test]
    fn test_no_endpoints() {
        let result = EtcdStore::new(&StoreConfig::new(Vec::<String>::new()));
        assert!(matches!(result, Err(StoreError::NoEndpoints)));
    }

    #[test]
    fn test_invalid_endpoint() {
        let result = EtcdStore::new(&StoreConfig::new(["not a url"]));
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_range_end_for_prefix() {
        assert_eq!(range_end("registry/api/"), b"registry/api0".to_vec());
    }

    #[test]
    fn test_lease_grant_accepts_string_int64() {
        let response: LeaseGrantResponse =
            serde_json::from_str(r#"{"header":{},"ID":"7587862072823540234","TTL":"60"}"#).unwrap();
        assert_eq!(response.id, 7587862072823540234);
        assert_eq!(response.ttl, 60);

        let response: LeaseGrantResponse = serde_json::from_str(r#"{"ID":12,"TTL":5}"#).unwrap();
        assert_eq!(response.id, 12);
    }

    #[test]
    fn test_keepalive_of_missing_lease_has_no_ttl() {
        let envelope: KeepAliveEnvelope =
            serde_json::from_str(r#"{"result":{"header":{},"ID":"12"}}"#).unwrap();
        assert_eq!(envelope.result.map(|r| r.ttl), Some(0));
    }

    #[test]
    fn test_range_response_decoding() {
        let raw = format!(
            r#"{{"header":{{}},"kvs":[{{"key":"{}","value":"{}","lease":"5"}}],"count":"1"}}"#,
            encode(b"registry/api/1"),
            encode(br#"{"name":"api"}"#),
        );
        let response: RangeResponse = serde_json::from_str(&raw).unwrap();
        let kv = response.kvs.into_iter().next().unwrap().decode().unwrap();

        assert_eq!(kv.key, "registry/api/1");
        assert_eq!(kv.value, br#"{"name":"api"}"#.to_vec());

        let empty: RangeResponse = serde_json::from_str(r#"{"header":{}}"#).unwrap();
        assert!(empty.kvs.is_empty());
    }

    #[test]
    fn test_parse_watch_lines() {
        assert!(parse_watch_line(b"\n").unwrap().is_empty());
        assert!(
            parse_watch_line(br#"{"result":{"header":{},"created":true}}"#)
                .unwrap()
                .is_empty()
        );

        let line = format!(
            r#"{{"result":{{"events":[{{"kv":{{"key":"{}","value":"{}"}}}},{{"type":"DELETE","kv":{{"key":"{}"}}}}]}}}}"#,
            encode(b"registry/api/1"),
            encode(b"v"),
            encode(b"registry/api/2"),
        );
        let events = parse_watch_line(line.as_bytes()).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, WatchEventKind::Put);
        assert_eq!(events[0].value, b"v".to_vec());
        assert_eq!(events[1].kind, WatchEventKind::Delete);
        assert_eq!(events[1].key, "registry/api/2");
    }

    #[test]
    fn test_parse_watch_errors() {
        let canceled = parse_watch_line(br#"{"result":{"canceled":true,"cancel_reason":"compacted"}}"#);
        assert!(matches!(canceled, Err(StoreError::Unavailable(msg)) if msg.contains("compacted")));

        let gateway = parse_watch_line(br#"{"error":{"grpc_code":14,"message":"unavailable"}}"#);
        assert!(matches!(gateway, Err(StoreError::Unavailable(_))));

        assert!(matches!(parse_watch_line(b"{oops"), Err(StoreError::Decode(_))));
    }

    #[tokio::test]
    async fn test_watch_decoder_splits_chunks() {
        let line = format!(
            "{}\n{}\n",
            r#"{"result":{"created":true}}"#,
            format_args!(
                r#"{{"result":{{"events":[{{"kv":{{"key":"{}","value":""}}}}]}}}}"#,
                encode(b"k")
            ),
        );
        let bytes = line.into_bytes();
        let (a, b) = bytes.split_at(17);
        let chunks: Vec<reqwest::Result<Bytes>> =
            vec![Ok(Bytes::copy_from_slice(a)), Ok(Bytes::copy_from_slice(b))];

        let decoder = WatchDecoder {
            body: futures::stream::iter(chunks).boxed(),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        };
        let events: Vec<_> = futures::stream::unfold(decoder, WatchDecoder::next).collect().await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().key, "k");
    }

    #[test]
    fn test_renew_interval() {
        assert_eq!(renew_interval(60), Duration::from_secs(20));
        assert_eq!(renew_interval(0), Duration::from_millis(333));
    }
}
