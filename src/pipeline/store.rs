//! External content store boundary
//!
//! The engine relies on two calls only: look a record up by its natural key,
//! and upsert it. [`upsert_once`] layers the existence check in front of the
//! write so a key is written at most once per run unless its content changed.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed store response: {0}")]
    Malformed(String),

    #[error("invalid store URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Existence-check-then-write access to the content store
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn fetch_by_natural_key(&self, resource_type: &str, key: &str) -> Result<Option<Value>, StoreError>;

    async fn upsert(&self, resource_type: &str, key: &str, payload: Value) -> Result<Value, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// The stored record already carries every payload field
    Unchanged,
}

/// Fields of a stored record; Strapi nests them under `attributes`
fn record_fields(record: &Value) -> &Value {
    record.get("attributes").unwrap_or(record)
}

fn payload_matches(record: &Value, payload: &Value) -> bool {
    let fields = record_fields(record);
    match payload.as_object() {
        Some(wanted) => wanted.iter().all(|(k, v)| fields.get(k) == Some(v)),
        None => fields == payload,
    }
}

/// Write `payload` under `key` unless an identical record is already stored
pub async fn upsert_once(
    store: &dyn ContentStore,
    resource_type: &str,
    key: &str,
    payload: Value,
) -> Result<UpsertOutcome, StoreError> {
    match store.fetch_by_natural_key(resource_type, key).await? {
        Some(existing) if payload_matches(&existing, &payload) => {
            debug!("{resource_type}/{key} unchanged, skipping write");
            Ok(UpsertOutcome::Unchanged)
        }
        Some(_) => {
            store.upsert(resource_type, key, payload).await?;
            Ok(UpsertOutcome::Updated)
        }
        None => {
            store.upsert(resource_type, key, payload).await?;
            Ok(UpsertOutcome::Created)
        }
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Process-local store, for dry runs and tests
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<(String, String), Value>,
    writes: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, resource_type: &str, key: &str) -> Option<Value> {
        self.records
            .get(&(resource_type.to_string(), key.to_string()))
            .map(|r| r.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of upserts performed
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn fetch_by_natural_key(&self, resource_type: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.get(resource_type, key))
    }

    async fn upsert(&self, resource_type: &str, key: &str, payload: Value) -> Result<Value, StoreError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.records
            .insert((resource_type.to_string(), key.to_string()), payload.clone());
        Ok(payload)
    }
}

// =============================================================================
// Strapi-style HTTP store
// =============================================================================

const DEFAULT_KEY_FIELD: &str = "key";

/// REST client for a Strapi-like CMS
///
/// Records live under `{base}/api/{resource_type}`; lookups filter on a
/// per-type natural key field and writes wrap the payload in `{"data": ...}`.
#[derive(Debug, Clone)]
pub struct HttpContentStore {
    client: Client,
    base_url: url::Url,
    token: Option<String>,
    key_fields: HashMap<String, String>,
}

impl HttpContentStore {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let base_url = url::Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }
        Ok(Self {
            client,
            base_url,
            token,
            key_fields: HashMap::new(),
        })
    }

    /// Natural key field for `resource_type` (default `key`)
    #[must_use]
    pub fn with_key_field(mut self, resource_type: &str, field: &str) -> Self {
        self.key_fields
            .insert(resource_type.to_string(), field.to_string());
        self
    }

    fn key_field(&self, resource_type: &str) -> &str {
        self.key_fields
            .get(resource_type)
            .map_or(DEFAULT_KEY_FIELD, String::as_str)
    }

    /// `{base}/api/{segments..}`, keeping any path the base URL already has
    fn endpoint(&self, segments: &[&str]) -> Result<url::Url, StoreError> {
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|()| StoreError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    fn collection_url(&self, resource_type: &str) -> Result<url::Url, StoreError> {
        self.endpoint(&[resource_type])
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, StoreError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn fetch_by_natural_key(&self, resource_type: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let mut url = self.collection_url(resource_type)?;
        url.query_pairs_mut()
            .append_pair(&format!("filters[{}][$eq]", self.key_field(resource_type)), key);

        let body = self.send(self.client.get(url)).await?;
        match body.get("data") {
            Some(Value::Array(items)) => Ok(items.first().cloned()),
            Some(Value::Null) | None => Ok(None),
            Some(other) => Err(StoreError::Malformed(format!(
                "expected a list under 'data', got {other}"
            ))),
        }
    }

    async fn upsert(&self, resource_type: &str, key: &str, payload: Value) -> Result<Value, StoreError> {
        let mut fields = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        fields
            .entry(self.key_field(resource_type).to_string())
            .or_insert_with(|| Value::String(key.to_string()));
        let body = serde_json::json!({ "data": Value::Object(fields) });

        let existing_id = self
            .fetch_by_natural_key(resource_type, key)
            .await?
            .and_then(|record| record.get("id").cloned());

        let collection = self.collection_url(resource_type)?;
        let request = match existing_id {
            Some(id) => {
                let id = match id {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let url = self.endpoint(&[resource_type, id.as_str()])?;
                self.client.put(url).json(&body)
            }
            None => self.client.post(collection).json(&body),
        };

        let response = self.send(request).await?;
        response
            .get("data")
            .cloned()
            .ok_or_else(|| StoreError::Malformed("missing 'data' in write response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_once_writes_each_key_once() {
        let store = InMemoryStore::new();
        let payload = json!({"name": "Blues", "grade": "U12"});

        let first = upsert_once(&store, "teams", "blues-u12", payload.clone()).await.unwrap();
        let second = upsert_once(&store, "teams", "blues-u12", payload).await.unwrap();

        assert_eq!(first, UpsertOutcome::Created);
        assert_eq!(second, UpsertOutcome::Unchanged);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_upsert_once_updates_changed_record() {
        let store = InMemoryStore::new();
        upsert_once(&store, "teams", "k", json!({"name": "Blues"})).await.unwrap();
        let outcome = upsert_once(&store, "teams", "k", json!({"name": "Reds"})).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(store.get("teams", "k").unwrap()["name"], "Reds");
    }

    #[test]
    fn test_strapi_attributes_are_compared() {
        let record = json!({"id": 4, "attributes": {"name": "Blues", "key": "k"}});
        assert!(payload_matches(&record, &json!({"name": "Blues"})));
        assert!(!payload_matches(&record, &json!({"name": "Reds"})));
    }
}
