//! Cache layer that falls back to stored data when the remote is unreachable.

use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::{ApiRequest, Remote};
use crate::db::Database;
use crate::error::{Error, Result};

use super::types::{CacheEntry, CacheResult};

/// Key/value cache of reference data, backed by the local store.
#[derive(Clone)]
pub struct ReadThroughCache {
  db: Arc<Database>,
}

impl ReadThroughCache {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    self.db.get_cache_item(key)
  }

  /// Upsert `payload` under `key` and stamp it with the current time.
  pub fn set(&self, key: &str, payload: &Value) -> Result<()> {
    self.db.put_cache_item(key, payload, Utc::now())
  }

  pub fn delete(&self, key: &str) -> Result<bool> {
    self.db.delete_cache_item(key)
  }

  pub fn keys(&self) -> Result<Vec<String>> {
    self.db.cache_keys()
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Run the fetcher
  /// 2. On success, write the value through and return it
  /// 3. On a transport failure, serve the cached value (offline mode)
  /// 4. Any other failure, or a transport failure with nothing cached, propagates
  pub async fn fetch<F, Fut>(&self, key: &str, fetcher: F) -> Result<CacheResult<Value>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>>,
  {
    match fetcher().await {
      Ok(data) => {
        let now = Utc::now();
        self.db.put_cache_item(key, &data, now)?;
        debug!(key, "cache refreshed from network");
        Ok(CacheResult::from_network(data, now))
      }
      Err(Error::Transport(e)) => match self.get(key)? {
        Some(entry) => {
          warn!(key, error = %e, updated_at = %entry.updated_at, "remote unreachable, serving cached data");
          Ok(CacheResult::offline(entry.payload, entry.updated_at))
        }
        None => Err(Error::Transport(e)),
      },
      Err(e) => Err(e),
    }
  }

  /// Read-through a GET against the remote.
  pub async fn fetch_remote<R: Remote>(
    &self,
    key: &str,
    remote: &R,
    request: &ApiRequest,
  ) -> Result<CacheResult<Value>> {
    self
      .fetch(key, || async {
        let response = remote.execute(request).await?;
        response.into_result()
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiResponse;
  use crate::cache::CacheSource;
  use crate::error::TransportError;
  use serde_json::json;

  fn cache() -> ReadThroughCache {
    ReadThroughCache::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  struct FixedRemote(std::result::Result<ApiResponse, TransportError>);

  impl Remote for FixedRemote {
    async fn execute(
      &self,
      _request: &ApiRequest,
    ) -> std::result::Result<ApiResponse, TransportError> {
      self.0.clone()
    }
  }

  #[test]
  fn test_set_get_delete() {
    let cache = cache();
    assert!(cache.get("locations").unwrap().is_none());

    cache.set("locations", &json!([{"id": "L1"}])).unwrap();
    cache.set("locations", &json!([{"id": "L2"}])).unwrap();
    let entry = cache.get("locations").unwrap().unwrap();
    assert_eq!(entry.payload, json!([{"id": "L2"}]));

    cache.set("empty", &Value::Null).unwrap();
    assert_eq!(cache.get("empty").unwrap().unwrap().payload, Value::Null);
    assert_eq!(cache.keys().unwrap(), vec!["empty", "locations"]);

    assert!(cache.delete("locations").unwrap());
    assert!(cache.get("locations").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_success_writes_through() {
    let cache = cache();
    let remote = FixedRemote(Ok(ApiResponse::new(200, json!([{"id": "L1"}]))));

    let result = cache
      .fetch_remote("locations", &remote, &ApiRequest::get("/locations"))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(
      cache.get("locations").unwrap().unwrap().payload,
      json!([{"id": "L1"}])
    );
  }

  #[tokio::test]
  async fn test_transport_failure_serves_cache() {
    let cache = cache();
    cache.set("locations", &json!([{"id": "L1"}])).unwrap();
    let stored_at = cache.get("locations").unwrap().unwrap().updated_at;

    let remote = FixedRemote(Err(TransportError::new("connection refused")));
    let result = cache
      .fetch_remote("locations", &remote, &ApiRequest::get("/locations"))
      .await
      .unwrap();
    assert!(result.is_offline());
    assert_eq!(result.data, json!([{"id": "L1"}]));
    assert_eq!(result.cached_at, stored_at);
  }

  #[tokio::test]
  async fn test_transport_failure_without_cache_propagates() {
    let cache = cache();
    let remote = FixedRemote(Err(TransportError::timeout("deadline")));
    let err = cache
      .fetch_remote("locations", &remote, &ApiRequest::get("/locations"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
  }

  #[tokio::test]
  async fn test_http_error_does_not_fall_back() {
    let cache = cache();
    cache.set("locations", &json!([{"id": "L1"}])).unwrap();

    let remote = FixedRemote(Ok(ApiResponse::new(403, json!({"error": "forbidden"}))));
    let err = cache
      .fetch_remote("locations", &remote, &ApiRequest::get("/locations"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::RemoteRejected { status: 403, .. }));
    // Cached value untouched
    assert_eq!(
      cache.get("locations").unwrap().unwrap().payload,
      json!([{"id": "L1"}])
    );
  }
}
