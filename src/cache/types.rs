//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Last known value of a named reference dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
  pub key: String,
  /// `Null` is a legitimate cached value
  pub payload: Value,
  pub updated_at: DateTime<Utc>,
}

/// Result from a read-through fetch, including where the data came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the served data was last written to the cache
  pub cached_at: DateTime<Utc>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  pub fn is_offline(&self) -> bool {
    self.source == CacheSource::Offline
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}
