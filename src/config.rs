use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::Database;
use crate::peripherals::PrinterConfig;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub printer: PrinterConfig,
  /// Location of the local store (defaults to $XDG_DATA_HOME/tillsync/tillsync.db)
  pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the commerce API, e.g. https://api.example.com/v1
  pub base_url: String,
  pub tenant_id: String,
  pub location_id: String,
  #[serde(default = "default_channel")]
  pub channel: String,
  /// Per-request timeout; a request exceeding it is a transport failure
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

fn default_channel() -> String {
  "pos".to_string()
}

fn default_timeout_ms() -> u64 {
  15_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// Attempts before a retryable record is parked as failed_permanent.
  /// `null` retries forever.
  #[serde(default = "default_max_attempts")]
  pub max_attempts: Option<u32>,
  #[serde(default = "default_backoff_base_secs")]
  pub backoff_base_secs: u64,
  #[serde(default = "default_backoff_max_secs")]
  pub backoff_max_secs: u64,
}

fn default_max_attempts() -> Option<u32> {
  Some(25)
}

fn default_backoff_base_secs() -> u64 {
  2
}

fn default_backoff_max_secs() -> u64 {
  300
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      backoff_base_secs: default_backoff_base_secs(),
      backoff_max_secs: default_backoff_max_secs(),
    }
  }
}

impl QueueConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      base_delay: Duration::from_secs(self.backoff_base_secs),
      max_delay: Duration::from_secs(self.backoff_max_secs),
      max_attempts: self.max_attempts,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Timer period for background flushes
  #[serde(default = "default_interval_secs")]
  pub interval_secs: u64,
  /// GET endpoint polled to detect that connectivity came back
  #[serde(default = "default_probe_path")]
  pub probe_path: String,
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
}

fn default_interval_secs() -> u64 {
  30
}

fn default_probe_path() -> String {
  "/health".to_string()
}

fn default_probe_interval_secs() -> u64 {
  5
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_interval_secs(),
      probe_path: default_probe_path(),
      probe_interval_secs: default_probe_interval_secs(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tillsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tillsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/tillsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tillsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tillsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    url::Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("api.base_url '{}' is not a valid URL: {}", config.api.base_url, e))?;
    Ok(config)
  }

  /// Resolved path of the local store.
  pub fn database_path(&self) -> Result<PathBuf> {
    self
      .database_path
      .clone()
      .or_else(Database::default_path)
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }

  /// Get the API bearer token from environment variables.
  ///
  /// Checks TILLSYNC_API_TOKEN first, then POS_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("TILLSYNC_API_TOKEN")
      .or_else(|_| std::env::var("POS_API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set TILLSYNC_API_TOKEN or POS_API_TOKEN environment variable.")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::peripherals::PrinterConfig;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml(
      r#"
api:
  base_url: https://api.example.com/v1
  tenant_id: t1
  location_id: L1
"#,
    )
    .unwrap();

    assert_eq!(config.api.channel, "pos");
    assert_eq!(config.api.timeout_ms, 15_000);
    assert_eq!(config.queue.max_attempts, Some(25));
    assert_eq!(config.sync.interval_secs, 30);
    assert_eq!(config.sync.probe_path, "/health");
    assert!(matches!(config.printer, PrinterConfig::None));
    assert!(config.database_path.is_none());
  }

  #[test]
  fn test_unlimited_retries_and_printer() {
    let config = Config::from_yaml(
      r#"
api:
  base_url: https://api.example.com/v1
  tenant_id: t1
  location_id: L1
queue:
  max_attempts: null
  backoff_base_secs: 1
  backoff_max_secs: 60
printer:
  kind: network
  address: 192.168.1.50:9100
database_path: /tmp/till.db
"#,
    )
    .unwrap();

    let policy = config.queue.retry_policy();
    assert_eq!(policy.max_attempts, None);
    assert_eq!(policy.base_delay, Duration::from_secs(1));
    assert_eq!(policy.max_delay, Duration::from_secs(60));
    assert!(matches!(config.printer, PrinterConfig::Network { .. }));
    assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/till.db"));
  }

  #[test]
  fn test_rejects_bad_base_url() {
    let result = Config::from_yaml(
      r#"
api:
  base_url: "::nope"
  tenant_id: t1
  location_id: L1
"#,
    );
    assert!(result.is_err());
  }
}
