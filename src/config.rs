use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheSettings, FreshnessPolicy, PolicySet, StoreLimits};
use crate::datastore::DataStore;
use crate::errlog::ErrorLog;
use crate::network::NetworkMonitor;
use crate::preload::PreloadSettings;
use crate::query::QueryContext;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub remote: RemoteConfig,
  pub cache: CacheConfig,
  pub retry: RetryConfig,
  pub store: StoreConfig,
  pub preload: PreloadConfig,
  pub hooks: HooksConfig,
  pub errors: ErrorLogConfig,
  /// Branch used when none is given on the command line
  pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Base URL of the REST endpoint (e.g. https://xyz.supabase.co)
  pub url: String,
  pub timeout_secs: u64,
  /// Rows requested per page
  pub page_size: usize,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: String::new(),
      timeout_secs: 30,
      page_size: 1000,
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WindowConfig {
  pub fresh_for_secs: u64,
  pub expire_after_secs: u64,
}

impl WindowConfig {
  fn policy(self) -> FreshnessPolicy {
    FreshnessPolicy::new(
      chrono::Duration::seconds(saturating_secs(self.fresh_for_secs)),
      chrono::Duration::seconds(saturating_secs(self.expire_after_secs)),
    )
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub fresh_for_secs: u64,
  pub expire_after_secs: u64,
  pub fetch_timeout_secs: u64,
  /// Per-collection freshness windows, keyed by collection name
  pub collections: BTreeMap<String, WindowConfig>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      fresh_for_secs: 60 * 60,
      expire_after_secs: 24 * 60 * 60,
      fetch_timeout_secs: 120,
      collections: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 500,
      max_delay_ms: 30_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Persist collections across restarts
  pub enabled: bool,
  /// Database path (default: $XDG_DATA_HOME/tillcache/cache.db)
  pub path: Option<PathBuf>,
  pub max_bytes: u64,
  pub max_age_secs: u64,
}

impl Default for StoreConfig {
  fn default() -> Self {
    let limits = StoreLimits::default();
    Self {
      enabled: true,
      path: None,
      max_bytes: limits.max_bytes,
      max_age_secs: limits.max_age.num_seconds().max(0) as u64,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
  pub initial_delay_ms: u64,
  pub refresh_interval_secs: u64,
  pub foreground_min_interval_secs: u64,
}

impl Default for PreloadConfig {
  fn default() -> Self {
    let defaults = PreloadSettings::default();
    Self {
      initial_delay_ms: defaults.initial_delay.as_millis() as u64,
      refresh_interval_secs: defaults.refresh_interval.as_secs(),
      foreground_min_interval_secs: defaults.foreground_min_interval.as_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
  /// Lifetime of hook-level cache entries
  pub ttl_secs: u64,
}

impl Default for HooksConfig {
  fn default() -> Self {
    Self { ttl_secs: 5 * 60 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ErrorLogConfig {
  pub capacity: usize,
  pub retention_days: i64,
}

impl Default for ErrorLogConfig {
  fn default() -> Self {
    Self {
      capacity: 1000,
      retention_days: 90,
    }
  }
}

fn saturating_secs(secs: u64) -> i64 {
  i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000 - 1)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tillcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tillcache/config.yaml
  ///
  /// Without any file every setting takes its default.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tillcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tillcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-default configuration
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Get the REST API key from environment variables.
  ///
  /// Checks TILLCACHE_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("TILLCACHE_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("API key not found. Set TILLCACHE_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }

  pub fn policies(&self) -> PolicySet {
    let default = WindowConfig {
      fresh_for_secs: self.cache.fresh_for_secs,
      expire_after_secs: self.cache.expire_after_secs,
    };
    self
      .cache
      .collections
      .iter()
      .fold(PolicySet::new(default.policy()), |set, (name, window)| {
        set.with_override(name.clone(), window.policy())
      })
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::new(
      self.retry.max_attempts,
      Duration::from_millis(self.retry.base_delay_ms),
    )
    .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
  }

  pub fn store_limits(&self) -> StoreLimits {
    StoreLimits {
      max_bytes: self.store.max_bytes,
      max_age: chrono::Duration::seconds(saturating_secs(self.store.max_age_secs)),
    }
  }

  pub fn cache_settings(&self, network: NetworkMonitor) -> CacheSettings {
    CacheSettings {
      policies: self.policies(),
      retry: self.retry_policy(),
      network,
      fetch_timeout: Duration::from_secs(self.cache.fetch_timeout_secs),
      error_log: Arc::new(ErrorLog::new(
        self.errors.capacity,
        chrono::Duration::days(self.errors.retention_days),
      )),
    }
  }

  pub fn preload_settings(&self) -> PreloadSettings {
    PreloadSettings {
      initial_delay: Duration::from_millis(self.preload.initial_delay_ms),
      refresh_interval: Duration::from_secs(self.preload.refresh_interval_secs),
      foreground_min_interval: Duration::from_secs(self.preload.foreground_min_interval_secs),
    }
  }

  /// Tiers for per-entity queries: hook TTL, the shared fetch ceiling and
  /// the retry policy bound to `network`.
  pub fn query_context(&self, datastore: DataStore, network: NetworkMonitor) -> QueryContext {
    QueryContext::new(datastore, self.retry_policy().with_network(network))
      .with_ttl(Duration::from_secs(self.hooks.ttl_secs))
      .with_fetch_timeout(Duration::from_secs(self.cache.fetch_timeout_secs))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_is_default() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.cache.fresh_for_secs, 3600);
    assert!(config.store.enabled);
    assert_eq!(config.retry_policy().max_attempts(), 3);
  }

  #[test]
  fn test_collection_overrides() {
    let config = Config::parse(
      r#"
remote:
  url: https://pos.example.com
cache:
  fresh_for_secs: 600
  collections:
    payment_methods:
      fresh_for_secs: 86400
      expire_after_secs: 604800
default_branch: main
"#,
    )
    .unwrap();

    assert_eq!(config.remote.url, "https://pos.example.com");
    assert_eq!(config.remote.page_size, 1000);
    assert_eq!(config.default_branch.as_deref(), Some("main"));

    let policies = config.policies();
    assert_eq!(
      policies.for_collection("products").fresh_for,
      chrono::Duration::minutes(10)
    );
    assert_eq!(
      policies.for_key("payment_methods").fresh_for,
      chrono::Duration::days(1)
    );
  }

  #[test]
  fn test_query_context() {
    let yaml = "hooks:\n  ttl_secs: 60\ncache:\n  fetch_timeout_secs: 30\n";
    let config = Config::parse(yaml).unwrap();
    let ctx = config.query_context(DataStore::new(), NetworkMonitor::new());
    assert_eq!(ctx.ttl, Duration::from_secs(60));
    assert_eq!(ctx.local.fetch_timeout(), Duration::from_secs(30));

    let defaults = Config::default().query_context(DataStore::new(), NetworkMonitor::new());
    assert_eq!(defaults.ttl, Duration::from_secs(300));
    assert_eq!(defaults.local.fetch_timeout(), Duration::from_secs(120));
  }

  #[test]
  fn test_store_limits() {
    let config = Config::parse("store:\n  max_bytes: 1024\n  max_age_secs: 60\n").unwrap();
    let limits = config.store_limits();
    assert_eq!(limits.max_bytes, 1024);
    assert_eq!(limits.max_age, chrono::Duration::minutes(1));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/tillcache.yaml"))).is_err());
  }
}
