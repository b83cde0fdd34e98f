use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::invalidation::RuleSpec;
use crate::resilience::CircuitBreakerSettings;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub transport: TransportConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub circuit_breaker: CircuitBreakerSettings,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub invalidation: InvalidationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
  /// Base URL every resource path is joined onto
  pub base_url: String,
  pub timeout_ms: u64,
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8080/api/".to_string(),
      timeout_ms: 15_000,
    }
  }
}

impl TransportConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// TTL applied when `set` is called without one
  pub default_ttl_ms: u64,
  pub max_entries: usize,
  pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: 5 * 60 * 1000,
      max_entries: 1000,
      sweep_interval_ms: 60_000,
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_millis(self.sweep_interval_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_concurrent_tasks: usize,
  /// Retry n waits `base_delay_ms * n`
  pub base_delay_ms: u64,
  pub max_attempts: u32,
  /// Fallback processing interval while idle
  pub sync_interval_ms: u64,
  /// Keep pending and failed tasks in SQLite across restarts
  pub persist: bool,
  /// Defaults to `$XDG_DATA_HOME/kwdata/sync.db`
  pub db_path: Option<PathBuf>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_concurrent_tasks: 3,
      base_delay_ms: 1000,
      max_attempts: 3,
      sync_interval_ms: 30_000,
      persist: true,
      db_path: None,
    }
  }
}

impl SyncConfig {
  pub fn base_delay(&self) -> Duration {
    Duration::from_millis(self.base_delay_ms)
  }

  pub fn sync_interval(&self) -> Duration {
    Duration::from_millis(self.sync_interval_ms)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvalidationConfig {
  #[serde(default)]
  pub rules: Vec<RuleSpec>,
}

impl Config {
  /// Load configuration from file, falling back to defaults when no file
  /// exists.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./kwdata.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/kwdata/config.yaml
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
    let local = PathBuf::from("kwdata.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("kwdata").join("config.yaml");
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
    Ok(config)
  }

  /// API token from `KWDATA_API_TOKEN`, if set.
  pub fn api_token() -> Option<String> {
    std::env::var("KWDATA_API_TOKEN").ok().filter(|t| !t.is_empty())
  }

  /// Directory for the sync database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("kwdata"))
  }

  pub fn sync_db_path(&self) -> Result<PathBuf> {
    match &self.sync.db_path {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("sync.db")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::invalidation::EventType;

  #[test]
  fn test_empty_yaml_uses_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.cache.max_entries, 1000);
    assert_eq!(config.sync.max_attempts, 3);
    assert_eq!(config.circuit_breaker.defaults.failure_threshold, 5);
    assert!(config.invalidation.rules.is_empty());
  }

  #[test]
  fn test_full_yaml() {
    let yaml = r#"
transport:
  base_url: "https://api.example.com/v1/"
cache:
  default_ttl_ms: 1000
  max_entries: 50
circuit_breaker:
  defaults:
    failure_threshold: 2
    min_requests_before_trip: 1
  resources:
    rankings:
      failure_threshold: 10
      timeout_ms: 60000
sync:
  max_concurrent_tasks: 5
  persist: false
invalidation:
  rules:
    - name: keywords
      pattern: "^keywords"
      triggers: ["keyword:update", "keyword:delete"]
    - name: reports
      pattern: "^reports:"
      depends_on: [keywords]
      triggers: ["report:refresh"]
"#;
    let config = Config::from_yaml(yaml).unwrap();

    assert_eq!(config.transport.base_url, "https://api.example.com/v1/");
    assert_eq!(config.transport.timeout_ms, 15_000);
    assert_eq!(config.cache.default_ttl(), Duration::from_secs(1));
    assert_eq!(config.cache.sweep_interval(), Duration::from_secs(60));
    assert_eq!(config.circuit_breaker.defaults.failure_threshold, 2);

    let rankings = config.circuit_breaker.for_resource("rankings");
    assert_eq!(rankings.failure_threshold, 10);
    assert_eq!(rankings.timeout_duration(), Duration::from_secs(60));
    // Unset override fields fall back to the defaults section
    assert_eq!(rankings.min_requests_before_trip, 1);

    assert!(!config.sync.persist);
    assert_eq!(config.sync.max_concurrent_tasks, 5);

    let rules = &config.invalidation.rules;
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[1].depends_on, vec!["keywords".to_string()]);
    assert_eq!(
      rules[0].triggers[0].parse::<EventType>().unwrap(),
      EventType::mutation("keyword", crate::invalidation::Action::Update)
    );
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let result = Config::load(Some(Path::new("/nonexistent/kwdata.yaml")));
    assert!(result.is_err());
  }
}
