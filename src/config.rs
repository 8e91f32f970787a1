use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::EvictionLimits;
use crate::connectivity::MonitorOptions;
use crate::gateway::{
  GatewayOptions, DEFAULT_AZURE_API_VERSION, DEFAULT_GITHUB_API_URL, DEFAULT_GLOBAL_LIMIT,
  DEFAULT_PER_REPO_LIMIT, DEFAULT_TARGET_RATIO,
};
use crate::remote::{RemoteOptions, RetryPolicy};
use crate::repo::Provider;

const APP_DIR: &str = "reposync";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub remote: RemoteConfig,
  pub connectivity: ConnectivityConfig,
  pub providers: ProvidersConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Defaults to `<data-dir>/reposync/cache`
  pub root: Option<PathBuf>,
  pub per_repo_limit_bytes: u64,
  pub global_limit_bytes: u64,
  /// Fraction of a limit eviction drops to
  pub eviction_target_ratio: f64,
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      root: None,
      per_repo_limit_bytes: DEFAULT_PER_REPO_LIMIT,
      global_limit_bytes: DEFAULT_GLOBAL_LIMIT,
      eviction_target_ratio: DEFAULT_TARGET_RATIO,
      sweep_interval_secs: 3600,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  /// `null` retries until the call timeout
  pub max_attempts: Option<u32>,
  pub jitter_ratio: f64,
  pub call_timeout_secs: u64,
  pub attempt_timeout_secs: u64,
  pub user_agent: String,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      base_delay_ms: 1000,
      max_delay_ms: 32_000,
      max_attempts: Some(5),
      jitter_ratio: 0.25,
      call_timeout_secs: 60,
      attempt_timeout_secs: 30,
      user_agent: format!("reposync/{}", env!("CARGO_PKG_VERSION")),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_timeout_ms: u64,
  pub recovery_base_ms: u64,
  pub recovery_max_ms: u64,
  pub steady_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_timeout_ms: 4000,
      recovery_base_ms: 2000,
      recovery_max_ms: 60_000,
      steady_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
  pub github_api_url: String,
  pub azure_api_version: String,
}

impl Default for ProvidersConfig {
  fn default() -> Self {
    Self {
      github_api_url: DEFAULT_GITHUB_API_URL.to_string(),
      azure_api_version: DEFAULT_AZURE_API_VERSION.to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when `RUST_LOG` is unset
  pub level: String,
  /// Defaults to `<data-dir>/reposync/logs`
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl LoggingConfig {
  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.directory {
      Some(dir) => Ok(dir.clone()),
      None => Ok(data_dir()?.join("logs")),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./reposync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/reposync/config.yaml
  ///
  /// Without a file every setting takes its default.
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
    let local = PathBuf::from("reposync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let cache = &self.cache;
    if cache.per_repo_limit_bytes == 0 || cache.global_limit_bytes == 0 {
      return Err(eyre!("cache limits must be greater than zero"));
    }
    if !(0.0..=1.0).contains(&cache.eviction_target_ratio) {
      return Err(eyre!(
        "eviction_target_ratio must be between 0 and 1, got {}",
        cache.eviction_target_ratio
      ));
    }
    if cache.sweep_interval_secs == 0 || self.connectivity.steady_interval_secs == 0 {
      return Err(eyre!("intervals must be greater than zero"));
    }
    if self.remote.max_attempts == Some(0) {
      return Err(eyre!("max_attempts must be at least 1 (or null for unbounded)"));
    }
    Ok(())
  }

  pub fn cache_root(&self) -> Result<PathBuf> {
    match &self.cache.root {
      Some(root) => Ok(root.clone()),
      None => Ok(data_dir()?.join("cache")),
    }
  }

  pub fn gateway_options(&self) -> Result<GatewayOptions> {
    let mut options = GatewayOptions::new(self.cache_root()?);
    options.limits = EvictionLimits {
      per_repo: self.cache.per_repo_limit_bytes,
      global: self.cache.global_limit_bytes,
      target_ratio: self.cache.eviction_target_ratio,
    };
    options.remote = RemoteOptions {
      policy: RetryPolicy {
        base_delay: Duration::from_millis(self.remote.base_delay_ms),
        max_delay: Duration::from_millis(self.remote.max_delay_ms),
        max_attempts: self.remote.max_attempts,
        jitter_ratio: self.remote.jitter_ratio,
      },
      call_timeout: Duration::from_secs(self.remote.call_timeout_secs),
      attempt_timeout: Duration::from_secs(self.remote.attempt_timeout_secs),
    };
    options.monitor = MonitorOptions {
      probe_timeout: Duration::from_millis(self.connectivity.probe_timeout_ms),
      recovery_base: Duration::from_millis(self.connectivity.recovery_base_ms),
      recovery_max: Duration::from_millis(self.connectivity.recovery_max_ms),
      steady_interval: Duration::from_secs(self.connectivity.steady_interval_secs),
    };
    options.sweep_interval = Duration::from_secs(self.cache.sweep_interval_secs);
    options.github_api_url = self.providers.github_api_url.clone();
    options.azure_api_version = self.providers.azure_api_version.clone();
    Ok(options)
  }

  /// Get the API token for `provider` from environment variables.
  ///
  /// Checks REPOSYNC_TOKEN first, then GITHUB_TOKEN or AZURE_DEVOPS_TOKEN.
  pub fn api_token(provider: Provider) -> Option<String> {
    let fallback = match provider {
      Provider::GitHub => "GITHUB_TOKEN",
      Provider::AzureDevOps => "AZURE_DEVOPS_TOKEN",
    };
    std::env::var("REPOSYNC_TOKEN")
      .or_else(|_| std::env::var(fallback))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}

fn data_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .map(|d| d.join(APP_DIR))
    .ok_or_else(|| eyre!("Could not determine data directory"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.cache.per_repo_limit_bytes, 256 * 1024 * 1024);
    assert_eq!(config.remote.max_attempts, Some(5));
    assert_eq!(config.connectivity.probe_timeout_ms, 4000);
    assert_eq!(config.providers.azure_api_version, "7.1");
    assert_eq!(config.logging.level, "info");
  }

  #[test]
  fn test_partial_sections() {
    let yaml = r#"
cache:
  root: /tmp/reposync-test
  per_repo_limit_bytes: 1000
remote:
  max_attempts: null
providers:
  github_api_url: https://ghe.example.com/api/v3
"#;
    let config = Config::parse(yaml).unwrap();
    let options = config.gateway_options().unwrap();
    assert_eq!(options.cache_root, PathBuf::from("/tmp/reposync-test"));
    assert_eq!(options.limits.per_repo, 1000);
    assert_eq!(options.limits.global, 1024 * 1024 * 1024);
    assert_eq!(options.remote.policy.max_attempts, None);
    assert_eq!(options.remote.policy.max_delay, Duration::from_secs(32));
    assert_eq!(options.github_api_url, "https://ghe.example.com/api/v3");
  }

  #[test]
  fn test_rejects_bad_values() {
    assert!(Config::parse("cache:\n  eviction_target_ratio: 1.5\n").is_err());
    assert!(Config::parse("cache:\n  global_limit_bytes: 0\n").is_err());
    assert!(Config::parse("remote:\n  max_attempts: 0\n").is_err());
    assert!(Config::parse("cache: [1, 2]\n").is_err());
  }

  #[test]
  fn test_missing_explicit_file_is_an_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let missing = dir.path().join("nope.yaml");
    assert!(Config::load(Some(&missing)).is_err());

    let present = dir.path().join("reposync.yaml");
    std::fs::write(&present, "logging:\n  level: debug\n").unwrap();
    assert_eq!(Config::load(Some(&present)).unwrap().logging.level, "debug");
  }
}
