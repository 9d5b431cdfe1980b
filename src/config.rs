use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub circuit: CircuitConfig,
  #[serde(default)]
  pub auth: AuthConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub paging: PagingConfig,
  #[serde(default)]
  pub push: PushConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Backend gateway base URL
  pub base_url: String,
  pub timeout_secs: u64,
  /// Retries for 5xx responses (never 4xx)
  pub max_retries: u32,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8080".to_string(),
      timeout_secs: 30,
      max_retries: 3,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
  /// Consecutive network-level failures before the circuit opens
  pub failure_threshold: u32,
  pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      cooldown_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
  /// Token refreshes allowed per session before credentials are dropped
  pub max_refresh_attempts: u32,
}

impl Default for AuthConfig {
  fn default() -> Self {
    Self {
      max_refresh_attempts: 2,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_secs: u64,
  pub feed_ttl_secs: u64,
  pub detail_ttl_secs: u64,
  pub notification_ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: 30,
      feed_ttl_secs: 60,
      detail_ttl_secs: 300,
      notification_ttl_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
  pub page_size: u32,
  pub notification_page_size: u32,
  /// Safety cap on pages fetched per list
  pub max_pages: u32,
}

impl Default for PagingConfig {
  fn default() -> Self {
    Self {
      page_size: 10,
      notification_page_size: 20,
      max_pages: 50,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
  pub enabled: bool,
  /// Event stream URL (defaults to `<base_url>/events`)
  pub url: Option<String>,
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      url: None,
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl CircuitConfig {
  pub fn cooldown(&self) -> Duration {
    Duration::from_secs(self.cooldown_secs)
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }

  pub fn feed_ttl(&self) -> Duration {
    Duration::from_secs(self.feed_ttl_secs)
  }

  pub fn detail_ttl(&self) -> Duration {
    Duration::from_secs(self.detail_ttl_secs)
  }

  pub fn notification_ttl(&self) -> Duration {
    Duration::from_secs(self.notification_ttl_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./perch.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/perch/config.yaml
  ///
  /// Without any file the defaults are used. `PERCH_API_URL` and
  /// `PERCH_PUSH_URL` override the file.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    Ok(config.with_env_overrides())
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("perch.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("perch").join("config.yaml");
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

  pub fn from_yaml(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty document deserializes as unit, not as a mapping
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }

  fn with_env_overrides(mut self) -> Self {
    if let Ok(url) = std::env::var("PERCH_API_URL") {
      self.api.base_url = url;
    }
    if let Ok(url) = std::env::var("PERCH_PUSH_URL") {
      self.push.url = Some(url);
    }
    self
  }

  /// Resolved event stream URL.
  pub fn push_url(&self) -> String {
    self.push.url.clone().unwrap_or_else(|| {
      format!("{}/events", self.api.base_url.trim_end_matches('/'))
    })
  }
}
