use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::profile::{Profile, Site};

const DEFAULT_DYNAMIC_BUDGET: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Profile brought up by `start` and used when a command names none
  pub profile: Profile,
  /// Store generation; bump to force a fresh install
  pub generation: u32,
  /// Filter used when RUST_LOG is unset
  pub log_level: String,
  /// Write logs to this file instead of stderr
  pub log_file: Option<PathBuf>,
  pub app: AppConfig,
  pub cache: CacheConfig,
  pub network: NetworkConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      profile: Profile::default(),
      generation: 1,
      log_level: "info".to_string(),
      log_file: None,
      app: AppConfig::default(),
      cache: CacheConfig::default(),
      network: NetworkConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
  /// Store name prefix
  pub name: String,
  /// Title used for notifications and the offline page
  pub display_name: String,
  /// Origin the application is served from
  pub origin: String,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      name: "outpost".to_string(),
      display_name: "Outpost".to_string(),
      origin: "http://localhost:8080".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// SQLite database (default: $XDG_DATA_HOME/outpost/cache.db)
  pub path: Option<PathBuf>,
  /// Size the dynamic store is trimmed back to after each write
  pub dynamic_budget_bytes: Option<u64>,
  /// Total bytes across all stores; writes beyond it fail
  pub quota_bytes: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      dynamic_budget_bytes: Some(DEFAULT_DYNAMIC_BUDGET),
      quota_bytes: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./outpost.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/outpost/config.yaml
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
    // Check current directory
    let local = PathBuf::from("outpost.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("outpost").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.generation == 0 {
      return Err(eyre!("generation must be at least 1"));
    }
    Ok(config)
  }

  pub fn site(&self) -> Result<Site> {
    let origin = Url::parse(&self.app.origin)
      .map_err(|e| eyre!("Invalid app origin {}: {}", self.app.origin, e))?;
    Ok(Site {
      app: self.app.name.clone(),
      display_name: self.app.display_name.clone(),
      origin,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::profile::StoreRole;

  #[test]
  fn test_empty_file_takes_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.profile, Profile::Standard);
    assert_eq!(config.generation, 1);
    assert_eq!(config.app.name, "outpost");
    assert_eq!(config.cache.dynamic_budget_bytes, Some(DEFAULT_DYNAMIC_BUDGET));
    assert_eq!(config.network.timeout_secs, 30);
  }

  #[test]
  fn test_parse_full_config() {
    let config = Config::parse(
      r#"
profile: full-offline
generation: 3
log_level: debug
app:
  name: social
  display_name: Social
  origin: https://social.example
cache:
  path: /tmp/social.db
  dynamic_budget_bytes: 1024
  quota_bytes: 4096
network:
  timeout_secs: 5
"#,
    )
    .unwrap();

    assert_eq!(config.profile, Profile::FullOffline);
    assert_eq!(config.cache.quota_bytes, Some(4096));
    let site = config.site().unwrap();
    assert_eq!(site.app, "social");
    assert_eq!(
      site
        .profile_config(config.profile, config.generation)
        .store_name(StoreRole::Static),
      "social-full-offline-static-v3"
    );
  }

  #[test]
  fn test_invalid_origin() {
    let config = Config::parse("app:\n  origin: not a url").unwrap();
    assert!(config.site().is_err());
  }

  #[test]
  fn test_rejects_generation_zero() {
    assert!(Config::parse("generation: 0").is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/outpost.yaml"))).is_err());
  }
}
