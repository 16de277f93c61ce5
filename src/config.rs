use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache::DriverKind;
use crate::db::Database;
use crate::error::ConfigError;
use crate::sync::{AdapterKind, HttpDefaults, HttpVerb, ModelDescriptor};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub http: HttpConfig,
  /// Model name to adapter settings
  #[serde(default)]
  pub adapters: BTreeMap<String, AdapterConfig>,
  #[serde(default)]
  pub offline: OfflineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Backend name: "database" (default) or "file"
  #[serde(default)]
  pub driver: DriverKind,
  /// Storage directory (defaults to the platform data dir)
  pub directory: Option<PathBuf>,
  /// TTL in seconds used when a read does not ask for one
  pub default_ttl: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      driver: DriverKind::default(),
      directory: None,
      default_ttl: None,
    }
  }
}

impl CacheConfig {
  pub fn directory(&self) -> Result<PathBuf> {
    match &self.directory {
      Some(dir) => Ok(dir.clone()),
      None => Ok(Database::default_dir()?.join("cache")),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
  #[serde(default = "default_timeout")]
  pub timeout_secs: u64,
  /// Headers sent with every request
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout(),
      headers: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
  #[serde(default)]
  pub kind: AdapterKind,
  pub base_url: String,
  #[serde(default = "default_id_attribute")]
  pub id_attribute: String,
  /// Field holding the array in wrapped collection responses
  #[serde(default = "default_collection_wrapper")]
  pub collection_wrapper: String,
  /// Rewrite PUT/PATCH/DELETE as POST with a method override header
  #[serde(default)]
  pub emulate_http: bool,
  /// Verb used for full updates (adapter default when unset)
  pub update_method: Option<HttpVerb>,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub query: BTreeMap<String, String>,
  /// Cache reads of this model for this many seconds
  pub ttl: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflineHandlerKind {
  /// SQLite mirror next to the cache
  #[default]
  Local,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OfflineConfig {
  /// Handler backing offline models; offline adapters fail to load without one
  pub handler: Option<OfflineHandlerKind>,
  /// Mirror database location (defaults to the platform data dir)
  pub path: Option<PathBuf>,
}

impl OfflineConfig {
  pub fn path(&self) -> Result<PathBuf> {
    match &self.path {
      Some(path) => Ok(path.clone()),
      None => Ok(Database::default_dir()?.join("offline.db")),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_timeout() -> u64 {
  30
}

fn default_id_attribute() -> String {
  "id".to_string()
}

fn default_collection_wrapper() -> String {
  "data".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./modelsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/modelsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/modelsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("modelsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("modelsync").join("config.yaml");
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

  /// Build the descriptor for the model called `name`.
  pub fn descriptor(&self, name: &str) -> std::result::Result<ModelDescriptor, ConfigError> {
    let adapter = self
      .adapters
      .get(name)
      .ok_or_else(|| ConfigError::MissingAdapter(name.to_string()))?;

    Ok(ModelDescriptor {
      name: name.to_string(),
      adapter: adapter.kind,
      base_url: adapter.base_url.clone(),
      id_attribute: adapter.id_attribute.clone(),
      collection_wrapper: adapter.collection_wrapper.clone(),
      http_defaults: HttpDefaults {
        headers: adapter.headers.clone(),
        query: adapter.query.clone(),
        emulate_http: adapter.emulate_http,
        update_method: adapter.update_method,
        ttl: adapter.ttl,
      },
    })
  }

  /// Get the API token from environment variables, if one is set.
  ///
  /// Checks MODELSYNC_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("MODELSYNC_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = r#"
cache:
  driver: file
  directory: /tmp/modelsync-test
  default_ttl: 120
http:
  timeout_secs: 5
adapters:
  users:
    kind: rest
    base_url: https://api.example.com/v1/
    emulate_http: true
  articles:
    kind: hateoas
    base_url: https://api.example.com
    id_attribute: uuid
    update_method: POST
    query:
      lang: en
offline:
  handler: local
"#;

  #[test]
  fn test_parse_sample() {
    let config = Config::from_yaml(SAMPLE).unwrap();
    assert_eq!(config.cache.driver, DriverKind::File);
    assert_eq!(config.cache.default_ttl, Some(120));
    assert_eq!(config.http.timeout_secs, 5);
    assert_eq!(config.offline.handler, Some(OfflineHandlerKind::Local));

    let users = config.descriptor("users").unwrap();
    assert_eq!(users.adapter, AdapterKind::Rest);
    assert_eq!(users.id_attribute, "id");
    assert_eq!(users.collection_wrapper, "data");
    assert!(users.http_defaults.emulate_http);

    let articles = config.descriptor("articles").unwrap();
    assert_eq!(articles.id_attribute, "uuid");
    assert_eq!(articles.http_defaults.update_method, Some(HttpVerb::Post));
    assert_eq!(articles.http_defaults.query.get("lang").map(String::as_str), Some("en"));
  }

  #[test]
  fn test_defaults_when_sections_missing() {
    let config = Config::from_yaml("adapters: {}").unwrap();
    assert!(config.cache.enabled);
    assert_eq!(config.cache.driver, DriverKind::Database);
    assert_eq!(config.http.timeout_secs, 30);
    assert!(config.offline.handler.is_none());
  }

  #[test]
  fn test_unknown_driver_fails_at_load() {
    let err = Config::from_yaml("cache:\n  driver: redis\n").unwrap_err();
    assert!(err.to_string().contains("redis"));
  }

  #[test]
  fn test_unknown_offline_handler_fails_at_load() {
    assert!(Config::from_yaml("offline:\n  handler: icloud\n").is_err());
  }

  #[test]
  fn test_missing_adapter() {
    let config = Config::default();
    assert_eq!(
      config.descriptor("ghost").unwrap_err(),
      ConfigError::MissingAdapter("ghost".into())
    );
  }
}
