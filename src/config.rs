use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::owner::{owner_key, OwnerKind};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub esi: EsiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub owners: Vec<OwnerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EsiConfig {
  pub base_url: String,
  pub datasource: String,
  /// ESI asks clients to identify themselves with contact details.
  pub user_agent: String,
  pub timeout_secs: u64,
}

impl Default for EsiConfig {
  fn default() -> Self {
    Self {
      base_url: "https://esi.evetech.net/latest".to_string(),
      datasource: "tranquility".to_string(),
      user_agent: format!("esi-mirror/{}", env!("CARGO_PKG_VERSION")),
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Persist to SQLite. When disabled everything lives in memory.
  pub enabled: bool,
  /// Database path (default: $XDG_DATA_HOME/esi-mirror/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Seconds between expiry sweeps in `watch` mode.
  pub sweep_interval_secs: u64,
  /// Concurrent contract item fetches.
  pub item_fetch_concurrency: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      sweep_interval_secs: 60,
      item_fetch_concurrency: 4,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnerConfig {
  pub kind: OwnerKind,
  pub id: i64,
  /// Character whose token is used. Defaults to `id`; required for corporations.
  pub character_id: Option<i64>,
  pub name: Option<String>,
  #[serde(default)]
  pub scopes: Vec<String>,
  /// Environment variable holding the access token.
  pub token_env: String,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./esi-mirror.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/esi-mirror/config.yaml
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
        "No configuration file found. Create one at ~/.config/esi-mirror/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("esi-mirror.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("esi-mirror").join("config.yaml");
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
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse YAML: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.sync.sweep_interval_secs == 0 {
      return Err(eyre!("sync.sweep_interval_secs must be greater than zero"));
    }

    let mut seen = BTreeSet::new();
    for owner in &self.owners {
      let key = owner_key(owner.kind, owner.id);
      if !seen.insert(key.clone()) {
        return Err(eyre!("Owner {} is listed twice", key));
      }
      if owner.kind == OwnerKind::Corporation && owner.character_id.is_none() {
        return Err(eyre!(
          "Owner {} needs a character_id (the director whose token is used)",
          key
        ));
      }
    }
    Ok(())
  }
}
