//! Configuration loader and validator for the Tilda mirror.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::assets::AssetLayout;

pub const DEFAULT_API_BASE: &str = "http://api.tildacdn.info/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("project id can't be empty: pass one explicitly or set tilda.default_project_id")]
    MissingProjectId,
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub tilda: Tilda,
    pub assets: Assets,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Seconds between sync passes when running periodically; 0 means one pass.
    #[serde(default)]
    pub sync_interval_secs: u64,
}

/// Tilda API credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tilda {
    pub public_key: String,
    pub secret_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub default_project_id: Option<i64>,
}

/// Where mirrored assets land on disk and how the host serves them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assets {
    pub path: String,
    pub url: String,
}

fn default_base_url() -> String {
    DEFAULT_API_BASE.to_string()
}

impl App {
    /// Expand a leading `~/` in `data_dir`.
    pub fn resolved_data_dir(&self) -> String {
        expand_home(&self.data_dir)
    }
}

impl Config {
    /// Ensure required directories exist (data dir and asset root).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(self.app.resolved_data_dir())?;
        fs::create_dir_all(expand_home(&self.assets.path))
    }

    /// SQLite URL used when `DATABASE_URL` is not set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/tilda.db", self.app.resolved_data_dir()))
    }

    /// Pick the project to operate on: an explicit non-zero id wins, then the
    /// configured default.
    pub fn project_id(&self, explicit: Option<i64>) -> Result<i64, ConfigError> {
        explicit
            .filter(|id| *id != 0)
            .or(self.tilda.default_project_id.filter(|id| *id != 0))
            .ok_or(ConfigError::MissingProjectId)
    }

    pub fn asset_layout(&self) -> AssetLayout {
        AssetLayout::new(PathBuf::from(expand_home(&self.assets.path)), &self.assets.url)
    }

    /// Whether an incoming request carries our public key. Tilda echoes it back
    /// on publish notifications.
    pub fn verify_public_key(&self, candidate: &str) -> bool {
        !candidate.is_empty() && self.tilda.public_key == candidate
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home.trim_end_matches('/'), rest);
        }
    }
    path.to_string()
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.tilda.public_key.trim().is_empty() {
        return Err(ConfigError::Invalid("tilda.public_key must be non-empty"));
    }
    if cfg.tilda.secret_key.trim().is_empty() {
        return Err(ConfigError::Invalid("tilda.secret_key must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.tilda.base_url).is_err() {
        return Err(ConfigError::Invalid("tilda.base_url must be an absolute URL"));
    }
    if matches!(cfg.tilda.default_project_id, Some(id) if id < 0) {
        return Err(ConfigError::Invalid("tilda.default_project_id must be >= 0"));
    }

    if cfg.assets.path.trim().is_empty() {
        return Err(ConfigError::Invalid("assets.path must be non-empty"));
    }
    if cfg.assets.url.trim().is_empty() {
        return Err(ConfigError::Invalid("assets.url must be non-empty"));
    }

    Ok(())
}

/// Sample configuration printed by `tilda-mirror example-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sync_interval_secs: 0

tilda:
  public_key: "YOUR_TILDA_PUBLIC_KEY"
  secret_key: "YOUR_TILDA_SECRET_KEY"
  base_url: "http://api.tildacdn.info"
  default_project_id: 42

assets:
  path: "./data/tilda"
  url: "/tilda"
"#
}
