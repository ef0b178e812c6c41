//! Configuration loader and validator for the pull watcher.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub hub: Hub,
}

/// Process and scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_target_timeout_seconds")]
    pub target_timeout_seconds: u64,
}

/// Registry API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hub {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_tick_seconds() -> u64 {
    10
}

fn default_target_timeout_seconds() -> u64 {
    30
}

fn default_base_url() -> String {
    "https://hub.docker.com/v2/".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    15
}

fn default_user_agent() -> String {
    format!("pullwatch/{}", env!("CARGO_PKG_VERSION"))
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` when set, otherwise a sqlite file inside `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| {
                format!(
                    "sqlite://{}/pullwatch.db",
                    self.app.data_dir.trim_end_matches('/')
                )
            })
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.app.tick_seconds)
    }

    pub fn target_timeout(&self) -> Duration {
        Duration::from_secs(self.app.target_timeout_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.hub.http_timeout_seconds)
    }

    /// Bearer token, if one is configured and non-blank.
    pub fn hub_token(&self) -> Option<&str> {
        self.hub
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Load configuration from a YAML file, apply environment overrides and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    apply_token_override(&mut cfg, std::env::var("DOCKERHUB_TOKEN").ok());
    validate(&cfg)?;
    Ok(cfg)
}

/// A non-blank `DOCKERHUB_TOKEN` wins over the file's `hub.token`.
fn apply_token_override(cfg: &mut Config, env_token: Option<String>) {
    if let Some(token) = env_token.filter(|t| !t.trim().is_empty()) {
        cfg.hub.token = Some(token.trim().to_string());
    }
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.tick_seconds == 0 {
        return Err(ConfigError::Invalid("app.tick_seconds must be > 0"));
    }
    if cfg.app.target_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.target_timeout_seconds must be > 0"));
    }

    if cfg.hub.http_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("hub.http_timeout_seconds must be > 0"));
    }
    if cfg.hub.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("hub.user_agent must be non-empty"));
    }
    let base = Url::parse(&cfg.hub.base_url)
        .map_err(|_| ConfigError::Invalid("hub.base_url must be an absolute URL"))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid("hub.base_url must be http or https"));
    }
    if !base.path().ends_with('/') {
        return Err(ConfigError::Invalid("hub.base_url must end with '/'"));
    }

    Ok(())
}

/// Sample configuration document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  tick_seconds: 10
  target_timeout_seconds: 30

hub:
  base_url: "https://hub.docker.com/v2/"
  http_timeout_seconds: 15
  user_agent: "pullwatch/0.1"
  token: ""
"#
}
