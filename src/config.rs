//! Configuration loader and validator for the archiver.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
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
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub ingest: Ingest,
    #[serde(default)]
    pub media: Media,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// SQLite pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Database {
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout_ms: 5000,
        }
    }
}

/// Ingestion driver settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Ingest {
    /// Messages fetched, staged and committed per unit of work.
    pub batch_size: usize,
}

impl Default for Ingest {
    fn default() -> Self {
        Self { batch_size: 500 }
    }
}

/// Media-download driver settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Media {
    /// Put payloads that failed to download back on the queue.
    pub requeue_failed: bool,
}

impl Default for Media {
    fn default() -> Self {
        Self {
            requeue_failed: true,
        }
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        match (self.data_dir.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
            _ => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` if set, otherwise `archive.db` inside the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/archive.db", self.app.resolved_data_dir()))
    }

    /// Where fetched media payloads are written.
    pub fn media_dir(&self) -> String {
        format!("{}/media", self.app.resolved_data_dir())
    }
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

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.database.max_connections == 0 {
        return Err(ConfigError::Invalid("database.max_connections must be > 0"));
    }
    if cfg.ingest.batch_size == 0 {
        return Err(ConfigError::Invalid("ingest.batch_size must be > 0"));
    }
    Ok(())
}

/// Example configuration with every section spelled out.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

database:
  max_connections: 5
  busy_timeout_ms: 5000

ingest:
  batch_size: 500

media:
  requeue_failed: true
"#
}
