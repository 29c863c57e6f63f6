// ⚙️ Configuration - reconcile.toml
//
// Every section and field is optional; a missing file means defaults.
// Lookup order: explicit path → $RECONCILE_CONFIG → ./reconcile.toml.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::backfill::DEFAULT_MAX_BATCH_SIZE;
use crate::reconciliation::ObservationScope;

pub const CONFIG_ENV: &str = "RECONCILE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "reconcile.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Operation cap per bulk-write batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub observation_scope: ObservationScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("reconcile.db")
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

impl Config {
    /// Parse a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Resolve and load the effective config
    ///
    /// An explicit path or `$RECONCILE_CONFIG` must exist; the implicit
    /// `./reconcile.toml` is only read when present.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }
        let fallback = Path::new(DEFAULT_CONFIG_FILE);
        if fallback.exists() {
            return Self::from_file(fallback);
        }
        Ok(Self::default())
    }
}
