//! CLI configuration management.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use stowage_cache::store::DEFAULT_ENDPOINT;
use stowage_core::{Error, Result};

/// Environment variable that overrides the configured token.
pub const TOKEN_ENV: &str = "STOWAGE_TOKEN";

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Object store backend.
    #[serde(default)]
    pub backend: Backend,
    /// Cloud Storage endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Root directory for the filesystem backend.
    pub root: Option<PathBuf>,
    /// OAuth2 bearer token for Cloud Storage.
    pub token: Option<String>,
    /// Output format.
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            endpoint: default_endpoint(),
            root: None,
            token: None,
            output_format: OutputFormat::default(),
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Gcs,
    Filesystem,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl CliConfig {
    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| Error::io_at("read", path, e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_at("create", parent, e))?;
        }
        let content = serde_yaml::to_string(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        fs::write(path, content).map_err(|e| Error::io_at("write", path, e))
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "stowage", "stowage")
            .ok_or_else(|| Error::Config("could not determine config directory".into()))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Apply a token from the environment, if one is set.
    pub fn apply_env_token(&mut self, token: Option<String>) {
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "backend" => {
                self.backend = Backend::from_str(value, true)
                    .map_err(|_| Error::Config(format!("invalid backend: {}", value)))?;
            }
            "endpoint" => self.endpoint = value.to_string(),
            "root" => self.root = Some(PathBuf::from(value)),
            "token" => self.token = Some(value.to_string()),
            "output_format" => {
                self.output_format = match value {
                    "table" => OutputFormat::Table,
                    "json" => OutputFormat::Json,
                    _ => return Err(Error::Config(format!("invalid output format: {}", value))),
                };
            }
            _ => return Err(Error::Config(format!("unknown config key: {}", key))),
        }
        Ok(())
    }
}
