use crate::error::AccessError;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix for environment overrides, e.g. `HS_ACCESS_DATABASE_URL`
pub const ENV_PREFIX: &str = "HS_ACCESS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, for development
    #[default]
    Pretty,
    /// Structured JSON, for production
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessControlConfig {
    /// Postgres connection string. Without one, grants live in memory.
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Cache resolved privileges between mutations
    pub privilege_cache: bool,
    /// Default filter when `RUST_LOG` is unset
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for AccessControlConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            privilege_cache: false,
            log_level: "hs_access_control=info,sqlx=warn".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl AccessControlConfig {
    /// Load from `HS_ACCESS_*` environment variables over the defaults
    pub fn from_env() -> Result<Self, AccessError> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load a TOML file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AccessError> {
        let path = path.as_ref();
        let name = path
            .to_str()
            .ok_or_else(|| AccessError::ConfigError(format!("non UTF-8 path {:?}", path)))?;

        let settings = Config::builder()
            .add_source(File::new(name, FileFormat::Toml))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn uses_database(&self) -> bool {
        self.database_url
            .as_deref()
            .map(|url| !url.trim().is_empty())
            .unwrap_or(false)
    }
}
