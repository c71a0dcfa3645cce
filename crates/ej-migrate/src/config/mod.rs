//! Configuration loading and validation.
//!
//! Precedence is file < environment < CLI flags. The CLI applies its flags
//! after [`Config::load`] has applied the environment.

mod types;
mod validation;

pub use types::*;

use crate::error::{MigrateError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variables consulted by [`Config::apply_env`].
pub const ENV_TARGET_DB: &str = "MSSQL_TARGET_DB_NAME";
pub const ENV_LOG_DIR: &str = "EJ_LOG_DIR";
pub const ENV_INCLUDE_EMPTY_TABLES: &str = "INCLUDE_EMPTY_TABLES";
pub const ENV_SQL_TIMEOUT: &str = "SQL_TIMEOUT";
pub const ENV_SCRIPT_DIR: &str = "EJ_SCRIPT_DIR";

impl Config {
    /// Load configuration from a YAML file and apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        let config = config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup(ENV_TARGET_DB).filter(|v| !v.is_empty()) {
            debug!("{} overrides target.database", ENV_TARGET_DB);
            self.target.database = db;
        }
        if let Some(dir) = lookup(ENV_LOG_DIR).filter(|v| !v.is_empty()) {
            self.migration.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup(ENV_SCRIPT_DIR).filter(|v| !v.is_empty()) {
            self.migration.script_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup(ENV_INCLUDE_EMPTY_TABLES) {
            self.migration.include_empty_tables = parse_flag(&flag);
        }
        if let Some(timeout) = lookup(ENV_SQL_TIMEOUT) {
            self.migration.sql_timeout_secs = timeout.trim().parse().map_err(|_| {
                MigrateError::Config(format!(
                    "{} must be a positive number of seconds, got {:?}",
                    ENV_SQL_TIMEOUT, timeout
                ))
            })?;
        }
        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 of the configuration (password excluded), logged with each run.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
