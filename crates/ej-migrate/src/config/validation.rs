//! Configuration validation.

use super::Config;
use crate::core::identifier::validate_identifier;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.max_connections == 0 {
        return Err(MigrateError::Config(
            "target.max_connections must be at least 1".into(),
        ));
    }

    // Names substituted into script text must pass identifier rules up front.
    check_identifier("target.database", &config.target.database)?;
    check_identifier("migration.schema", &config.migration.schema)?;
    for (domain, db) in &config.migration.source_databases {
        check_identifier(&format!("migration.source_databases.{}", domain.key()), db)?;
    }

    let m = &config.migration;
    if m.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if m.lob_chunk_size == 0 {
        return Err(MigrateError::Config(
            "migration.lob_chunk_size must be at least 1".into(),
        ));
    }
    if m.sql_timeout_secs == 0 {
        return Err(MigrateError::Config(
            "migration.sql_timeout_secs must be positive".into(),
        ));
    }
    if m.stage_timeout_secs == 0 {
        return Err(MigrateError::Config(
            "migration.stage_timeout_secs must be positive".into(),
        ));
    }
    if m.max_retry_attempts == 0 {
        return Err(MigrateError::Config(
            "migration.max_retry_attempts must be at least 1".into(),
        ));
    }
    if m.retry_max_delay_ms < m.retry_base_delay_ms {
        return Err(MigrateError::Config(
            "migration.retry_max_delay_ms must not be below retry_base_delay_ms".into(),
        ));
    }

    Ok(())
}

fn check_identifier(field: &str, value: &str) -> Result<()> {
    validate_identifier(value).map_err(|e| MigrateError::Config(format!("{}: {}", field, e)))
}
