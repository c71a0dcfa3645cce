//! Configuration type definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::orchestrator::Domain;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target SQL Server. Source databases live on the same server.
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Target SQL Server connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Target database name, substituted as `TARGET_DB` in scripts.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password. Never serialized.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Encrypt connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// Pool size (default: 4). One connection drives the run, the rest
    /// serve source cursors.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Error classes that abort a whole run instead of failing one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalError {
    /// The connection dropped or could not be restored.
    ConnectionLost,
    /// DropConstraints could not take its locks after all retries.
    ExclusiveAccess,
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Schema used when a table manifest entry names none (default: dbo).
    #[serde(default = "default_dbo_schema")]
    pub schema: String,

    /// Source database per domain. Missing entries fall back to the domain name.
    #[serde(default)]
    pub source_databases: BTreeMap<Domain, String>,

    /// Root of the script template directory (default: ./sql).
    #[serde(default = "default_script_dir")]
    pub script_dir: PathBuf,

    /// Directory for PreDMSErrorLog_<Domain>.txt files. Unset disables them.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Rows per Batch Copier chunk (default: 10000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Bytes per streamed LOB piece (default: 1 MiB).
    #[serde(default = "default_lob_chunk_size")]
    pub lob_chunk_size: usize,

    /// Per-statement timeout in seconds (default: 300).
    #[serde(default = "default_sql_timeout_secs")]
    pub sql_timeout_secs: u64,

    /// Deadline for one stage including its retries (default: 3600).
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// Attempts per operation, first try included (default: 3).
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Initial backoff in milliseconds (default: 1000).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Backoff cap in milliseconds (default: 30000).
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Migrate tables whose scope count is zero (default: false).
    #[serde(default)]
    pub include_empty_tables: bool,

    /// Leave constraints dropped after the copy (default: false).
    #[serde(default)]
    pub skip_constraint_rebuild: bool,

    /// Rows sampled per LOB column for checksum verification (default: 100).
    #[serde(default = "default_verify_sample_size")]
    pub verify_sample_size: usize,

    /// Error classes that abort the run.
    #[serde(default = "default_fatal_errors")]
    pub fatal_errors: Vec<FatalError>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            schema: default_dbo_schema(),
            source_databases: BTreeMap::new(),
            script_dir: default_script_dir(),
            log_dir: None,
            batch_size: default_batch_size(),
            lob_chunk_size: default_lob_chunk_size(),
            sql_timeout_secs: default_sql_timeout_secs(),
            stage_timeout_secs: default_stage_timeout_secs(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            include_empty_tables: false,
            skip_constraint_rebuild: false,
            verify_sample_size: default_verify_sample_size(),
            fatal_errors: default_fatal_errors(),
        }
    }
}

impl MigrationConfig {
    /// Source database for a domain.
    pub fn source_database(&self, domain: Domain) -> &str {
        self.source_databases
            .get(&domain)
            .map(String::as_str)
            .unwrap_or_else(|| domain.default_source_database())
    }

    pub fn sql_timeout(&self) -> Duration {
        Duration::from_secs(self.sql_timeout_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn is_fatal(&self, class: FatalError) -> bool {
        self.fatal_errors.contains(&class)
    }
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    4
}

fn default_dbo_schema() -> String {
    "dbo".to_string()
}

fn default_script_dir() -> PathBuf {
    PathBuf::from("sql")
}

fn default_batch_size() -> usize {
    10_000
}

fn default_lob_chunk_size() -> usize {
    1024 * 1024
}

fn default_sql_timeout_secs() -> u64 {
    300
}

fn default_stage_timeout_secs() -> u64 {
    3600
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_verify_sample_size() -> usize {
    100
}

fn default_fatal_errors() -> Vec<FatalError> {
    vec![FatalError::ConnectionLost, FatalError::ExclusiveAccess]
}
