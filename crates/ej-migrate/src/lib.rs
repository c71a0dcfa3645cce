//! # ej-migrate
//!
//! Migration orchestration engine for moving the Justice, Operations,
//! Financial and LOB source databases into a SQL Server target.
//!
//! The engine provides:
//!
//! - **Script templates** keyed by domain, phase and table, rendered with
//!   validated and quoted identifiers
//! - **Transaction scopes** that restore the connection's autocommit mode on
//!   every path
//! - **Retries** with exponential backoff for deadlocks, lock timeouts and
//!   throttling
//! - **Batched copies** with chunked streaming of large-object columns
//! - **Verification** of row counts and sampled LOB checksums
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ej_migrate::{
//!     Config, ConnectionProvider, Domain, MssqlSourceProvider, OperationCounters, Orchestrator,
//!     TemplateStore,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> ej_migrate::Result<()> {
//! let config = Config::load("config.yaml")?;
//! let templates = Arc::new(TemplateStore::load_dir(&config.migration.script_dir)?);
//! let provider = ConnectionProvider::new(&config.target).await?;
//! let sources = Arc::new(MssqlSourceProvider::new(provider.clone()));
//!
//! let orchestrator = Orchestrator::new(&config, templates, sources);
//! let mut conn = provider.connect().await?;
//! let run = orchestrator
//!     .run(Domain::Justice, &mut conn, CancellationToken::new(), OperationCounters::new())
//!     .await?;
//! println!("{}", run.summary().to_json()?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod exec;
pub mod orchestrator;
pub mod script;
pub mod transfer;
pub mod verify;

// Re-exports for convenient access
pub use config::{Config, FatalError, MigrationConfig, TargetConfig};
pub use db::{Connection, ConnectionProvider, MemoryConnection, MssqlConnection};
pub use error::{ErrorClass, MigrateError, Result};
pub use exec::{execute, run_with_retry, RetryPolicy, Script, Statement, Work};
pub use orchestrator::{
    ChannelSink, Domain, MigrationEvent, MigrationPlan, MigrationRun, OperationCounters,
    Orchestrator, ProgressSink, RunStatus, RunSummary, Stage, StageStatus, TableStatus,
    TracingSink,
};
pub use script::{Phase, RenderParams, TableSpec, TemplateStore};
pub use transfer::{BatchCopier, CopyConfig, MemorySourceProvider, MssqlSourceProvider};
pub use verify::{TableVerifier, VerifyReport, VerifyRule};
