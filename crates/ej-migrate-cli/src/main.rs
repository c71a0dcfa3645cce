//! ej-migrate CLI - drives domain migrations into the EJ target database.

mod logging;

use clap::{Args, Parser, Subcommand};
use ej_migrate::orchestrator::CopyPlan;
use ej_migrate::{
    Config, ConnectionProvider, Domain, MemorySourceProvider, MigrateError, MigrationPlan,
    MigrationRun, MssqlSourceProvider, OperationCounters, Orchestrator, RunStatus, TemplateStore,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "ej-migrate")]
#[command(about = "Migrate the Justice, Operations, Financial and LOB domains into EJ")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: trace, debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for a graceful stop after a signal before exiting
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    /// Print counter snapshots as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct RunOverrides {
    /// Process tables whose identifier gathering found no rows
    #[arg(long)]
    include_empty: bool,

    /// Leave constraints dropped after copying
    #[arg(long)]
    skip_constraint_rebuild: bool,

    /// Override the target database name
    #[arg(long)]
    target_db: Option<String>,

    /// Override rows per copy batch
    #[arg(long)]
    batch_size: Option<usize>,
}

impl RunOverrides {
    fn apply(&self, config: &mut Config) {
        if self.include_empty {
            config.migration.include_empty_tables = true;
        }
        if self.skip_constraint_rebuild {
            config.migration.skip_constraint_rebuild = true;
        }
        if let Some(ref db) = self.target_db {
            config.target.database = db.clone();
        }
        if let Some(size) = self.batch_size {
            config.migration.batch_size = size;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate one domain
    Run {
        /// Domain to migrate: justice, operations, financial or lob
        #[arg(long)]
        domain: Domain,

        #[command(flatten)]
        overrides: RunOverrides,
    },

    /// Migrate every domain in order, stopping after an aborted run
    RunAll {
        #[command(flatten)]
        overrides: RunOverrides,
    },

    /// Render and check every script of a domain without connecting
    Plan {
        /// Domain to plan: justice, operations, financial or lob
        #[arg(long)]
        domain: Domain,

        #[command(flatten)]
        overrides: RunOverrides,
    },

    /// Test the target database connection
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    match &cli.command {
        Commands::Run { overrides, .. }
        | Commands::RunAll { overrides }
        | Commands::Plan { overrides, .. } => overrides.apply(&mut config),
        Commands::HealthCheck => {}
    }
    config.validate()?;

    logging::setup_logging(
        &cli.verbosity,
        &cli.log_format,
        config.migration.log_dir.clone(),
    )
    .map_err(MigrateError::Config)?;
    info!(
        config_hash = %config.hash(),
        "Loaded configuration from {:?}",
        cli.config
    );

    match cli.command {
        Commands::Plan { domain, .. } => {
            let templates = Arc::new(TemplateStore::load_dir(&config.migration.script_dir)?);
            let orchestrator =
                Orchestrator::new(&config, templates, Arc::new(MemorySourceProvider::new()));
            let plan = orchestrator.plan(domain)?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print_plan(&plan);
            }
        }

        Commands::HealthCheck => {
            let provider = ConnectionProvider::new(&config.target).await?;
            let latency = provider.health_check().await?;
            if cli.output_json {
                println!(
                    "{}",
                    serde_json::json!({
                        "database": provider.database(),
                        "healthy": true,
                        "latency_ms": latency.as_millis() as u64,
                    })
                );
            } else {
                println!("Health Check Results:");
                println!(
                    "  Target (SQL Server): OK ({}ms)",
                    latency.as_millis()
                );
                println!("  Database: {}", provider.database());
            }
        }

        Commands::Run { domain, .. } => {
            let cancel = setup_signal_handler(cli.shutdown_timeout).await?;
            let session = Session::open(&config, cli.progress).await?;
            let run = session.migrate(domain, cancel.clone()).await?;
            report(&run, cli.output_json)?;
            check_outcome(&run, &cancel)?;
        }

        Commands::RunAll { .. } => {
            let cancel = setup_signal_handler(cli.shutdown_timeout).await?;
            let session = Session::open(&config, cli.progress).await?;
            for domain in Domain::ALL {
                let run = session.migrate(domain, cancel.clone()).await?;
                report(&run, cli.output_json)?;
                check_outcome(&run, &cancel)?;
            }
        }
    }

    Ok(())
}

/// Everything a migration run needs once connected.
struct Session {
    provider: ConnectionProvider,
    orchestrator: Orchestrator,
    progress: bool,
}

impl Session {
    async fn open(config: &Config, progress: bool) -> Result<Self, MigrateError> {
        let templates = Arc::new(TemplateStore::load_dir(&config.migration.script_dir)?);
        let provider = ConnectionProvider::new(&config.target).await?;
        let sources = Arc::new(MssqlSourceProvider::new(provider.clone()));
        Ok(Self {
            orchestrator: Orchestrator::new(config, templates, sources),
            provider,
            progress,
        })
    }

    async fn migrate(
        &self,
        domain: Domain,
        cancel: CancellationToken,
    ) -> Result<MigrationRun, MigrateError> {
        let counters = OperationCounters::new();
        let ticker = self
            .progress
            .then(|| spawn_progress_ticker(counters.clone(), cancel.child_token()));

        let mut conn = self.provider.connect().await?;
        let result = self
            .orchestrator
            .run(domain, &mut conn, cancel, counters)
            .await;

        if let Some(ticker) = ticker {
            ticker.cancel();
        }
        result
    }
}

/// Print counter snapshots every second until `stop` is cancelled.
fn spawn_progress_ticker(counters: OperationCounters, stop: CancellationToken) -> CancellationToken {
    let handle = stop.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    if let Ok(line) = serde_json::to_string(&counters.snapshot()) {
                        eprintln!("{}", line);
                    }
                }
            }
        }
    });
    handle
}

fn report(run: &MigrationRun, output_json: bool) -> Result<(), MigrateError> {
    let summary = run.summary();
    if output_json {
        println!("{}", summary.to_json()?);
        return Ok(());
    }

    let status = match summary.status {
        RunStatus::Completed => "completed",
        RunStatus::Aborted => "aborted",
        RunStatus::Running => "running",
    };
    println!("\n{} migration {}", summary.domain, status);
    println!("  Run ID: {}", summary.run_id);
    println!("  Duration: {:.2}s", summary.elapsed_secs);
    println!(
        "  Tables: {} succeeded, {} failed, {} skipped of {}",
        summary.tables_succeeded,
        summary.tables_failed,
        summary.tables_skipped,
        summary.tables_attempted
    );
    println!("  Rows: {}", summary.rows_copied);
    println!(
        "  Operations: {} ok, {} failed",
        summary.operations_succeeded, summary.operations_failed
    );
    if !summary.failed_tables.is_empty() {
        println!("  Failed tables: {:?}", summary.failed_tables);
    }
    if let Some(ref reason) = summary.abort_reason {
        println!("  Aborted: {}", reason);
    }
    Ok(())
}

/// Turn an aborted run into the matching error. Table failures in a
/// completed run do not fail the process.
fn check_outcome(run: &MigrationRun, cancel: &CancellationToken) -> Result<(), MigrateError> {
    if !run.is_aborted() {
        return Ok(());
    }
    if cancel.is_cancelled() {
        return Err(MigrateError::Cancelled);
    }
    Err(MigrateError::Aborted(
        run.abort_reason
            .clone()
            .unwrap_or_else(|| format!("{} run aborted", run.domain)),
    ))
}

fn print_plan(plan: &MigrationPlan) {
    println!(
        "Plan for {} ({} -> {})",
        plan.domain, plan.source_db, plan.target_db
    );
    for script in &plan.prepare {
        println!("  {} ({} batches)", script.name, script.batches);
    }
    for table in &plan.tables {
        let copy = match &table.copy_data {
            CopyPlan::Script(script) => format!("script, {} batches", script.batches),
            CopyPlan::Batched {
                source,
                target,
                batch_size,
                ..
            } => format!("batched {} -> {} by {}", source, target, batch_size),
        };
        println!("  {}: copy {}", table.table, copy);
        if table.recreate_constraints.is_none() {
            println!("    constraints left dropped");
        }
    }
    println!("{} scripts rendered", plan.script_count());
}

/// Setup signal handlers for graceful shutdown.
/// Handles SIGINT and SIGTERM. The run stops at the next table or batch
/// boundary; the process exits anyway once `shutdown_timeout` passes.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
        force_exit_after(shutdown_timeout).await;
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
        token.cancel();
        force_exit_after(shutdown_timeout).await;
    });

    Ok(cancel_token)
}

async fn force_exit_after(shutdown_timeout: u64) {
    tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
    warn!("Graceful shutdown timed out after {}s", shutdown_timeout);
    std::process::exit(i32::from(MigrateError::Cancelled.exit_code()));
}
