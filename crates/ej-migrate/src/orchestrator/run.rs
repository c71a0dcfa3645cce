//! Run, table and stage bookkeeping.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::domain::Domain;
use crate::error::{MigrateError, Result};
use crate::script::Phase;

/// Per-table stages, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    GatherIdentifiers,
    DropConstraints,
    CopyData,
    RecreateConstraints,
    Verify,
}

impl Stage {
    pub const SEQUENCE: [Stage; 5] = [
        Stage::GatherIdentifiers,
        Stage::DropConstraints,
        Stage::CopyData,
        Stage::RecreateConstraints,
        Stage::Verify,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::GatherIdentifiers => "gather_identifiers",
            Stage::DropConstraints => "drop_constraints",
            Stage::CopyData => "copy_data",
            Stage::RecreateConstraints => "recreate_constraints",
            Stage::Verify => "verify",
        }
    }

    /// Template phase backing this stage. Verify has none.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Stage::GatherIdentifiers => Some(Phase::GatherIdentifiers),
            Stage::DropConstraints => Some(Phase::DropConstraints),
            Stage::CopyData => Some(Phase::CopyData),
            Stage::RecreateConstraints => Some(Phase::RecreateConstraints),
            Stage::Verify => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    RetriedOk,
    Skipped,
    Failed,
}

/// Outcome of one stage. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<i64>,
    pub elapsed_ms: u64,
}

impl StageResult {
    pub fn succeeded(stage: Stage, attempts: u32, rows: Option<i64>, elapsed: Duration) -> Self {
        Self {
            stage,
            status: if attempts > 1 {
                StageStatus::RetriedOk
            } else {
                StageStatus::Ok
            },
            attempts: attempts.max(1),
            error: None,
            rows,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn skipped(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            attempts: 0,
            error: Some(reason.into()),
            rows: None,
            elapsed_ms: 0,
        }
    }

    pub fn failed(stage: Stage, err: &MigrateError, elapsed: Duration) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            attempts: err.attempts(),
            error: Some(err.to_string()),
            rows: None,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StageStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// One table's path through the stages.
#[derive(Debug, Clone, Serialize)]
pub struct TableMigration {
    pub table: String,
    pub current_stage: Option<Stage>,
    pub stages: Vec<StageResult>,
    pub status: TableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl TableMigration {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            current_stage: None,
            stages: Vec::new(),
            status: TableStatus::Running,
            skip_reason: None,
        }
    }

    /// Enter the next stage. Stages only move forward.
    pub fn enter(&mut self, stage: Stage) -> Result<()> {
        if let Some(current) = self.current_stage {
            if stage <= current {
                return Err(MigrateError::Config(format!(
                    "{}: cannot enter {} after {}",
                    self.table, stage, current
                )));
            }
        }
        if let Some(last) = self.stages.last() {
            if last.is_failed() {
                return Err(MigrateError::Config(format!(
                    "{}: cannot enter {} after failed {}",
                    self.table, stage, last.stage
                )));
            }
        }
        self.current_stage = Some(stage);
        Ok(())
    }

    pub fn record(&mut self, result: StageResult) {
        if result.is_failed() {
            self.status = TableStatus::Failed;
        }
        self.stages.push(result);
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = TableStatus::Skipped;
        self.skip_reason = Some(reason.into());
    }

    pub fn succeed(&mut self) {
        if self.status == TableStatus::Running {
            self.status = TableStatus::Succeeded;
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn rows_copied(&self) -> i64 {
        self.stage(Stage::CopyData).and_then(|r| r.rows).unwrap_or(0)
    }
}

/// Run-scoped aggregate counters, readable while the run proceeds.
#[derive(Debug, Clone, Default)]
pub struct OperationCounters {
    inner: Arc<CounterCells>,
}

#[derive(Debug, Default)]
struct CounterCells {
    successes: AtomicU64,
    failures: AtomicU64,
    rows_copied: AtomicU64,
}

/// Point-in-time copy of [`OperationCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CounterSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub rows_copied: u64,
}

impl OperationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.inner.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.inner.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rows(&self, count: u64) {
        self.inner.rows_copied.fetch_add(count, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.inner.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    pub fn rows_copied(&self) -> u64 {
        self.inner.rows_copied.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.inner.successes.store(0, Ordering::Relaxed);
        self.inner.failures.store(0, Ordering::Relaxed);
        self.inner.rows_copied.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            successes: self.successes(),
            failures: self.failures(),
            rows_copied: self.rows_copied(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
}

/// One invocation of a domain migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRun {
    pub run_id: Uuid,
    pub domain: Domain,
    pub target_db: String,
    pub tables: Vec<TableMigration>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(skip)]
    pub counters: OperationCounters,
}

/// Serializable outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub domain: Domain,
    pub status: RunStatus,
    pub tables_attempted: usize,
    pub tables_succeeded: usize,
    pub tables_failed: usize,
    pub tables_skipped: usize,
    pub rows_copied: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub elapsed_secs: f64,
    pub failed_tables: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl MigrationRun {
    /// Start a run. Resets `counters`.
    pub fn new(domain: Domain, target_db: impl Into<String>, counters: OperationCounters) -> Self {
        counters.reset();
        Self {
            run_id: Uuid::new_v4(),
            domain,
            target_db: target_db.into(),
            tables: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            abort_reason: None,
            counters,
        }
    }

    pub fn push(&mut self, table: TableMigration) {
        self.tables.push(table);
    }

    /// Record a table that never started.
    pub fn skip_table(&mut self, table: &str, reason: &str) {
        let mut migration = TableMigration::new(table);
        migration.skip(reason);
        self.tables.push(migration);
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.status = RunStatus::Aborted;
        self.abort_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }

    /// Finalize. An aborted run stays aborted.
    pub fn complete(&mut self) {
        if self.status == RunStatus::Running {
            self.status = RunStatus::Completed;
        }
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.status == RunStatus::Aborted
    }

    pub fn table(&self, name: &str) -> Option<&TableMigration> {
        self.tables.iter().find(|t| t.table == name)
    }

    fn count(&self, status: TableStatus) -> usize {
        self.tables.iter().filter(|t| t.status == status).count()
    }

    pub fn summary(&self) -> RunSummary {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        let elapsed = (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let counters = self.counters.snapshot();
        RunSummary {
            run_id: self.run_id,
            domain: self.domain,
            status: self.status,
            tables_attempted: self.tables.len(),
            tables_succeeded: self.count(TableStatus::Succeeded),
            tables_failed: self.count(TableStatus::Failed),
            tables_skipped: self.count(TableStatus::Skipped),
            rows_copied: counters.rows_copied,
            operations_succeeded: counters.successes,
            operations_failed: counters.failures,
            elapsed_secs: elapsed,
            failed_tables: self
                .tables
                .iter()
                .filter(|t| t.status == TableStatus::Failed)
                .map(|t| t.table.clone())
                .collect(),
            abort_reason: self.abort_reason.clone(),
        }
    }

    /// Full run (tables and stage logs) as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl RunSummary {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
