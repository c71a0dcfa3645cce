//! Progress events and the sinks that receive them.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::domain::Domain;
use super::run::{RunStatus, RunSummary, Stage, StageResult, StageStatus, TableStatus};

/// Everything an observer can learn about a run. Each event carries the run id.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MigrationEvent {
    RunStarted {
        run_id: Uuid,
        domain: Domain,
        tables: usize,
    },
    StageStarted {
        run_id: Uuid,
        table: String,
        stage: Stage,
    },
    StageFinished {
        run_id: Uuid,
        table: String,
        result: StageResult,
    },
    TableFinished {
        run_id: Uuid,
        table: String,
        status: TableStatus,
    },
    RunCompleted {
        run_id: Uuid,
        summary: RunSummary,
    },
}

impl MigrationEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            MigrationEvent::RunStarted { run_id, .. }
            | MigrationEvent::StageStarted { run_id, .. }
            | MigrationEvent::StageFinished { run_id, .. }
            | MigrationEvent::TableFinished { run_id, .. }
            | MigrationEvent::RunCompleted { run_id, .. } => *run_id,
        }
    }
}

/// Receives progress events. Must not block the run.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &MigrationEvent);
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: &MigrationEvent) {
        match event {
            MigrationEvent::RunStarted {
                run_id,
                domain,
                tables,
            } => info!(%run_id, %domain, tables, "run started"),
            MigrationEvent::StageStarted {
                run_id,
                table,
                stage,
            } => info!(%run_id, table = %table, stage = %stage, "stage started"),
            MigrationEvent::StageFinished {
                run_id,
                table,
                result,
            } => match result.status {
                StageStatus::Failed => warn!(
                    %run_id,
                    table = %table,
                    stage = %result.stage,
                    attempts = result.attempts,
                    "stage failed: {}",
                    result.error.as_deref().unwrap_or("")
                ),
                status => info!(
                    %run_id,
                    table = %table,
                    stage = %result.stage,
                    status = ?status,
                    attempts = result.attempts,
                    rows = ?result.rows,
                    elapsed_ms = result.elapsed_ms,
                    "stage finished"
                ),
            },
            MigrationEvent::TableFinished {
                run_id,
                table,
                status,
            } => info!(%run_id, table = %table, status = ?status, "table finished"),
            MigrationEvent::RunCompleted { run_id, summary } => match summary.status {
                RunStatus::Aborted => error!(
                    %run_id,
                    domain = %summary.domain,
                    "run aborted: {}",
                    summary.abort_reason.as_deref().unwrap_or("unknown")
                ),
                _ => info!(
                    %run_id,
                    domain = %summary.domain,
                    succeeded = summary.tables_succeeded,
                    failed = summary.tables_failed,
                    skipped = summary.tables_skipped,
                    rows = summary.rows_copied,
                    "run completed in {:.1}s",
                    summary.elapsed_secs
                ),
            },
        }
    }
}

/// Forwards events to a channel. Drops events when the channel is full
/// rather than stalling the run.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<MigrationEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<MigrationEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus receiver with room for `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MigrationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: &MigrationEvent) {
        let _ = self.tx.try_send(event.clone());
    }
}
