//! Migration orchestrator: drives a domain's tables through the stage
//! sequence.
//!
//! Every SQL operation goes through the retry policy, which gives each
//! attempt its own transaction scope. A failed stage fails its table and the
//! loop moves on; only the configured fatal classes stop the run.

pub mod domain;
pub mod events;
pub mod run;

pub use domain::Domain;
pub use events::{ChannelSink, MigrationEvent, ProgressSink, TracingSink};
pub use run::{
    CounterSnapshot, MigrationRun, OperationCounters, RunStatus, RunSummary, Stage, StageResult,
    StageStatus, TableMigration, TableStatus,
};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{Config, FatalError, MigrationConfig};
use crate::core::identifier::{qualify_three_part, validate_identifier};
use crate::core::sanitize;
use crate::db::Connection;
use crate::error::{ErrorClass, MigrateError, Result};
use crate::exec::{RetryPolicy, Script};
use crate::script::{Phase, RenderParams, TableSpec, TemplateStore};
use crate::transfer::{BatchCopier, CopyConfig, SourceProvider, SourceTable, SqlBatchWriter};
use crate::verify::{count_query, sample_query, TableVerifier, VerifyRule};

/// How a finished stage affects the rest of the table.
struct StageDone {
    attempts: u32,
    rows: Option<i64>,
    /// The stage did nothing, for this reason.
    skipped: Option<String>,
    /// The remaining stages must not run, for this reason.
    skip_table: Option<String>,
}

impl StageDone {
    fn ran(attempts: u32, rows: Option<i64>) -> Self {
        Self {
            attempts,
            rows,
            skipped: None,
            skip_table: None,
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            attempts: 0,
            rows: None,
            skipped: Some(reason.into()),
            skip_table: None,
        }
    }
}

/// Per-table values threaded through the stages.
struct TableContext<'a> {
    run_id: Uuid,
    domain: Domain,
    spec: &'a TableSpec,
    params: RenderParams,
    source: SourceTable,
    target: String,
    /// Row count reported by a server-side copy script.
    copied_by_script: Option<i64>,
}

/// Runs one domain at a time against a target connection.
pub struct Orchestrator {
    target_db: String,
    config: MigrationConfig,
    templates: Arc<TemplateStore>,
    sources: Arc<dyn SourceProvider>,
    sink: Arc<dyn ProgressSink>,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        templates: Arc<TemplateStore>,
        sources: Arc<dyn SourceProvider>,
    ) -> Self {
        Self {
            target_db: config.target.database.clone(),
            config: config.migration.clone(),
            templates,
            sources,
            sink: Arc::new(TracingSink),
            retry: RetryPolicy::from_config(&config.migration),
        }
    }

    /// Send progress events here instead of the log.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn target_db(&self) -> &str {
        &self.target_db
    }

    fn render_params(&self, domain: Domain) -> RenderParams {
        RenderParams::new()
            .target_db(&self.target_db)
            .schema(&self.config.schema)
            .source_qualifier(self.config.source_database(domain))
    }

    fn stage_deadline(&self) -> Instant {
        Instant::now() + self.config.stage_timeout()
    }

    fn table_context<'a>(&self, domain: Domain, spec: &'a TableSpec, run_id: Uuid) -> Result<TableContext<'a>> {
        validate_identifier(&spec.name)?;
        let schema = spec.schema_or(&self.config.schema).to_string();
        let source_db = self.config.source_database(domain).to_string();
        Ok(TableContext {
            run_id,
            domain,
            spec,
            params: self.render_params(domain).schema(&schema).table(&spec.name),
            target: qualify_three_part(&self.target_db, &schema, &spec.name)?,
            source: SourceTable::new(source_db, schema, spec.clone()),
            copied_by_script: None,
        })
    }

    /// Migrate every table of `domain` in manifest order.
    ///
    /// Table failures are recorded in the returned run. An `Err` means the
    /// run could not be set up at all.
    pub async fn run(
        &self,
        domain: Domain,
        conn: &mut dyn Connection,
        cancel: CancellationToken,
        counters: OperationCounters,
    ) -> Result<MigrationRun> {
        validate_identifier(&self.target_db)?;
        validate_identifier(self.config.source_database(domain))?;

        let run = MigrationRun::new(domain, &self.target_db, counters);
        let span = info_span!("run", run_id = %run.run_id, domain = %domain);
        self.drive(run, conn, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        mut run: MigrationRun,
        conn: &mut dyn Connection,
        cancel: CancellationToken,
    ) -> Result<MigrationRun> {
        let domain = run.domain;
        let tables = self.templates.tables(domain);

        info!(
            "Starting {} migration into {} ({} tables, source {})",
            domain,
            self.target_db,
            tables.len(),
            self.config.source_database(domain)
        );
        self.sink.emit(&MigrationEvent::RunStarted {
            run_id: run.run_id,
            domain,
            tables: tables.len(),
        });

        if let Err(e) = self.prepare(domain, conn, &run).await {
            error!(
                run_id = %run.run_id,
                domain = %domain,
                stage = "prepare",
                "{}",
                e.format_detailed()
            );
            run.abort(format!("preprocessing failed: {}", e));
            for spec in tables {
                run.skip_table(&spec.name, "run aborted during preprocessing");
            }
            return Ok(self.finish(run));
        }

        for (i, spec) in tables.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Cancellation requested, stopping before {}", spec.name);
                run.abort("cancellation requested");
                for rest in &tables[i..] {
                    run.skip_table(&rest.name, "cancelled");
                }
                break;
            }

            let (table, abort) = self.migrate_table(domain, spec, conn, &cancel, &run).await?;
            self.sink.emit(&MigrationEvent::TableFinished {
                run_id: run.run_id,
                table: table.table.clone(),
                status: table.status,
            });
            run.push(table);

            if let Some(reason) = abort {
                error!(run_id = %run.run_id, domain = %domain, "Aborting run: {}", reason);
                run.abort(reason);
                for rest in &tables[i + 1..] {
                    run.skip_table(&rest.name, "run aborted");
                }
                break;
            }
        }

        Ok(self.finish(run))
    }

    fn finish(&self, mut run: MigrationRun) -> MigrationRun {
        run.complete();
        let summary = run.summary();
        self.sink.emit(&MigrationEvent::RunCompleted {
            run_id: run.run_id,
            summary,
        });
        run
    }

    /// Run the domain's preprocessing scripts in order.
    async fn prepare(
        &self,
        domain: Domain,
        conn: &mut dyn Connection,
        run: &MigrationRun,
    ) -> Result<()> {
        let params = self.render_params(domain);
        for &step in domain.prepare_steps() {
            let sql = self
                .templates
                .render(domain, Phase::Prepare, Some(step), &params)?;
            let script = Script::new(format!("{}/prepare/{}", domain.key(), step), &sql);
            match self.retry.run_until(conn, &script, Some(self.stage_deadline())).await {
                Ok(done) => {
                    run.counters.record_success();
                    info!("Preprocessing {} done ({} batches)", step, done.value.batches);
                }
                Err(e) => {
                    run.counters.record_failure();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Drive one table through every stage. Returns the table's record and,
    /// when a fatal class was hit, the reason to abort the run.
    async fn migrate_table(
        &self,
        domain: Domain,
        spec: &TableSpec,
        conn: &mut dyn Connection,
        cancel: &CancellationToken,
        run: &MigrationRun,
    ) -> Result<(TableMigration, Option<String>)> {
        let mut table = TableMigration::new(&spec.name);
        let mut ctx = match self.table_context(domain, spec, run.run_id) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(run_id = %run.run_id, domain = %domain, table = %spec.name, "{}", e);
                table.enter(Stage::GatherIdentifiers)?;
                table.record(StageResult::failed(
                    Stage::GatherIdentifiers,
                    &e,
                    Duration::ZERO,
                ));
                run.counters.record_failure();
                return Ok((table, None));
            }
        };

        for stage in Stage::SEQUENCE {
            table.enter(stage)?;
            self.sink.emit(&MigrationEvent::StageStarted {
                run_id: run.run_id,
                table: spec.name.clone(),
                stage,
            });

            let started = Instant::now();
            let outcome = match stage {
                Stage::GatherIdentifiers => self.gather(&ctx, conn).await,
                Stage::DropConstraints => self.run_required(&ctx, Phase::DropConstraints, conn).await,
                Stage::CopyData => self.copy(&mut ctx, conn, cancel, run).await,
                Stage::RecreateConstraints => self.recreate(&ctx, conn).await,
                Stage::Verify => self.verify(&ctx, conn).await,
            };
            let elapsed = started.elapsed();

            let done = match outcome {
                Ok(done) => done,
                Err(e) => {
                    run.counters.record_failure();
                    error!(
                        run_id = %run.run_id,
                        domain = %domain,
                        table = %spec.name,
                        stage = %stage,
                        attempts = e.attempts(),
                        "{}",
                        e.format_detailed()
                    );
                    let result = StageResult::failed(stage, &e, elapsed);
                    self.emit_finished(run.run_id, &spec.name, &result);
                    table.record(result);
                    return Ok((table, self.abort_reason(stage, &e)));
                }
            };

            let result = match &done.skipped {
                Some(reason) => StageResult::skipped(stage, reason.clone()),
                None => {
                    run.counters.record_success();
                    StageResult::succeeded(stage, done.attempts, done.rows, elapsed)
                }
            };
            self.emit_finished(run.run_id, &spec.name, &result);
            table.record(result);

            if let Some(reason) = done.skip_table {
                info!("{}: skipped ({})", spec.name, reason);
                table.skip(reason);
                return Ok((table, None));
            }
        }

        table.succeed();
        info!("{}: completed ({} rows)", spec.name, table.rows_copied());
        Ok((table, None))
    }

    fn emit_finished(&self, run_id: Uuid, table: &str, result: &StageResult) {
        self.sink.emit(&MigrationEvent::StageFinished {
            run_id,
            table: table.to_string(),
            result: result.clone(),
        });
    }

    /// Whether a stage failure stops the whole run.
    fn abort_reason(&self, stage: Stage, err: &MigrateError) -> Option<String> {
        if matches!(err.root(), MigrateError::Cancelled) {
            return Some("cancellation requested".to_string());
        }
        if err.class() == ErrorClass::Fatal && self.config.is_fatal(FatalError::ConnectionLost) {
            return Some(format!("connection lost: {}", err));
        }
        if stage == Stage::DropConstraints
            && err.is_lock_contention()
            && self.config.is_fatal(FatalError::ExclusiveAccess)
        {
            return Some(format!("exclusive access not obtained: {}", err));
        }
        None
    }

    async fn run_script(
        &self,
        ctx: &TableContext<'_>,
        phase: Phase,
        conn: &mut dyn Connection,
    ) -> Result<(u32, Option<i64>)> {
        let sql = self
            .templates
            .render(ctx.domain, phase, Some(ctx.spec.name.as_str()), &ctx.params)?;
        if phase == Phase::CopyData {
            if let Err(e) = sanitize::check(&sql) {
                error!(
                    run_id = %ctx.run_id,
                    table = %ctx.spec.name,
                    "copy script rejected before execution: {}",
                    e
                );
                return Err(e);
            }
        }
        let script = Script::new(format!("{}/{}/{}", ctx.domain.key(), phase, ctx.spec.name), &sql);
        let done = self
            .retry
            .run_until(conn, &script, Some(self.stage_deadline()))
            .await?;
        Ok((done.attempts, done.value.scalar.and_then(|v| v.as_i64())))
    }

    async fn gather(&self, ctx: &TableContext<'_>, conn: &mut dyn Connection) -> Result<StageDone> {
        if !self
            .templates
            .contains(ctx.domain, Phase::GatherIdentifiers, Some(ctx.spec.name.as_str()))
        {
            return Ok(StageDone::skipped("no identifier template"));
        }
        let (attempts, scope) = self.run_script(ctx, Phase::GatherIdentifiers, conn).await?;
        let mut done = StageDone::ran(attempts, scope);
        if scope == Some(0) {
            if self.config.include_empty_tables || ctx.spec.always_process {
                debug!(run_id = %ctx.run_id, table = %ctx.spec.name, "no rows in scope, processing anyway");
            } else {
                done.skip_table = Some("no rows in scope".to_string());
            }
        }
        Ok(done)
    }

    async fn run_required(
        &self,
        ctx: &TableContext<'_>,
        phase: Phase,
        conn: &mut dyn Connection,
    ) -> Result<StageDone> {
        let (attempts, rows) = self.run_script(ctx, phase, conn).await?;
        Ok(StageDone::ran(attempts, rows))
    }

    async fn recreate(&self, ctx: &TableContext<'_>, conn: &mut dyn Connection) -> Result<StageDone> {
        if self.config.skip_constraint_rebuild {
            return Ok(StageDone::skipped("constraint rebuild disabled"));
        }
        self.run_required(ctx, Phase::RecreateConstraints, conn).await
    }

    async fn copy(
        &self,
        ctx: &mut TableContext<'_>,
        conn: &mut dyn Connection,
        cancel: &CancellationToken,
        run: &MigrationRun,
    ) -> Result<StageDone> {
        if self
            .templates
            .contains(ctx.domain, Phase::CopyData, Some(ctx.spec.name.as_str()))
        {
            let (attempts, rows) = self.run_script(ctx, Phase::CopyData, conn).await?;
            if let Some(rows) = rows {
                run.counters.add_rows(rows.max(0) as u64);
            }
            ctx.copied_by_script = rows;
            return Ok(StageDone::ran(attempts, rows));
        }

        let mut source = self.sources.open(&ctx.source).await?;
        let writer = SqlBatchWriter::new(ctx.target.clone(), ctx.spec.key.clone());
        let copier = BatchCopier::new(
            &self.retry,
            CopyConfig {
                batch_size: self.config.batch_size,
                lob_chunk_size: self.config.lob_chunk_size,
            },
        )
        .with_counters(run.counters.clone())
        .with_cancel(cancel.clone());

        let stats = copier
            .copy(source.as_mut(), &writer, conn, Some(self.stage_deadline()))
            .await?;
        info!(
            "{}: copied {} rows in {} batches ({} LOB bytes, read {:?}, write {:?})",
            ctx.spec.name, stats.rows, stats.batches, stats.lob_bytes, stats.read_time, stats.write_time
        );
        Ok(StageDone::ran(stats.max_attempts, Some(stats.rows as i64)))
    }

    fn verify_rule(&self, domain: Domain, spec: &TableSpec) -> VerifyRule {
        if domain.verifies_lob_checksums() && spec.has_lob_columns() {
            VerifyRule::with_lob_sample(self.config.verify_sample_size)
        } else {
            VerifyRule::counts_only()
        }
    }

    async fn verify(&self, ctx: &TableContext<'_>, conn: &mut dyn Connection) -> Result<StageDone> {
        let mut verifier = TableVerifier::new(
            ctx.source.qualified()?,
            ctx.target.clone(),
            ctx.spec.clone(),
            self.verify_rule(ctx.domain, ctx.spec),
        );
        if let Some(rows) = ctx.copied_by_script {
            verifier = verifier.with_expected_source_rows(rows);
        }
        let done = self
            .retry
            .run_until(conn, &verifier, Some(self.stage_deadline()))
            .await?;
        let attempts = done.attempts;
        let report = done.value.into_result().map_err(|e| {
            warn!(run_id = %ctx.run_id, table = %ctx.spec.name, "{}", e);
            e
        })?;
        Ok(StageDone::ran(attempts, Some(report.target_rows)))
    }

    /// Render everything a run of `domain` would execute, without a
    /// connection. Fails on the first template that cannot be rendered.
    pub fn plan(&self, domain: Domain) -> Result<MigrationPlan> {
        validate_identifier(&self.target_db)?;
        let source_db = self.config.source_database(domain);
        validate_identifier(source_db)?;

        let params = self.render_params(domain);
        let mut prepare = Vec::new();
        for &step in domain.prepare_steps() {
            let sql = self
                .templates
                .render(domain, Phase::Prepare, Some(step), &params)?;
            prepare.push(PlannedScript::new(format!("prepare/{}", step), sql));
        }

        let mut tables = Vec::new();
        for spec in self.templates.tables(domain) {
            let ctx = self.table_context(domain, spec, Uuid::nil())?;
            let script = |phase: Phase| -> Result<PlannedScript> {
                let sql = self
                    .templates
                    .render(domain, phase, Some(spec.name.as_str()), &ctx.params)?;
                Ok(PlannedScript::new(phase.to_string(), sql))
            };

            let gather = if self
                .templates
                .contains(domain, Phase::GatherIdentifiers, Some(spec.name.as_str()))
            {
                Some(script(Phase::GatherIdentifiers)?)
            } else {
                None
            };
            let copy = if self.templates.contains(domain, Phase::CopyData, Some(spec.name.as_str())) {
                let planned = script(Phase::CopyData)?;
                sanitize::check(&planned.sql)?;
                CopyPlan::Script(planned)
            } else {
                CopyPlan::Batched {
                    source: ctx.source.qualified()?,
                    target: ctx.target.clone(),
                    batch_size: self.config.batch_size,
                    lob_columns: spec.lob_columns.clone(),
                }
            };
            let recreate_constraints = if self.config.skip_constraint_rebuild {
                None
            } else {
                Some(script(Phase::RecreateConstraints)?)
            };

            // A script copy reports its own row count and is not sampled.
            let scoped = matches!(copy, CopyPlan::Script(_));
            let mut verify = Vec::new();
            if !scoped {
                verify.push(count_query(&ctx.source.qualified()?));
            }
            verify.push(count_query(&ctx.target));
            let sample = self.verify_rule(domain, spec).lob_sample.filter(|_| !scoped);
            if let Some(sample) = sample {
                for column in &spec.lob_columns {
                    verify.push(sample_query(&ctx.source.qualified()?, &spec.key, column, sample)?);
                    verify.push(sample_query(&ctx.target, &spec.key, column, sample)?);
                }
            }

            tables.push(TablePlan {
                table: spec.name.clone(),
                gather_identifiers: gather,
                drop_constraints: script(Phase::DropConstraints)?,
                copy_data: copy,
                recreate_constraints,
                verify,
            });
        }

        Ok(MigrationPlan {
            domain,
            target_db: self.target_db.clone(),
            source_db: source_db.to_string(),
            prepare,
            tables,
        })
    }
}

/// Everything a run would execute, as rendered SQL.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    pub domain: Domain,
    pub target_db: String,
    pub source_db: String,
    pub prepare: Vec<PlannedScript>,
    pub tables: Vec<TablePlan>,
}

impl MigrationPlan {
    pub fn script_count(&self) -> usize {
        self.prepare.len()
            + self
                .tables
                .iter()
                .map(|t| {
                    1 + usize::from(t.gather_identifiers.is_some())
                        + usize::from(matches!(t.copy_data, CopyPlan::Script(_)))
                        + usize::from(t.recreate_constraints.is_some())
                })
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedScript {
    pub name: String,
    pub batches: usize,
    pub sql: String,
}

impl PlannedScript {
    fn new(name: String, sql: String) -> Self {
        Self {
            batches: Script::new(name.clone(), &sql).batches().len(),
            name,
            sql,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CopyPlan {
    Script(PlannedScript),
    Batched {
        source: String,
        target: String,
        batch_size: usize,
        lob_columns: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TablePlan {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gather_identifiers: Option<PlannedScript>,
    pub drop_constraints: PlannedScript,
    pub copy_data: CopyPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recreate_constraints: Option<PlannedScript>,
    pub verify: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::MemorySourceProvider;

    fn config() -> Config {
        Config::from_yaml("target:\n  host: localhost\n  database: EJ\n  user: sa\n").unwrap()
    }

    fn store() -> TemplateStore {
        let mut store = TemplateStore::new();
        store
            .set_tables(
                Domain::Operations,
                vec![TableSpec::new("Agency").with_key(&["AgencyID"])],
            )
            .unwrap();
        store
            .insert(
                Domain::Operations,
                Phase::DropConstraints,
                None,
                "ALTER TABLE ${TARGET_DB:q}.${SCHEMA:q}.${TABLE:q} NOCHECK CONSTRAINT ALL",
            )
            .unwrap();
        store
            .insert(
                Domain::Operations,
                Phase::RecreateConstraints,
                None,
                "ALTER TABLE ${TARGET_DB:q}.${SCHEMA:q}.${TABLE:q} WITH CHECK CHECK CONSTRAINT ALL",
            )
            .unwrap();
        store
    }

    #[test]
    fn test_plan_renders_every_stage() {
        let orch = Orchestrator::new(
            &config(),
            Arc::new(store()),
            Arc::new(MemorySourceProvider::new()),
        );
        let plan = orch.plan(Domain::Operations).unwrap();
        assert_eq!(plan.source_db, "Operations");
        assert_eq!(plan.tables.len(), 1);

        let table = &plan.tables[0];
        assert_eq!(
            table.drop_constraints.sql,
            "ALTER TABLE [EJ].[dbo].[Agency] NOCHECK CONSTRAINT ALL"
        );
        assert!(table.gather_identifiers.is_none());
        match &table.copy_data {
            CopyPlan::Batched { source, target, .. } => {
                assert_eq!(source, "[Operations].[dbo].[Agency]");
                assert_eq!(target, "[EJ].[dbo].[Agency]");
            }
            other => panic!("expected batched copy, got {other:?}"),
        }
        assert_eq!(table.verify.len(), 2);
        assert_eq!(plan.script_count(), 2);
    }

    #[test]
    fn test_plan_checks_copy_scripts() {
        let mut store = store();
        store
            .insert(
                Domain::Operations,
                Phase::CopyData,
                Some("Agency"),
                "INSERT INTO ${TARGET_DB:q}.${SCHEMA:q}.${TABLE:q} SELECT * FROM ${SOURCE_DB:q}.${SCHEMA:q}.${TABLE:q}",
            )
            .unwrap();
        let orch = Orchestrator::new(&config(), Arc::new(store.clone()), Arc::new(MemorySourceProvider::new()));
        let plan = orch.plan(Domain::Operations).unwrap();
        assert!(matches!(plan.tables[0].copy_data, CopyPlan::Script(_)));
        assert_eq!(plan.tables[0].verify, vec![count_query("[EJ].[dbo].[Agency]")]);

        store
            .insert(
                Domain::Operations,
                Phase::CopyData,
                Some("Agency"),
                "SELECT 1; DELETE FROM ${TARGET_DB:q}.${SCHEMA:q}.${TABLE:q}",
            )
            .unwrap();
        let orch = Orchestrator::new(&config(), Arc::new(store), Arc::new(MemorySourceProvider::new()));
        assert!(matches!(
            orch.plan(Domain::Operations).unwrap_err(),
            MigrateError::InjectionSuspected(_)
        ));
    }

    #[test]
    fn test_plan_fails_on_missing_required_template() {
        let mut store = store();
        store
            .set_tables(Domain::Financial, vec![TableSpec::new("Fee")])
            .unwrap();
        let orch = Orchestrator::new(&config(), Arc::new(store), Arc::new(MemorySourceProvider::new()));
        let err = orch.plan(Domain::Financial).unwrap_err();
        assert!(matches!(err, MigrateError::TemplateNotFound { .. }));
    }

    #[test]
    fn test_plan_rejects_bad_target_name() {
        let mut cfg = config();
        cfg.target.database = "EJ; DROP TABLE x".into();
        let orch = Orchestrator::new(&cfg, Arc::new(store()), Arc::new(MemorySourceProvider::new()));
        assert!(matches!(
            orch.plan(Domain::Operations).unwrap_err(),
            MigrateError::InvalidIdentifier(_)
        ));
    }

    #[test]
    fn test_abort_reasons() {
        let orch = Orchestrator::new(&config(), Arc::new(store()), Arc::new(MemorySourceProvider::new()));
        let lost = MigrateError::ConnectionLost("reset".into());
        assert!(orch.abort_reason(Stage::CopyData, &lost).is_some());

        let deadlock = MigrateError::Attempts {
            attempts: 3,
            source: Box::new(MigrateError::from_code(1222, "lock timeout")),
        };
        assert!(orch.abort_reason(Stage::DropConstraints, &deadlock).is_some());
        assert!(orch.abort_reason(Stage::CopyData, &deadlock).is_none());

        let fk = MigrateError::from_code(547, "FK");
        assert!(orch.abort_reason(Stage::RecreateConstraints, &fk).is_none());
    }

    #[test]
    fn test_abort_classes_follow_config() {
        let mut cfg = config();
        cfg.migration.fatal_errors.clear();
        let orch = Orchestrator::new(&cfg, Arc::new(store()), Arc::new(MemorySourceProvider::new()));
        let lost = MigrateError::ConnectionLost("reset".into());
        assert!(orch.abort_reason(Stage::CopyData, &lost).is_none());
        assert!(orch
            .abort_reason(Stage::CopyData, &MigrateError::Cancelled)
            .is_some());
    }
}
