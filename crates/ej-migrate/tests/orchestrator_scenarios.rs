//! End-to-end runs against the in-memory connection.

use std::sync::{Arc, Mutex};

use ej_migrate::db::{FailureRule, MemoryConnection, MemoryTable};
use ej_migrate::orchestrator::{
    MigrationEvent, ProgressSink, RunStatus, Stage, StageStatus, TableStatus,
};
use ej_migrate::{
    ChannelSink, Config, Domain, MemorySourceProvider, MigrationRun, OperationCounters,
    Orchestrator, Phase, TableSpec, TemplateStore,
};
use ej_migrate::core::SqlValue;
use tokio_util::sync::CancellationToken;

const DROP: &str = "ALTER TABLE ${TARGET_DB:q}.${SCHEMA:q}.${TABLE:q} NOCHECK CONSTRAINT ALL";
const RECREATE: &str =
    "ALTER TABLE ${TARGET_DB:q}.${SCHEMA:q}.${TABLE:q} WITH CHECK CHECK CONSTRAINT ALL";

fn config(extra: &str) -> Config {
    let yaml = format!(
        "target:\n  host: localhost\n  database: EJ\n  user: sa\nmigration:\n  batch_size: 1000\n  retry_base_delay_ms: 1\n  retry_max_delay_ms: 5\n{}",
        extra
    );
    Config::from_yaml(&yaml).unwrap()
}

fn store(domain: Domain, tables: Vec<TableSpec>) -> TemplateStore {
    let mut store = TemplateStore::new();
    store.set_tables(domain, tables).unwrap();
    store
        .insert(domain, Phase::DropConstraints, None, DROP)
        .unwrap();
    store
        .insert(domain, Phase::RecreateConstraints, None, RECREATE)
        .unwrap();
    store
}

fn people(n: i64) -> MemoryTable {
    MemoryTable::new(["ID", "Name"]).with_rows(
        (1..=n)
            .map(|i| vec![SqlValue::I64(i), SqlValue::Text(format!("name {i}"))])
            .collect(),
    )
}

struct Fixture {
    sources: MemorySourceProvider,
    conn: MemoryConnection,
}

impl Fixture {
    fn new() -> Self {
        Self {
            sources: MemorySourceProvider::new(),
            conn: MemoryConnection::new(),
        }
    }

    /// Seed a source table (readable by the copier and by Verify) and an
    /// empty target table with the same columns.
    fn seed(&mut self, source_db: &str, table: &str, data: MemoryTable) {
        self.conn.insert_table(
            &format!("EJ.dbo.{table}"),
            MemoryTable::new(data.columns.clone()),
        );
        self.conn
            .insert_table(&format!("{source_db}.dbo.{table}"), data.clone());
        self.sources.insert_table(source_db, "dbo", table, data);
    }

    async fn run(
        self,
        config: &Config,
        store: TemplateStore,
        domain: Domain,
    ) -> (MigrationRun, MemoryConnection) {
        let Fixture { sources, mut conn } = self;
        let orchestrator = Orchestrator::new(config, Arc::new(store), Arc::new(sources));
        let run = orchestrator
            .run(
                domain,
                &mut conn,
                CancellationToken::new(),
                OperationCounters::new(),
            )
            .await
            .unwrap();
        (run, conn)
    }
}

fn keyed(name: &str) -> TableSpec {
    TableSpec::new(name).with_key(&["ID"])
}

#[tokio::test]
async fn test_ten_thousand_rows_verified() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(10_000));
    let (run, conn) = fx
        .run(&config(""), store(Domain::Operations, vec![keyed("Agency")]), Domain::Operations)
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    let table = run.table("Agency").unwrap();
    assert_eq!(table.status, TableStatus::Succeeded);

    let copy = table.stage(Stage::CopyData).unwrap();
    assert_eq!(copy.status, StageStatus::Ok);
    assert_eq!(copy.rows, Some(10_000));

    let verify = table.stage(Stage::Verify).unwrap();
    assert_eq!(verify.status, StageStatus::Ok);
    assert_eq!(verify.rows, Some(10_000));

    assert_eq!(conn.table("EJ.dbo.Agency").unwrap().rows.len(), 10_000);
    assert_eq!(conn.statements_containing("insert bulk"), 10);

    let summary = run.summary();
    assert_eq!(summary.rows_copied, 10_000);
    assert_eq!(summary.tables_succeeded, 1);
    assert_eq!(summary.operations_failed, 0);
}

#[tokio::test]
async fn test_transient_batch_failure_retried() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(5_000));
    // Batches 1-3 go through, batch 4 deadlocks twice, then succeeds.
    fx.conn
        .fail(FailureRule::code("insert bulk", 1205).after(3).times(2));
    let (run, conn) = fx
        .run(&config(""), store(Domain::Operations, vec![keyed("Agency")]), Domain::Operations)
        .await;

    let table = run.table("Agency").unwrap();
    let copy = table.stage(Stage::CopyData).unwrap();
    assert_eq!(copy.status, StageStatus::RetriedOk);
    assert_eq!(copy.attempts, 3);
    assert_eq!(table.status, TableStatus::Succeeded);

    let summary = run.summary();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.operations_failed, 0);
    assert_eq!(summary.rows_copied, 5_000);
    assert_eq!(conn.table("EJ.dbo.Agency").unwrap().rows.len(), 5_000);
}

#[tokio::test]
async fn test_constraint_rebuild_failure_does_not_block_next_table() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(10));
    fx.seed("Operations", "Officer", people(20));
    fx.conn
        .fail(FailureRule::code("[agency] with check", 547));
    let (run, _) = fx
        .run(
            &config(""),
            store(Domain::Operations, vec![keyed("Agency"), keyed("Officer")]),
            Domain::Operations,
        )
        .await;

    let agency = run.table("Agency").unwrap();
    assert_eq!(agency.status, TableStatus::Failed);
    let rebuild = agency.stage(Stage::RecreateConstraints).unwrap();
    assert_eq!(rebuild.status, StageStatus::Failed);
    assert_eq!(rebuild.attempts, 1);
    assert!(agency.stage(Stage::Verify).is_none());

    assert_eq!(run.table("Officer").unwrap().status, TableStatus::Succeeded);

    let summary = run.summary();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.tables_failed, 1);
    assert_eq!(summary.tables_succeeded, 1);
    assert_eq!(summary.failed_tables, vec!["Agency".to_string()]);
}

#[tokio::test]
async fn test_row_count_mismatch_fails_only_verify() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(10));
    fx.seed("Operations", "Officer", people(4));
    // A leftover row already sits in the Agency target.
    fx.conn.insert_table(
        "EJ.dbo.Agency",
        MemoryTable::new(["ID", "Name"])
            .with_rows(vec![vec![SqlValue::I64(999), SqlValue::Text("stale".into())]]),
    );
    let (run, conn) = fx
        .run(
            &config(""),
            store(Domain::Operations, vec![keyed("Agency"), keyed("Officer")]),
            Domain::Operations,
        )
        .await;

    let agency = run.table("Agency").unwrap();
    assert_eq!(agency.status, TableStatus::Failed);
    for stage in [Stage::DropConstraints, Stage::CopyData, Stage::RecreateConstraints] {
        assert_eq!(agency.stage(stage).unwrap().status, StageStatus::Ok, "{stage:?}");
    }
    assert_eq!(agency.stage(Stage::CopyData).unwrap().rows, Some(10));
    let verify = agency.stage(Stage::Verify).unwrap();
    assert_eq!(verify.status, StageStatus::Failed);
    assert_eq!(conn.table("EJ.dbo.Agency").unwrap().rows.len(), 11);

    assert_eq!(run.table("Officer").unwrap().status, TableStatus::Succeeded);

    let summary = run.summary();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.tables_failed, 1);
    assert_eq!(summary.tables_succeeded, 1);
    assert_eq!(summary.failed_tables, vec!["Agency".to_string()]);
}

#[tokio::test]
async fn test_copy_script_with_destructive_tail_is_not_executed() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(5));
    let mut store = store(Domain::Operations, vec![keyed("Agency")]);
    store
        .insert(
            Domain::Operations,
            Phase::CopyData,
            Some("Agency"),
            "SELECT 1 FROM ${SOURCE_DB:q}.${SCHEMA:q}.${TABLE:q};DROP TABLE ${TARGET_DB:q}.${SCHEMA:q}.${TABLE:q}\nGO\n",
        )
        .unwrap();

    let (run, conn) = fx.run(&config(""), store, Domain::Operations).await;
    let agency = run.table("Agency").unwrap();
    assert_eq!(agency.status, TableStatus::Failed);
    assert_eq!(agency.stage(Stage::CopyData).unwrap().status, StageStatus::Failed);
    assert_eq!(conn.statements_containing("drop table"), 0);
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_drop_failure_skips_copy() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(10));
    fx.conn
        .fail(FailureRule::code("[agency] nocheck", 4902));
    let (run, conn) = fx
        .run(&config(""), store(Domain::Operations, vec![keyed("Agency")]), Domain::Operations)
        .await;

    let agency = run.table("Agency").unwrap();
    assert_eq!(agency.status, TableStatus::Failed);
    assert!(agency.stage(Stage::CopyData).is_none());
    assert_eq!(conn.statements_containing("insert bulk"), 0);
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_lob_domain_streams_and_checksums() {
    let bodies: Vec<SqlValue> = vec![
        SqlValue::Bytes((0..200u8).collect()),
        SqlValue::Null,
        SqlValue::Bytes(vec![7; 64]),
        SqlValue::Bytes(vec![]),
    ];
    let data = MemoryTable::new(["ID", "Body"]).with_rows(
        bodies
            .into_iter()
            .enumerate()
            .map(|(i, b)| vec![SqlValue::I64(i as i64 + 1), b])
            .collect(),
    );
    let mut fx = Fixture::new();
    fx.seed("LOB", "Document", data.clone());

    let spec = TableSpec::new("Document")
        .with_key(&["ID"])
        .with_lob_columns(&["Body"]);
    let (run, conn) = fx
        .run(
            &config("  lob_chunk_size: 64\n"),
            store(Domain::Lob, vec![spec]),
            Domain::Lob,
        )
        .await;

    let table = run.table("Document").unwrap();
    assert_eq!(table.status, TableStatus::Succeeded);
    assert_eq!(table.stage(Stage::Verify).unwrap().status, StageStatus::Ok);

    // 200 bytes in 4 pieces, 64 bytes in 1.
    assert_eq!(conn.statements_containing(".write("), 5);
    assert_eq!(conn.statements_containing("select top (100)"), 2);
    assert_eq!(conn.table("EJ.dbo.Document").unwrap().rows, data.rows);
}

#[tokio::test]
async fn test_empty_scope_skips_table() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(0));
    fx.seed("Operations", "Officer", people(0));
    fx.conn.respond("from _tmp_agencyids", vec![vec![SqlValue::I64(0)]]);
    fx.conn.respond("from _tmp_officerids", vec![vec![SqlValue::I64(0)]]);

    let mut store = store(
        Domain::Operations,
        vec![keyed("Agency"), keyed("Officer").always_process()],
    );
    store
        .insert(
            Domain::Operations,
            Phase::GatherIdentifiers,
            None,
            "SELECT COUNT(*) FROM _tmp_${TABLE}IDs",
        )
        .unwrap();

    let (run, conn) = fx.run(&config(""), store, Domain::Operations).await;

    let agency = run.table("Agency").unwrap();
    assert_eq!(agency.status, TableStatus::Skipped);
    assert_eq!(agency.skip_reason.as_deref(), Some("no rows in scope"));
    assert_eq!(agency.stage(Stage::GatherIdentifiers).unwrap().rows, Some(0));
    assert!(agency.stage(Stage::DropConstraints).is_none());
    assert_eq!(conn.statements_containing("[agency] nocheck"), 0);

    let officer = run.table("Officer").unwrap();
    assert_eq!(officer.status, TableStatus::Succeeded);
    assert_eq!(run.summary().tables_skipped, 1);
}

#[tokio::test]
async fn test_include_empty_tables_processes_zero_scope() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(0));
    fx.conn.respond("from _tmp_agencyids", vec![vec![SqlValue::I64(0)]]);
    let mut store = store(Domain::Operations, vec![keyed("Agency")]);
    store
        .insert(
            Domain::Operations,
            Phase::GatherIdentifiers,
            None,
            "SELECT COUNT(*) FROM _tmp_${TABLE}IDs",
        )
        .unwrap();

    let (run, _) = fx
        .run(&config("  include_empty_tables: true\n"), store, Domain::Operations)
        .await;
    assert_eq!(run.table("Agency").unwrap().status, TableStatus::Succeeded);
}

#[tokio::test]
async fn test_server_side_copy_verified_against_reported_rows() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(50));
    // The copy script's own effect is simulated by the pre-filled target.
    fx.conn.insert_table("EJ.dbo.Agency", people(3));
    let mut store = store(Domain::Operations, vec![keyed("Agency")]);
    store
        .insert(
            Domain::Operations,
            Phase::CopyData,
            Some("Agency"),
            "INSERT INTO ${TARGET_DB:q}.${SCHEMA:q}.${TABLE:q} SELECT a.* FROM ${SOURCE_DB:q}.${SCHEMA:q}.${TABLE:q} a JOIN _tmp_AgencyIDs t ON t.ID = a.ID\nGO\nSELECT COUNT_BIG(*) FROM ${TARGET_DB:q}.${SCHEMA:q}.${TABLE:q}\nGO\n",
        )
        .unwrap();

    let (run, conn) = fx.run(&config(""), store, Domain::Operations).await;
    let table = run.table("Agency").unwrap();
    assert_eq!(table.status, TableStatus::Succeeded);
    assert_eq!(table.stage(Stage::CopyData).unwrap().rows, Some(3));
    assert_eq!(table.stage(Stage::Verify).unwrap().rows, Some(3));
    assert_eq!(
        conn.statements_containing("select count_big(*) from [operations]"),
        0
    );
    assert_eq!(run.summary().rows_copied, 3);
}

#[tokio::test]
async fn test_skip_constraint_rebuild() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(5));
    let (run, conn) = fx
        .run(
            &config("  skip_constraint_rebuild: true\n"),
            store(Domain::Operations, vec![keyed("Agency")]),
            Domain::Operations,
        )
        .await;
    let table = run.table("Agency").unwrap();
    assert_eq!(table.status, TableStatus::Succeeded);
    assert_eq!(
        table.stage(Stage::RecreateConstraints).unwrap().status,
        StageStatus::Skipped
    );
    assert_eq!(conn.statements_containing("with check"), 0);
}

fn justice_store(tables: Vec<TableSpec>) -> TemplateStore {
    let mut store = store(Domain::Justice, tables);
    for &step in Domain::Justice.prepare_steps() {
        let id = step.trim_start_matches("gather_");
        store
            .insert(
                Domain::Justice,
                Phase::Prepare,
                Some(step),
                &format!("SELECT ID INTO _tmp_{id} FROM ${{SOURCE_DB:q}}.${{SCHEMA:q}}.Source_{id}"),
            )
            .unwrap();
    }
    store
}

#[tokio::test]
async fn test_prepare_steps_run_in_order() {
    let mut fx = Fixture::new();
    fx.seed("Justice", "Case", people(2));
    let (run, conn) = fx
        .run(&config(""), justice_store(vec![keyed("Case")]), Domain::Justice)
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    let prepared: Vec<&String> = conn
        .statements()
        .iter()
        .filter(|s| s.contains("INTO _tmp_"))
        .collect();
    assert_eq!(prepared.len(), 6);
    assert!(prepared[0].contains("_tmp_caseids"));
    assert!(prepared[5].contains("_tmp_eventids"));
    assert!(prepared[0].contains("[Justice].[dbo]"));
}

#[tokio::test]
async fn test_prepare_failure_aborts_run() {
    let mut fx = Fixture::new();
    fx.seed("Justice", "Case", people(2));
    fx.seed("Justice", "Charge", people(2));
    fx.conn.fail(FailureRule::code("_tmp_partyids", 208));
    let (run, conn) = fx
        .run(
            &config(""),
            justice_store(vec![keyed("Case"), keyed("Charge")]),
            Domain::Justice,
        )
        .await;

    assert_eq!(run.status, RunStatus::Aborted);
    assert!(run.abort_reason.as_deref().unwrap().contains("preprocessing"));
    assert!(run.tables.iter().all(|t| t.status == TableStatus::Skipped));
    assert_eq!(conn.statements_containing("_tmp_warrantids"), 0);
    assert_eq!(conn.statements_containing("nocheck"), 0);
}

#[tokio::test]
async fn test_missing_prepare_template_aborts_run() {
    let mut fx = Fixture::new();
    fx.seed("Financial", "Fee", people(2));
    let (run, _) = fx
        .run(&config(""), store(Domain::Financial, vec![keyed("Fee")]), Domain::Financial)
        .await;
    assert_eq!(run.status, RunStatus::Aborted);
    assert!(run
        .abort_reason
        .as_deref()
        .unwrap()
        .contains("gather_feeinstanceids"));
}

#[tokio::test]
async fn test_connection_lost_aborts_run() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(5));
    fx.seed("Operations", "Officer", people(5));
    fx.conn.fail(FailureRule::connection_lost("[agency] nocheck"));
    let (run, conn) = fx
        .run(
            &config(""),
            store(Domain::Operations, vec![keyed("Agency"), keyed("Officer")]),
            Domain::Operations,
        )
        .await;

    assert_eq!(run.status, RunStatus::Aborted);
    let agency = run.table("Agency").unwrap();
    assert_eq!(agency.status, TableStatus::Failed);
    assert_eq!(agency.stage(Stage::DropConstraints).unwrap().attempts, 1);
    assert_eq!(run.table("Officer").unwrap().status, TableStatus::Skipped);
    assert_eq!(conn.statements_containing("[officer]"), 0);
}

#[tokio::test]
async fn test_lock_contention_on_drop_aborts_run() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(5));
    fx.seed("Operations", "Officer", people(5));
    fx.conn.fail(FailureRule::code("[agency] nocheck", 1222));
    let (run, _) = fx
        .run(
            &config(""),
            store(Domain::Operations, vec![keyed("Agency"), keyed("Officer")]),
            Domain::Operations,
        )
        .await;

    assert_eq!(run.status, RunStatus::Aborted);
    assert!(run.abort_reason.as_deref().unwrap().contains("exclusive access"));
    let drop = run
        .table("Agency")
        .unwrap()
        .stage(Stage::DropConstraints)
        .unwrap();
    assert_eq!(drop.attempts, 3);
    assert_eq!(run.table("Officer").unwrap().status, TableStatus::Skipped);
}

#[tokio::test]
async fn test_fatal_classes_are_configurable() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(5));
    fx.seed("Operations", "Officer", people(5));
    fx.conn.fail(FailureRule::connection_lost("[agency] nocheck"));
    let (run, _) = fx
        .run(
            &config("  fatal_errors: []\n"),
            store(Domain::Operations, vec![keyed("Agency"), keyed("Officer")]),
            Domain::Operations,
        )
        .await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.table("Officer").unwrap().status, TableStatus::Succeeded);
}

#[tokio::test]
async fn test_cancel_before_start_skips_everything() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(5));
    let orchestrator = Orchestrator::new(
        &config(""),
        Arc::new(store(Domain::Operations, vec![keyed("Agency")])),
        Arc::new(fx.sources),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();
    let run = orchestrator
        .run(Domain::Operations, &mut fx.conn, cancel, OperationCounters::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(run.abort_reason.as_deref(), Some("cancellation requested"));
    assert_eq!(run.table("Agency").unwrap().status, TableStatus::Skipped);
}

/// Cancels the run as soon as the named table starts copying.
struct CancelOnCopy {
    table: String,
    token: CancellationToken,
}

impl ProgressSink for CancelOnCopy {
    fn emit(&self, event: &MigrationEvent) {
        if let MigrationEvent::StageStarted { table, stage, .. } = event {
            if *stage == Stage::CopyData && *table == self.table {
                self.token.cancel();
            }
        }
    }
}

#[tokio::test]
async fn test_cancel_during_copy_fails_table_and_stops() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(5));
    fx.seed("Operations", "Officer", people(5));
    let token = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        &config(""),
        Arc::new(store(
            Domain::Operations,
            vec![keyed("Agency"), keyed("Officer")],
        )),
        Arc::new(fx.sources),
    )
    .with_sink(Arc::new(CancelOnCopy {
        table: "Agency".into(),
        token: token.clone(),
    }));

    let run = orchestrator
        .run(Domain::Operations, &mut fx.conn, token, OperationCounters::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    let agency = run.table("Agency").unwrap();
    assert_eq!(agency.status, TableStatus::Failed);
    assert_eq!(agency.stage(Stage::CopyData).unwrap().status, StageStatus::Failed);
    assert_eq!(run.table("Officer").unwrap().status, TableStatus::Skipped);
    assert_eq!(fx.conn.statements_containing("insert bulk"), 0);
}

#[tokio::test]
async fn test_events_carry_run_id() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(5));
    let (sink, mut rx) = ChannelSink::channel(64);
    let orchestrator = Orchestrator::new(
        &config(""),
        Arc::new(store(Domain::Operations, vec![keyed("Agency")])),
        Arc::new(fx.sources),
    )
    .with_sink(Arc::new(sink));

    let run = orchestrator
        .run(
            Domain::Operations,
            &mut fx.conn,
            CancellationToken::new(),
            OperationCounters::new(),
        )
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(MigrationEvent::RunStarted { .. })));
    assert!(matches!(events.last(), Some(MigrationEvent::RunCompleted { .. })));
    assert!(events.iter().all(|e| e.run_id() == run.run_id));

    let stages: Vec<Stage> = events
        .iter()
        .filter_map(|e| match e {
            MigrationEvent::StageStarted { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(stages, Stage::SEQUENCE.to_vec());
}

#[tokio::test]
async fn test_counters_observable_during_run() {
    let mut fx = Fixture::new();
    fx.seed("Operations", "Agency", people(2_500));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let counters = OperationCounters::new();

    struct Observer {
        counters: OperationCounters,
        seen: Arc<Mutex<Vec<u64>>>,
    }
    impl ProgressSink for Observer {
        fn emit(&self, event: &MigrationEvent) {
            if let MigrationEvent::StageFinished { .. } = event {
                self.seen.lock().unwrap().push(self.counters.rows_copied());
            }
        }
    }

    let orchestrator = Orchestrator::new(
        &config(""),
        Arc::new(store(Domain::Operations, vec![keyed("Agency")])),
        Arc::new(fx.sources),
    )
    .with_sink(Arc::new(Observer {
        counters: counters.clone(),
        seen: seen.clone(),
    }));

    orchestrator
        .run(
            Domain::Operations,
            &mut fx.conn,
            CancellationToken::new(),
            counters.clone(),
        )
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    // gather (skipped), drop, copy, recreate, verify
    assert_eq!(*seen, vec![0, 0, 2_500, 2_500, 2_500]);
    assert_eq!(counters.successes(), 4);
}
