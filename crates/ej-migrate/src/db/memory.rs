//! In-process connection used by tests and dry runs.
//!
//! Understands exactly the statements the engine generates itself (bulk
//! loads, multi-row `INSERT`, `UPDATE ... .WRITE`, `COUNT_BIG`,
//! `TOP (n) ... ORDER BY`) and answers everything else from scripted
//! responses. A bulk load is recorded as one `INSERT BULK` statement. Transactions are
//! snapshot based: the first write after autocommit is switched off copies
//! the committed tables, commit publishes the copy and rollback drops it.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::trace;

use super::Connection;
use crate::core::value::{Row, SqlValue};
use crate::error::{MigrateError, Result};

/// A table held by [`MemoryConnection`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl MemoryTable {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone)]
enum FailureKind {
    Code(i32),
    ConnectionLost,
}

/// Injected failure for statements containing a pattern.
#[derive(Debug, Clone)]
pub struct FailureRule {
    pattern: String,
    kind: FailureKind,
    skip: u32,
    times: Option<u32>,
}

impl FailureRule {
    /// Fail with a server error number; classification follows the number.
    pub fn code(pattern: &str, code: i32) -> Self {
        Self {
            pattern: pattern.to_ascii_lowercase(),
            kind: FailureKind::Code(code),
            skip: 0,
            times: None,
        }
    }

    pub fn connection_lost(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_ascii_lowercase(),
            kind: FailureKind::ConnectionLost,
            skip: 0,
            times: None,
        }
    }

    /// Fail only this many times, then let the statement through.
    pub fn times(mut self, n: u32) -> Self {
        self.times = Some(n);
        self
    }

    /// Let the first `n` matching statements succeed.
    pub fn after(mut self, n: u32) -> Self {
        self.skip = n;
        self
    }

    fn error(&self) -> MigrateError {
        match self.kind {
            FailureKind::Code(code) => {
                MigrateError::from_code(code, format!("injected failure on '{}'", self.pattern))
            }
            FailureKind::ConnectionLost => {
                MigrateError::ConnectionLost(format!("injected failure on '{}'", self.pattern))
            }
        }
    }
}

/// In-memory [`Connection`].
#[derive(Debug)]
pub struct MemoryConnection {
    autocommit: bool,
    committed: HashMap<String, MemoryTable>,
    working: Option<HashMap<String, MemoryTable>>,
    responses: Vec<(String, Vec<Row>)>,
    failures: Vec<FailureRule>,
    statements: Vec<String>,
    statement_timeout: Option<Duration>,
    refuse_autocommit_on: bool,
    broken: bool,
    commits: usize,
    rollbacks: usize,
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_pattern() -> &'static Regex {
    static P: OnceLock<Regex> = OnceLock::new();
    P.get_or_init(|| {
        Regex::new(r"(?is)^\s*INSERT\s+INTO\s+(\S+)\s*\(([^)]*)\)\s*VALUES")
            .expect("insert pattern is valid")
    })
}

fn lob_write_pattern() -> &'static Regex {
    static P: OnceLock<Regex> = OnceLock::new();
    P.get_or_init(|| {
        Regex::new(
            r"(?is)^\s*UPDATE\s+(\S+)\s+SET\s+(\S+)\.WRITE\s*\(\s*@P1\s*,\s*NULL\s*,\s*NULL\s*\)\s+WHERE\s+(.+)$",
        )
        .expect("lob write pattern is valid")
    })
}

fn key_predicate_pattern() -> &'static Regex {
    static P: OnceLock<Regex> = OnceLock::new();
    P.get_or_init(|| {
        Regex::new(r"\[?(\w+)\]?\s*=\s*@P(\d+)").expect("key predicate pattern is valid")
    })
}

fn count_pattern() -> &'static Regex {
    static P: OnceLock<Regex> = OnceLock::new();
    P.get_or_init(|| {
        Regex::new(r"(?is)^\s*SELECT\s+COUNT_BIG\s*\(\s*\*\s*\)\s+FROM\s+(\S+)\s*;?\s*$")
            .expect("count pattern is valid")
    })
}

fn top_pattern() -> &'static Regex {
    static P: OnceLock<Regex> = OnceLock::new();
    P.get_or_init(|| {
        Regex::new(r"(?is)^\s*SELECT\s+TOP\s*\(\s*(\d+)\s*\)\s+(.+?)\s+FROM\s+(\S+)\s+ORDER\s+BY\s+(.+?)\s*;?\s*$")
            .expect("top pattern is valid")
    })
}

/// `[EJ].[dbo].[Case]` and `EJ.dbo.Case` name the same table.
fn table_key(name: &str) -> String {
    name.replace(['[', ']'], "")
}

fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(|c| c.trim().trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self {
            autocommit: true,
            committed: HashMap::new(),
            working: None,
            responses: Vec::new(),
            failures: Vec::new(),
            statements: Vec::new(),
            statement_timeout: None,
            refuse_autocommit_on: false,
            broken: false,
            commits: 0,
            rollbacks: 0,
        }
    }

    /// Seed a committed table.
    pub fn insert_table(&mut self, name: &str, table: MemoryTable) {
        self.committed.insert(table_key(name), table);
    }

    /// Committed contents of a table.
    pub fn table(&self, name: &str) -> Option<&MemoryTable> {
        self.committed.get(&table_key(name))
    }

    /// Answer any query containing `pattern` (case-insensitive) with `rows`.
    pub fn respond(&mut self, pattern: &str, rows: Vec<Row>) {
        self.responses.push((pattern.to_ascii_lowercase(), rows));
    }

    pub fn fail(&mut self, rule: FailureRule) {
        self.failures.push(rule);
    }

    /// Make every attempt to switch autocommit back on fail.
    pub fn refuse_autocommit_on(&mut self) {
        self.refuse_autocommit_on = true;
    }

    /// Every statement received, in order, including failed ones.
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn statements_containing(&self, pattern: &str) -> usize {
        let pattern = pattern.to_ascii_lowercase();
        self.statements
            .iter()
            .filter(|s| s.to_ascii_lowercase().contains(&pattern))
            .count()
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks
    }

    pub fn in_transaction(&self) -> bool {
        self.working.is_some()
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout
    }

    fn check_usable(&self) -> Result<()> {
        if self.broken {
            return Err(MigrateError::ConnectionLost(
                "session was discarded after an abandoned request".to_string(),
            ));
        }
        Ok(())
    }

    fn record(&mut self, sql: &str) -> Result<()> {
        self.check_usable()?;
        self.statements.push(sql.to_string());
        let lower = sql.to_ascii_lowercase();
        for rule in self.failures.iter_mut() {
            if !lower.contains(&rule.pattern) {
                continue;
            }
            if rule.skip > 0 {
                rule.skip -= 1;
                continue;
            }
            match rule.times {
                Some(0) => continue,
                Some(n) => rule.times = Some(n - 1),
                None => {}
            }
            return Err(rule.error());
        }
        Ok(())
    }

    fn scripted(&self, sql: &str) -> Option<Vec<Row>> {
        let lower = sql.to_ascii_lowercase();
        self.responses
            .iter()
            .find(|(pattern, _)| lower.contains(pattern))
            .map(|(_, rows)| rows.clone())
    }

    fn tables(&self) -> &HashMap<String, MemoryTable> {
        self.working.as_ref().unwrap_or(&self.committed)
    }

    fn tables_mut(&mut self) -> &mut HashMap<String, MemoryTable> {
        if self.autocommit {
            &mut self.committed
        } else {
            let committed = &self.committed;
            self.working.get_or_insert_with(|| committed.clone())
        }
    }

    fn lookup(&self, name: &str) -> Result<&MemoryTable> {
        self.tables()
            .get(&table_key(name))
            .ok_or_else(|| MigrateError::from_code(208, format!("Invalid object name '{}'.", name)))
    }

    fn insert(&mut self, caps: &regex::Captures<'_>, params: &[SqlValue]) -> Result<u64> {
        let columns = split_names(&caps[2]);
        if columns.is_empty() || params.len() % columns.len() != 0 {
            return Err(MigrateError::from_code(
                110,
                "There are fewer columns in the INSERT statement than values specified",
            ));
        }
        let rows: Vec<&[SqlValue]> = params.chunks(columns.len()).collect();
        self.append_rows(&caps[1], &columns, &rows)
    }

    /// Append rows whose values follow `columns`; unnamed columns get NULL.
    fn append_rows(&mut self, name: &str, columns: &[String], rows: &[&[SqlValue]]) -> Result<u64> {
        let name = table_key(name);
        let table = self
            .tables_mut()
            .entry(name)
            .or_insert_with(|| MemoryTable::new(columns.iter().cloned()));

        let positions = columns
            .iter()
            .map(|c| {
                table
                    .column_index(c)
                    .ok_or_else(|| MigrateError::from_code(207, format!("Invalid column name '{}'.", c)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut inserted = 0;
        for values in rows {
            let mut row = vec![SqlValue::Null; table.columns.len()];
            for (pos, value) in positions.iter().zip(values.iter()) {
                row[*pos] = value.clone();
            }
            table.rows.push(row);
            inserted += 1;
        }
        Ok(inserted)
    }

    fn append_lob(&mut self, caps: &regex::Captures<'_>, params: &[SqlValue]) -> Result<u64> {
        let name = table_key(&caps[1]);
        let column = split_names(&caps[2]).pop().unwrap_or_default();
        let predicates: Vec<(String, usize)> = key_predicate_pattern()
            .captures_iter(&caps[3])
            .filter_map(|c| Some((c[1].to_string(), c[2].parse::<usize>().ok()?)))
            .collect();
        let chunk = params.first().cloned().unwrap_or(SqlValue::Null);

        let table = self
            .tables_mut()
            .get_mut(&name)
            .ok_or_else(|| MigrateError::from_code(208, format!("Invalid object name '{}'.", name)))?;
        let target = table
            .column_index(&column)
            .ok_or_else(|| MigrateError::from_code(207, format!("Invalid column name '{}'.", column)))?;
        let keys = predicates
            .iter()
            .map(|(col, p)| {
                let idx = table
                    .column_index(col)
                    .ok_or_else(|| MigrateError::from_code(207, format!("Invalid column name '{}'.", col)))?;
                Ok((idx, params.get(p - 1).cloned().unwrap_or(SqlValue::Null)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut updated = 0;
        for row in table
            .rows
            .iter_mut()
            .filter(|row| keys.iter().all(|(idx, v)| &row[*idx] == v))
        {
            match (&mut row[target], &chunk) {
                (SqlValue::Bytes(existing), SqlValue::Bytes(piece)) => existing.extend_from_slice(piece),
                (SqlValue::Text(existing), SqlValue::Text(piece)) => existing.push_str(piece),
                (SqlValue::Null, _) => {
                    return Err(MigrateError::from_code(
                        5302,
                        "Mutator 'WRITE()' on 'NULL' cannot be called on a null value.",
                    ))
                }
                (_, _) => return Err(MigrateError::from_code(257, "Implicit conversion not allowed")),
            }
            updated += 1;
        }
        Ok(updated)
    }

    fn select(&self, sql: &str) -> Result<Option<Vec<Row>>> {
        if let Some(rows) = self.scripted(sql) {
            return Ok(Some(rows));
        }
        if let Some(caps) = count_pattern().captures(sql) {
            let table = self.lookup(&caps[1])?;
            return Ok(Some(vec![vec![SqlValue::I64(table.rows.len() as i64)]]));
        }
        if let Some(caps) = top_pattern().captures(sql) {
            let limit: usize = caps[1].parse().unwrap_or(0);
            let table = self.lookup(&caps[3])?;
            let project = column_positions(table, &split_names(&caps[2]))?;
            let order = column_positions(table, &split_names(&caps[4]))?;

            let mut rows: Vec<&Row> = table.rows.iter().collect();
            rows.sort_by(|a, b| {
                order
                    .iter()
                    .map(|i| a[*i].sort_cmp(&b[*i]))
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let sampled = rows
                .into_iter()
                .take(limit)
                .map(|row| project.iter().map(|i| row[*i].clone()).collect())
                .collect();
            return Ok(Some(sampled));
        }
        if sql.trim().eq_ignore_ascii_case("SELECT 1") {
            return Ok(Some(vec![vec![SqlValue::I64(1)]]));
        }
        Ok(None)
    }
}

fn column_positions(table: &MemoryTable, names: &[String]) -> Result<Vec<usize>> {
    names
        .iter()
        .map(|n| {
            table
                .column_index(n)
                .ok_or_else(|| MigrateError::from_code(207, format!("Invalid column name '{}'.", n)))
        })
        .collect()
}

#[async_trait]
impl Connection for MemoryConnection {
    fn autocommit(&self) -> bool {
        self.autocommit
    }

    async fn set_autocommit(&mut self, enabled: bool) -> Result<()> {
        self.check_usable()?;
        if enabled && self.refuse_autocommit_on {
            return Err(MigrateError::ConnectionLost(
                "session state could not be changed".to_string(),
            ));
        }
        if enabled {
            // Turning autocommit on publishes pending work, as most drivers do.
            if let Some(working) = self.working.take() {
                self.committed = working;
            }
        }
        self.autocommit = enabled;
        Ok(())
    }

    async fn set_statement_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.statement_timeout = timeout;
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.record(sql)?;
        trace!(sql, params = params.len(), "memory execute");
        if let Some(caps) = insert_pattern().captures(sql) {
            return self.insert(&caps, params);
        }
        if let Some(caps) = lob_write_pattern().captures(sql) {
            return self.append_lob(&caps, params);
        }
        Ok(0)
    }

    async fn query(&mut self, sql: &str, _params: &[SqlValue]) -> Result<Vec<Row>> {
        self.record(sql)?;
        Ok(self.select(sql)?.unwrap_or_default())
    }

    async fn simple_query(&mut self, sql: &str) -> Result<Vec<Row>> {
        self.record(sql)?;
        Ok(self.select(sql)?.unwrap_or_default())
    }

    async fn bulk_insert(&mut self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = format!("INSERT BULK {} ({})", table, columns.join(", "));
        self.record(&sql)?;
        trace!(table, rows = rows.len(), "memory bulk insert");
        let rows: Vec<&[SqlValue]> = rows
            .iter()
            .map(|row| {
                if row.len() == columns.len() {
                    Ok(row.as_slice())
                } else {
                    Err(MigrateError::from_code(
                        4815,
                        "Received an invalid column length from the bcp client.",
                    ))
                }
            })
            .collect::<Result<_>>()?;
        self.append_rows(table, columns, &rows)
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_usable()?;
        if let Some(working) = self.working.take() {
            self.committed = working;
        }
        self.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.check_usable()?;
        self.working = None;
        self.rollbacks += 1;
        Ok(())
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn db_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_count() {
        let mut conn = MemoryConnection::new();
        let n = conn
            .execute(
                "INSERT INTO [EJ].[dbo].[Case] ([CaseID], [Title]) VALUES (@P1, @P2), (@P3, @P4)",
                &[1i64.into(), "a".into(), 2i64.into(), "b".into()],
            )
            .await
            .unwrap();
        assert_eq!(n, 2);

        let rows = conn
            .query("SELECT COUNT_BIG(*) FROM [EJ].[dbo].[Case]", &[])
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![SqlValue::I64(2)]]);
        assert_eq!(conn.table("EJ.dbo.Case").unwrap().rows.len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_discards_pending_rows() {
        let mut conn = MemoryConnection::new();
        conn.insert_table("T", MemoryTable::new(["id"]));
        conn.set_autocommit(false).await.unwrap();
        conn.execute("INSERT INTO [T] ([id]) VALUES (@P1)", &[1i64.into()])
            .await
            .unwrap();
        assert!(conn.in_transaction());
        conn.rollback().await.unwrap();
        assert!(conn.table("T").unwrap().rows.is_empty());

        conn.execute("INSERT INTO [T] ([id]) VALUES (@P1)", &[2i64.into()])
            .await
            .unwrap();
        conn.commit().await.unwrap();
        assert_eq!(conn.table("T").unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn test_lob_append() {
        let mut conn = MemoryConnection::new();
        conn.insert_table(
            "Doc",
            MemoryTable::new(["id", "body"]).with_rows(vec![vec![
                SqlValue::I64(7),
                SqlValue::Bytes(vec![]),
            ]]),
        );
        for piece in [vec![1u8, 2], vec![3]] {
            conn.execute(
                "UPDATE [Doc] SET [body].WRITE(@P1, NULL, NULL) WHERE [id] = @P2",
                &[SqlValue::Bytes(piece), SqlValue::I64(7)],
            )
            .await
            .unwrap();
        }
        assert_eq!(
            conn.table("Doc").unwrap().rows[0][1],
            SqlValue::Bytes(vec![1, 2, 3])
        );
    }

    #[tokio::test]
    async fn test_top_sample_is_ordered() {
        let mut conn = MemoryConnection::new();
        conn.insert_table(
            "T",
            MemoryTable::new(["id", "v"]).with_rows(vec![
                vec![SqlValue::I64(3), "c".into()],
                vec![SqlValue::I64(1), "a".into()],
                vec![SqlValue::I64(2), "b".into()],
            ]),
        );
        let rows = conn
            .simple_query("SELECT TOP (2) [id], [v] FROM [T] ORDER BY [id]")
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![SqlValue::I64(1), "a".into()],
                vec![SqlValue::I64(2), "b".into()]
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_rule_after_and_times() {
        let mut conn = MemoryConnection::new();
        conn.fail(FailureRule::code("insert into", 1205).after(1).times(1));
        let sql = "INSERT INTO [T] ([id]) VALUES (@P1)";
        assert!(conn.execute(sql, &[1i64.into()]).await.is_ok());
        let err = conn.execute(sql, &[2i64.into()]).await.unwrap_err();
        assert_eq!(err.code(), Some(1205));
        assert!(conn.execute(sql, &[3i64.into()]).await.is_ok());
        assert_eq!(conn.statements_containing("insert into"), 3);
    }

    #[tokio::test]
    async fn test_bulk_insert_is_one_statement() {
        let mut conn = MemoryConnection::new();
        conn.insert_table("T", MemoryTable::new(["a", "b", "c"]));
        let columns: Vec<String> = vec!["c".into(), "a".into(), "b".into()];
        let rows: Vec<Row> = (0..1000)
            .map(|i| vec![SqlValue::I64(i), "x".into(), SqlValue::Null])
            .collect();

        let n = conn.bulk_insert("[T]", &columns, &rows).await.unwrap();
        assert_eq!(n, 1000);
        assert_eq!(conn.statements().len(), 1);
        assert_eq!(conn.statements_containing("insert bulk"), 1);

        let table = conn.table("T").unwrap();
        assert_eq!(table.rows.len(), 1000);
        assert_eq!(table.rows[9], vec!["x".into(), SqlValue::Null, SqlValue::I64(9)]);
    }

    #[tokio::test]
    async fn test_broken_session_refuses_work() {
        let mut conn = MemoryConnection::new();
        conn.mark_broken();
        let err = conn.simple_query("SELECT 1").await.unwrap_err();
        assert!(matches!(err, MigrateError::ConnectionLost(_)));
        assert!(conn.statements().is_empty());
    }

    #[tokio::test]
    async fn test_missing_table_is_permanent_error() {
        let mut conn = MemoryConnection::new();
        let err = conn
            .query("SELECT COUNT_BIG(*) FROM [Nope]", &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(208));
    }

    #[tokio::test]
    async fn test_scripted_response() {
        let mut conn = MemoryConnection::new();
        conn.respond("from _tmp_caseids", vec![vec![SqlValue::I64(12)]]);
        let rows = conn
            .simple_query("SELECT COUNT(*) FROM _tmp_CaseIDs")
            .await
            .unwrap();
        assert_eq!(rows[0][0], SqlValue::I64(12));
    }
}
