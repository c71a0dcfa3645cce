//! Units of work executed inside a transaction scope.

use async_trait::async_trait;
use tracing::debug;

use crate::core::value::SqlValue;
use crate::db::{first_scalar, Connection};
use crate::error::Result;
use crate::script::split_batches;

/// Something that can be run against a connection, possibly more than once.
///
/// `run` takes `&self` so the retry policy can re-run the same unit from
/// scratch in a fresh transaction scope.
#[async_trait]
pub trait Work: Send + Sync {
    type Output: Send;

    /// Label for log lines.
    fn name(&self) -> &str;

    async fn run(&self, conn: &mut dyn Connection) -> Result<Self::Output>;
}

/// A single parameterized statement. Output is rows affected.
#[derive(Debug, Clone)]
pub struct Statement {
    name: String,
    sql: String,
    params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<SqlValue>) -> Self {
        self.params = params;
        self
    }
}

#[async_trait]
impl Work for Statement {
    type Output = u64;

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, conn: &mut dyn Connection) -> Result<u64> {
        conn.execute(&self.sql, &self.params).await
    }
}

/// Result of running a [`Script`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutput {
    pub batches: usize,
    /// First cell of the last batch that returned rows.
    pub scalar: Option<SqlValue>,
}

/// A rendered script, executed batch by batch on `GO` boundaries.
#[derive(Debug, Clone)]
pub struct Script {
    name: String,
    batches: Vec<String>,
}

impl Script {
    pub fn new(name: impl Into<String>, text: &str) -> Self {
        Self {
            name: name.into(),
            batches: split_batches(text),
        }
    }

    pub fn batches(&self) -> &[String] {
        &self.batches
    }
}

#[async_trait]
impl Work for Script {
    type Output = ScriptOutput;

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, conn: &mut dyn Connection) -> Result<ScriptOutput> {
        let mut scalar = None;
        for (i, batch) in self.batches.iter().enumerate() {
            debug!(script = %self.name, batch = i + 1, total = self.batches.len(), "executing batch");
            let rows = conn.simple_query(batch).await?;
            if let Some(value) = first_scalar(&rows) {
                scalar = Some(value.clone());
            }
        }
        Ok(ScriptOutput {
            batches: self.batches.len(),
            scalar,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryConnection;

    #[tokio::test]
    async fn test_script_runs_each_batch_and_keeps_last_scalar() {
        let mut conn = MemoryConnection::new();
        conn.respond("from _tmp_caseids", vec![vec![SqlValue::I64(40)]]);
        let script = Script::new(
            "gather",
            "INSERT INTO _tmp_CaseIDs SELECT CaseID FROM Justice.dbo.Case\nGO\nSELECT COUNT(*) FROM _tmp_CaseIDs\nGO\n",
        );

        let out = script.run(&mut conn).await.unwrap();
        assert_eq!(out.batches, 2);
        assert_eq!(out.scalar, Some(SqlValue::I64(40)));
        assert_eq!(conn.statements().len(), 2);
    }

    #[tokio::test]
    async fn test_statement_binds_params() {
        let mut conn = MemoryConnection::new();
        let stmt = Statement::new("insert", "INSERT INTO [T] ([id]) VALUES (@P1), (@P2)")
            .with_params(vec![1i64.into(), 2i64.into()]);
        assert_eq!(stmt.run(&mut conn).await.unwrap(), 2);
    }
}
