//! Database connection abstraction.
//!
//! The engine talks to the database only through [`Connection`]. The
//! tiberius implementation drives SQL Server; the in-memory one backs tests
//! and dry runs.

pub mod memory;
pub mod mssql;

use std::time::Duration;

use async_trait::async_trait;

use crate::core::value::{Row, SqlValue};
use crate::error::Result;

pub use memory::{FailureRule, MemoryConnection, MemoryTable};
pub use mssql::{ConnectionProvider, MssqlConnection};

/// A single database session.
///
/// Methods take `&mut self`; only one operation can be in flight on a
/// connection at a time.
#[async_trait]
pub trait Connection: Send {
    /// Current autocommit mode as last set on this session.
    fn autocommit(&self) -> bool;

    /// Switch autocommit on or off. Only the transactional execution unit
    /// calls this.
    async fn set_autocommit(&mut self, enabled: bool) -> Result<()>;

    /// Apply (or clear with `None`) a per-statement lock timeout.
    async fn set_statement_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Execute one statement with `@P1..@Pn` parameters; returns rows affected.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run a parameterized query and return the first result set.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Run a batch of statements without parameters and return the last
    /// non-empty result set.
    async fn simple_query(&mut self, sql: &str) -> Result<Vec<Row>>;

    /// Append `rows` to `table` as one bulk write. `columns` names the
    /// values of each row in order.
    async fn bulk_insert(&mut self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Cheap liveness check.
    async fn ping(&mut self) -> Result<()> {
        self.simple_query("SELECT 1").await.map(|_| ())
    }

    /// Give up on the session after a request was abandoned mid-flight.
    /// Every later call fails with `ConnectionLost`.
    fn mark_broken(&mut self);

    fn is_broken(&self) -> bool;

    /// Backend name for log lines.
    fn db_type(&self) -> &'static str;
}

/// First column of the first row, if any.
pub fn first_scalar(rows: &[Row]) -> Option<&SqlValue> {
    rows.first().and_then(|row| row.first())
}
