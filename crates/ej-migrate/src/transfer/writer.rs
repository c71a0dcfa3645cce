//! Batch writers for the target side.

use std::borrow::Cow;

use async_trait::async_trait;

use crate::core::identifier::quote_mssql;
use crate::core::value::{LobHandle, Row, SqlValue};
use crate::db::Connection;
use crate::error::{MigrateError, Result};

/// Writes row batches and appends LOB pieces on a caller-owned connection.
///
/// Writers never commit; the caller's transaction scope decides.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn write_rows(
        &self,
        conn: &mut dyn Connection,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64>;

    /// Append one piece to the LOB identified by `handle`.
    async fn append_lob(
        &self,
        conn: &mut dyn Connection,
        handle: &LobHandle,
        chunk: &SqlValue,
    ) -> Result<()>;
}

/// One bulk load per batch plus `.WRITE` appends.
#[derive(Debug, Clone)]
pub struct SqlBatchWriter {
    target: String,
    key: Vec<String>,
}

impl SqlBatchWriter {
    /// `target` is an already-quoted table name.
    pub fn new(target: impl Into<String>, key: Vec<String>) -> Self {
        Self {
            target: target.into(),
            key,
        }
    }
}

/// Rows with every LOB handle replaced by the empty value its pieces are
/// appended to. Borrows when the batch has no handles.
fn with_empty_lobs(rows: &[Row]) -> Cow<'_, [Row]> {
    let has_lobs = rows
        .iter()
        .any(|row| row.iter().any(|v| matches!(v, SqlValue::Lob(_))));
    if !has_lobs {
        return Cow::Borrowed(rows);
    }
    Cow::Owned(
        rows.iter()
            .map(|row| {
                row.iter()
                    .map(|value| match value {
                        SqlValue::Lob(handle) => handle.kind.empty_value(),
                        other => other.clone(),
                    })
                    .collect()
            })
            .collect(),
    )
}

#[async_trait]
impl BatchWriter for SqlBatchWriter {
    async fn write_rows(
        &self,
        conn: &mut dyn Connection,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let rows = with_empty_lobs(rows);
        conn.bulk_insert(&self.target, columns, &rows).await
    }

    async fn append_lob(
        &self,
        conn: &mut dyn Connection,
        handle: &LobHandle,
        chunk: &SqlValue,
    ) -> Result<()> {
        if self.key.is_empty() || handle.key.len() != self.key.len() {
            return Err(MigrateError::Config(format!(
                "cannot stream {} into {} without its key",
                handle.column, self.target
            )));
        }
        let mut predicates = Vec::with_capacity(self.key.len());
        for (i, column) in self.key.iter().enumerate() {
            predicates.push(format!("{} = @P{}", quote_mssql(column)?, i + 2));
        }
        let sql = format!(
            "UPDATE {} SET {}.WRITE(@P1, NULL, NULL) WHERE {}",
            self.target,
            quote_mssql(&handle.column)?,
            predicates.join(" AND ")
        );
        let mut params = Vec::with_capacity(1 + handle.key.len());
        params.push(chunk.clone());
        params.extend(handle.key.iter().cloned());

        let updated = conn.execute(&sql, &params).await?;
        if updated != 1 {
            return Err(MigrateError::PermanentDatabase {
                code: None,
                message: format!(
                    "LOB append to {}.{} matched {} rows",
                    self.target, handle.column, updated
                ),
            });
        }
        Ok(())
    }
}
