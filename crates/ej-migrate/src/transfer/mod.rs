//! Batch copier: moves rows from a source cursor to a target writer in
//! fixed-size chunks.
//!
//! Each chunk is one unit of work: the rows are inserted and every streamed
//! LOB value in them is appended piece by piece, all inside one transaction
//! scope. A failed chunk is retried from its first row; earlier chunks stay
//! committed. Peak memory is one chunk plus one LOB piece.

mod source;
mod writer;

pub use source::{
    MemoryRowSource, MemorySourceProvider, MssqlRowSource, MssqlSourceProvider, RowSource,
    SourceProvider, SourceTable,
};
pub use writer::{BatchWriter, SqlBatchWriter};

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::value::{LobHandle, LobKind, Row, SqlValue};
use crate::db::Connection;
use crate::error::{MigrateError, Result};
use crate::exec::{RetryPolicy, Work};
use crate::orchestrator::OperationCounters;

/// Chunking parameters.
#[derive(Debug, Clone)]
pub struct CopyConfig {
    /// Rows per chunk.
    pub batch_size: usize,
    /// Bytes per LOB piece.
    pub lob_chunk_size: usize,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            lob_chunk_size: 1024 * 1024,
        }
    }
}

/// Statistics from one copy.
#[derive(Debug, Clone, Default)]
pub struct CopyStats {
    pub rows: u64,
    pub batches: u64,
    pub lob_bytes: u64,
    /// Highest attempt count any chunk needed.
    pub max_attempts: u32,
    /// Chunks that needed more than one attempt.
    pub retried_batches: u64,
    pub read_time: Duration,
    pub write_time: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
struct BatchWrite {
    rows: u64,
    lob_bytes: u64,
}

/// One chunk as a re-runnable unit of work.
struct WriteBatch<'a> {
    name: String,
    writer: &'a dyn BatchWriter,
    source: &'a dyn RowSource,
    columns: &'a [String],
    rows: &'a [Row],
    lob_chunk_size: usize,
}

impl<'a> WriteBatch<'a> {
    async fn stream_lob(&self, conn: &mut dyn Connection, handle: &LobHandle) -> Result<u64> {
        let width = handle.kind.unit_width();
        // A text piece needs room for a whole surrogate pair.
        let floor = match handle.kind {
            LobKind::Text => 2,
            LobKind::Binary => 1,
        };
        let units = (self.lob_chunk_size / width).max(floor);
        let mut offset = 0u64;
        let mut bytes = 0u64;

        while offset < handle.length {
            let Some(piece) = self.source.read_lob_chunk(handle, offset, units).await? else {
                break;
            };
            let len = piece.lob_length().unwrap_or(0);
            if len == 0 {
                break;
            }
            self.writer.append_lob(conn, handle, &piece).await?;
            offset += len;
            bytes += len * width as u64;
        }

        if offset != handle.length {
            return Err(MigrateError::PermanentDatabase {
                code: None,
                message: format!(
                    "LOB {} ended after {} of {} units",
                    handle.column, offset, handle.length
                ),
            });
        }
        Ok(bytes)
    }
}

#[async_trait]
impl<'a> Work for WriteBatch<'a> {
    type Output = BatchWrite;

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, conn: &mut dyn Connection) -> Result<BatchWrite> {
        let rows = self.writer.write_rows(conn, self.columns, self.rows).await?;
        let mut lob_bytes = 0;
        for row in self.rows {
            for value in row {
                if let SqlValue::Lob(handle) = value {
                    if handle.length > 0 {
                        lob_bytes += self.stream_lob(conn, handle).await?;
                    }
                }
            }
        }
        Ok(BatchWrite { rows, lob_bytes })
    }
}

/// Streams a source cursor into a writer chunk by chunk.
pub struct BatchCopier<'a> {
    retry: &'a RetryPolicy,
    config: CopyConfig,
    counters: OperationCounters,
    cancel: CancellationToken,
}

impl<'a> BatchCopier<'a> {
    pub fn new(retry: &'a RetryPolicy, config: CopyConfig) -> Self {
        Self {
            retry,
            config,
            counters: OperationCounters::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Add committed rows to these counters.
    pub fn with_counters(mut self, counters: OperationCounters) -> Self {
        self.counters = counters;
        self
    }

    /// Stop between chunks once this token is cancelled.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Copy everything `source` yields. Chunks that committed before a
    /// failure stay committed.
    pub async fn copy(
        &self,
        source: &mut dyn RowSource,
        writer: &dyn BatchWriter,
        conn: &mut dyn Connection,
        deadline: Option<Instant>,
    ) -> Result<CopyStats> {
        let batch_size = self.config.batch_size.max(1);
        let columns = source.columns().to_vec();
        let mut stats = CopyStats::default();

        loop {
            if self.cancel.is_cancelled() {
                info!(batches = stats.batches, rows = stats.rows, "copy cancelled");
                return Err(MigrateError::Cancelled);
            }

            let read_start = Instant::now();
            let rows = source.fetch(batch_size).await?;
            stats.read_time += read_start.elapsed();
            if rows.is_empty() {
                break;
            }

            let number = stats.batches + 1;
            let work = WriteBatch {
                name: format!("batch {}", number),
                writer,
                source: &*source,
                columns: &columns,
                rows: &rows,
                lob_chunk_size: self.config.lob_chunk_size,
            };

            let write_start = Instant::now();
            let written = match self.retry.run_until(conn, &work, deadline).await {
                Ok(written) => written,
                Err(e) => {
                    error!(batch = number, committed_rows = stats.rows, "batch failed: {}", e);
                    return Err(e);
                }
            };
            stats.write_time += write_start.elapsed();

            stats.batches = number;
            stats.rows += written.value.rows;
            stats.lob_bytes += written.value.lob_bytes;
            stats.max_attempts = stats.max_attempts.max(written.attempts);
            if written.attempts > 1 {
                stats.retried_batches += 1;
            }
            self.counters.add_rows(written.value.rows);
            debug!(
                batch = number,
                rows = written.value.rows,
                attempts = written.attempts,
                "batch committed"
            );

            if rows.len() < batch_size {
                break;
            }
        }

        stats.max_attempts = stats.max_attempts.max(1);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FailureRule, MemoryConnection, MemoryTable};
    use crate::script::TableSpec;

    fn source_rows(n: i64) -> MemoryTable {
        MemoryTable::new(["id", "name"]).with_rows(
            (1..=n)
                .map(|i| vec![SqlValue::I64(i), SqlValue::Text(format!("row {i}"))])
                .collect(),
        )
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            statement_timeout: None,
        }
    }

    fn spec() -> TableSpec {
        TableSpec::new("T").with_key(&["id"])
    }

    #[tokio::test(start_paused = true)]
    async fn test_copies_in_ceil_n_over_b_writes() {
        let mut source = MemoryRowSource::new(source_rows(2500), &spec()).unwrap();
        let writer = SqlBatchWriter::new("[T]", vec!["id".into()]);
        let mut conn = MemoryConnection::new();
        let retry = policy();
        let copier = BatchCopier::new(
            &retry,
            CopyConfig {
                batch_size: 1000,
                lob_chunk_size: 16,
            },
        );

        let stats = copier.copy(&mut source, &writer, &mut conn, None).await.unwrap();
        assert_eq!(stats.rows, 2500);
        assert_eq!(stats.batches, 3);
        assert_eq!(conn.commits(), 3);
        assert_eq!(conn.table("T").unwrap().rows.len(), 2500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_multiple_needs_no_extra_write() {
        let mut source = MemoryRowSource::new(source_rows(2000), &spec()).unwrap();
        let writer = SqlBatchWriter::new("[T]", vec!["id".into()]);
        let mut conn = MemoryConnection::new();
        let retry = policy();
        let copier = BatchCopier::new(&retry, CopyConfig { batch_size: 1000, lob_chunk_size: 16 });

        let stats = copier.copy(&mut source, &writer, &mut conn, None).await.unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(conn.statements_containing("insert bulk"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_on_batch_k_keeps_earlier_batches() {
        let mut source = MemoryRowSource::new(source_rows(5000), &spec()).unwrap();
        let writer = SqlBatchWriter::new("[T]", vec!["id".into()]);
        let mut conn = MemoryConnection::new();
        conn.fail(FailureRule::code("insert bulk", 547).after(2));
        let retry = policy();
        let copier = BatchCopier::new(&retry, CopyConfig { batch_size: 1000, lob_chunk_size: 16 });

        let err = copier
            .copy(&mut source, &writer, &mut conn, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(547));
        assert_eq!(conn.table("T").unwrap().rows.len(), 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_batch_retried_from_start() {
        let mut source = MemoryRowSource::new(source_rows(3000), &spec()).unwrap();
        let writer = SqlBatchWriter::new("[T]", vec!["id".into()]);
        let mut conn = MemoryConnection::new();
        conn.fail(FailureRule::code("insert bulk", 1205).after(1).times(2));
        let retry = policy();
        let counters = OperationCounters::new();
        let copier = BatchCopier::new(&retry, CopyConfig { batch_size: 1000, lob_chunk_size: 16 })
            .with_counters(counters.clone());

        let stats = copier.copy(&mut source, &writer, &mut conn, None).await.unwrap();
        assert_eq!(stats.rows, 3000);
        assert_eq!(stats.max_attempts, 3);
        assert_eq!(stats.retried_batches, 1);
        assert_eq!(counters.rows_copied(), 3000);
        assert_eq!(conn.table("T").unwrap().rows.len(), 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lob_streamed_in_pieces_within_batch() {
        let body: Vec<u8> = (0..100u8).collect();
        let table = MemoryTable::new(["id", "body"]).with_rows(vec![
            vec![SqlValue::I64(1), SqlValue::Bytes(body.clone())],
            vec![SqlValue::I64(2), SqlValue::Null],
            vec![SqlValue::I64(3), SqlValue::Bytes(vec![])],
        ]);
        let spec = TableSpec::new("Doc").with_key(&["id"]).with_lob_columns(&["body"]);
        let mut source = MemoryRowSource::new(table, &spec).unwrap();
        let writer = SqlBatchWriter::new("[Doc]", vec!["id".into()]);
        let mut conn = MemoryConnection::new();
        let retry = policy();
        let copier = BatchCopier::new(&retry, CopyConfig { batch_size: 10, lob_chunk_size: 30 });

        let stats = copier.copy(&mut source, &writer, &mut conn, None).await.unwrap();
        assert_eq!(stats.lob_bytes, 100);
        assert_eq!(conn.statements_containing(".write("), 4);
        assert_eq!(conn.commits(), 1);

        let target = conn.table("Doc").unwrap();
        assert_eq!(target.rows[0][1], SqlValue::Bytes(body));
        assert_eq!(target.rows[1][1], SqlValue::Null);
        assert_eq!(target.rows[2][1], SqlValue::Bytes(vec![]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lob_failure_rolls_back_whole_batch() {
        let table = MemoryTable::new(["id", "body"]).with_rows(vec![vec![
            SqlValue::I64(1),
            SqlValue::Text("abcdef".into()),
        ]]);
        let spec = TableSpec::new("Doc").with_key(&["id"]).with_lob_columns(&["body"]);
        let mut source = MemoryRowSource::new(table, &spec).unwrap();
        let writer = SqlBatchWriter::new("[Doc]", vec!["id".into()]);
        let mut conn = MemoryConnection::new();
        conn.insert_table("Doc", MemoryTable::new(["id", "body"]));
        conn.fail(FailureRule::code(".write(", 8152).after(1));
        let retry = policy();
        let copier = BatchCopier::new(&retry, CopyConfig { batch_size: 10, lob_chunk_size: 4 });

        assert!(copier.copy(&mut source, &writer, &mut conn, None).await.is_err());
        assert!(conn.table("Doc").unwrap().rows.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_lob_with_surrogate_pairs_copies_intact() {
        let body = "x😀y😀😀z".to_string();
        let table = MemoryTable::new(["id", "body"])
            .with_rows(vec![vec![SqlValue::I64(1), SqlValue::Text(body.clone())]]);
        let spec = TableSpec::new("Doc").with_key(&["id"]).with_lob_columns(&["body"]);
        let mut source = MemoryRowSource::new(table, &spec).unwrap();
        let writer = SqlBatchWriter::new("[Doc]", vec!["id".into()]);
        let mut conn = MemoryConnection::new();
        let retry = policy();
        let copier = BatchCopier::new(&retry, CopyConfig { batch_size: 10, lob_chunk_size: 4 });

        let stats = copier.copy(&mut source, &writer, &mut conn, None).await.unwrap();
        assert_eq!(stats.lob_bytes, 18);
        assert_eq!(conn.table("Doc").unwrap().rows[0][1], SqlValue::Text(body));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_checked_between_batches() {
        let mut source = MemoryRowSource::new(source_rows(3000), &spec()).unwrap();
        let writer = SqlBatchWriter::new("[T]", vec!["id".into()]);
        let mut conn = MemoryConnection::new();
        let retry = policy();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let copier = BatchCopier::new(&retry, CopyConfig { batch_size: 1000, lob_chunk_size: 16 })
            .with_cancel(cancel);

        let err = copier
            .copy(&mut source, &writer, &mut conn, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
        assert!(conn.table("T").is_none());
    }
}
