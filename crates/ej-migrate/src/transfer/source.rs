//! Row sources: forward-only cursors over a source table.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::identifier::{quote_column_list, quote_mssql, qualify_three_part};
use crate::core::value::{LobHandle, LobKind, Row, SqlValue};
use crate::db::{Connection, ConnectionProvider, MemoryTable, MssqlConnection};
use crate::error::{MigrateError, Result};
use crate::script::TableSpec;

/// A table to read, located by database and schema.
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub database: String,
    pub schema: String,
    pub spec: TableSpec,
}

impl SourceTable {
    pub fn new(database: impl Into<String>, schema: impl Into<String>, spec: TableSpec) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            spec,
        }
    }

    /// `[database].[schema].[table]`
    pub fn qualified(&self) -> Result<String> {
        qualify_three_part(&self.database, &self.schema, &self.spec.name)
    }
}

/// Forward-only cursor yielding row batches.
///
/// Streamed LOB columns come back as [`SqlValue::Lob`] handles; their
/// content is read in pieces through [`RowSource::read_lob_chunk`].
#[async_trait]
pub trait RowSource: Send + Sync {
    fn columns(&self) -> &[String];

    /// Up to `max_rows` rows. Empty means exhausted.
    async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>>;

    /// Up to `len` units (bytes, or UTF-16 code units for text) of a LOB
    /// starting at zero-based `offset`. A text piece never ends inside a
    /// surrogate pair, so it may come back one unit short.
    async fn read_lob_chunk(
        &self,
        handle: &LobHandle,
        offset: u64,
        len: usize,
    ) -> Result<Option<SqlValue>>;
}

/// Opens row sources for tables.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn open(&self, table: &SourceTable) -> Result<Box<dyn RowSource>>;
}

/// Column positions of `names` within `columns`.
fn positions(columns: &[String], names: &[String], table: &str) -> Result<Vec<usize>> {
    names
        .iter()
        .map(|n| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(n))
                .ok_or_else(|| {
                    MigrateError::Config(format!("table {} has no column {}", table, n))
                })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// SQL Server
// ---------------------------------------------------------------------------

/// Source cursor over a SQL Server table.
///
/// Pages by keyset on a single-column key, by OFFSET/FETCH otherwise. LOB
/// columns are selected as their length and read later with `SUBSTRING`.
pub struct MssqlRowSource {
    conn: Mutex<MssqlConnection>,
    qualified: String,
    columns: Vec<String>,
    select_list: String,
    order_by: String,
    key: Vec<String>,
    key_idx: Vec<usize>,
    lobs: Vec<(usize, LobKind)>,
    last_key: Option<SqlValue>,
    offset: i64,
}

impl MssqlRowSource {
    fn page_query(&self, max_rows: usize) -> (String, Vec<SqlValue>) {
        if self.key.len() == 1 {
            let key = &self.order_by;
            match &self.last_key {
                Some(last) => (
                    format!(
                        "SELECT TOP ({}) {} FROM {} WHERE {} > @P1 ORDER BY {}",
                        max_rows, self.select_list, self.qualified, key, key
                    ),
                    vec![last.clone()],
                ),
                None => (
                    format!(
                        "SELECT TOP ({}) {} FROM {} ORDER BY {}",
                        max_rows, self.select_list, self.qualified, key
                    ),
                    Vec::new(),
                ),
            }
        } else {
            (
                format!(
                    "SELECT {} FROM {} ORDER BY {} OFFSET @P1 ROWS FETCH NEXT @P2 ROWS ONLY",
                    self.select_list, self.qualified, self.order_by
                ),
                vec![SqlValue::I64(self.offset), SqlValue::I64(max_rows as i64)],
            )
        }
    }
}

#[async_trait]
impl RowSource for MssqlRowSource {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        let (sql, params) = self.page_query(max_rows);
        let mut rows = self.conn.get_mut().query(&sql, &params).await?;

        for row in rows.iter_mut() {
            let key: Vec<SqlValue> = self.key_idx.iter().map(|i| row[*i].clone()).collect();
            for (idx, kind) in &self.lobs {
                if let Some(length) = row[*idx].as_i64() {
                    row[*idx] = SqlValue::Lob(LobHandle {
                        column: self.columns[*idx].clone(),
                        kind: *kind,
                        key: key.clone(),
                        length: length.max(0) as u64,
                    });
                }
            }
        }

        if let (Some(last), Some(idx)) = (rows.last(), self.key_idx.first()) {
            self.last_key = Some(last[*idx].clone());
        }
        self.offset += rows.len() as i64;
        Ok(rows)
    }

    async fn read_lob_chunk(
        &self,
        handle: &LobHandle,
        offset: u64,
        len: usize,
    ) -> Result<Option<SqlValue>> {
        if offset >= handle.length {
            return Ok(None);
        }
        let mut predicates = Vec::with_capacity(self.key.len());
        for (i, column) in self.key.iter().enumerate() {
            predicates.push(format!("{} = @P{}", quote_mssql(column)?, i + 3));
        }
        let column = quote_mssql(&handle.column)?;
        let length = match handle.kind {
            LobKind::Binary => "@P2".to_string(),
            // Stop short of a high surrogate (0xD800-0xDBFF) so the pair is
            // read whole by the next piece.
            LobKind::Text => format!(
                "CASE WHEN @P2 > 1 AND UNICODE(SUBSTRING({c}, @P1 + @P2 - 1, 1)) \
                 BETWEEN 55296 AND 56319 THEN @P2 - 1 ELSE @P2 END",
                c = column
            ),
        };
        let sql = format!(
            "SELECT SUBSTRING({}, @P1, {}) FROM {} WHERE {}",
            column,
            length,
            self.qualified,
            predicates.join(" AND ")
        );
        let mut params = vec![SqlValue::I64(offset as i64 + 1), SqlValue::I64(len as i64)];
        params.extend(handle.key.iter().cloned());

        let rows = self.conn.lock().await.query(&sql, &params).await?;
        Ok(rows.into_iter().next().and_then(|r| r.into_iter().next()))
    }
}

/// Opens [`MssqlRowSource`]s from the shared pool.
#[derive(Clone)]
pub struct MssqlSourceProvider {
    provider: ConnectionProvider,
}

impl MssqlSourceProvider {
    pub fn new(provider: ConnectionProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl SourceProvider for MssqlSourceProvider {
    async fn open(&self, table: &SourceTable) -> Result<Box<dyn RowSource>> {
        let qualified = table.qualified()?;
        let mut conn = self.provider.connect().await?;

        let sql = format!(
            "SELECT COLUMN_NAME, DATA_TYPE FROM {}.INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 ORDER BY ORDINAL_POSITION",
            quote_mssql(&table.database)?
        );
        let meta = conn
            .query(
                &sql,
                &[
                    SqlValue::Text(table.schema.clone()),
                    SqlValue::Text(table.spec.name.clone()),
                ],
            )
            .await?;

        let mut columns = Vec::with_capacity(meta.len());
        let mut types = HashMap::new();
        for row in meta {
            if let (Some(SqlValue::Text(name)), Some(SqlValue::Text(ty))) = (row.first(), row.get(1)) {
                types.insert(name.to_ascii_lowercase(), ty.to_ascii_lowercase());
                columns.push(name.clone());
            }
        }
        if columns.is_empty() {
            return Err(MigrateError::from_code(
                208,
                format!("Invalid object name '{}'.", qualified),
            ));
        }

        let spec = &table.spec;
        let key_idx = positions(&columns, &spec.key, &spec.name)?;
        let lob_idx = positions(&columns, &spec.lob_columns, &spec.name)?;

        let mut lobs = Vec::with_capacity(lob_idx.len());
        let mut select = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            let quoted = quote_mssql(column)?;
            let ty = types.get(&column.to_ascii_lowercase()).map(String::as_str).unwrap_or("");
            if lob_idx.contains(&i) {
                let (kind, expr) = match ty {
                    "varbinary" | "image" => (LobKind::Binary, format!("DATALENGTH({})", quoted)),
                    "nvarchar" | "ntext" => (LobKind::Text, format!("DATALENGTH({}) / 2", quoted)),
                    _ => (LobKind::Text, format!("DATALENGTH({})", quoted)),
                };
                lobs.push((i, kind));
                select.push(format!("CAST({} AS BIGINT) AS {}", expr, quoted));
            } else if let Some(cast) = exact_money(ty) {
                select.push(format!("CAST({} AS {}) AS {}", quoted, cast, quoted));
            } else {
                select.push(quoted);
            }
        }

        let order_by = if spec.key.is_empty() {
            quote_mssql(&columns[0])?
        } else {
            quote_column_list(&spec.key)?
        };

        debug!(table = %qualified, columns = columns.len(), lobs = lobs.len(), "opened source cursor");

        Ok(Box::new(MssqlRowSource {
            conn: Mutex::new(conn),
            qualified,
            select_list: select.join(", "),
            order_by,
            key: spec.key.clone(),
            key_idx,
            columns,
            lobs,
            last_key: None,
            offset: 0,
        }))
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Row source over an in-memory table.
#[derive(Debug)]
pub struct MemoryRowSource {
    table: MemoryTable,
    position: usize,
    key_idx: Vec<usize>,
    lob_idx: Vec<usize>,
}

impl MemoryRowSource {
    pub fn new(table: MemoryTable, spec: &TableSpec) -> Result<Self> {
        let key_idx = positions(&table.columns, &spec.key, &spec.name)?;
        let lob_idx = positions(&table.columns, &spec.lob_columns, &spec.name)?;
        Ok(Self {
            table,
            position: 0,
            key_idx,
            lob_idx,
        })
    }

    fn find(&self, handle: &LobHandle) -> Option<&SqlValue> {
        let column = self.table.column_index(&handle.column)?;
        self.table
            .rows
            .iter()
            .find(|row| {
                self.key_idx
                    .iter()
                    .zip(&handle.key)
                    .all(|(i, v)| &row[*i] == v)
            })
            .map(|row| &row[column])
    }
}

#[async_trait]
impl RowSource for MemoryRowSource {
    fn columns(&self) -> &[String] {
        &self.table.columns
    }

    async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        let end = (self.position + max_rows).min(self.table.rows.len());
        let mut batch: Vec<Row> = self.table.rows[self.position..end].to_vec();
        self.position = end;

        for row in batch.iter_mut() {
            let key: Vec<SqlValue> = self.key_idx.iter().map(|i| row[*i].clone()).collect();
            for idx in &self.lob_idx {
                let kind = match &row[*idx] {
                    SqlValue::Bytes(_) => LobKind::Binary,
                    SqlValue::Text(_) => LobKind::Text,
                    _ => continue,
                };
                let length = row[*idx].lob_length().unwrap_or(0);
                row[*idx] = SqlValue::Lob(LobHandle {
                    column: self.table.columns[*idx].clone(),
                    kind,
                    key: key.clone(),
                    length,
                });
            }
        }
        Ok(batch)
    }

    async fn read_lob_chunk(
        &self,
        handle: &LobHandle,
        offset: u64,
        len: usize,
    ) -> Result<Option<SqlValue>> {
        let start = offset as usize;
        Ok(match self.find(handle) {
            Some(SqlValue::Bytes(bytes)) if start < bytes.len() => {
                let end = (start + len).min(bytes.len());
                Some(SqlValue::Bytes(bytes[start..end].to_vec()))
            }
            Some(SqlValue::Text(text)) => {
                let units: Vec<u16> = text.encode_utf16().collect();
                if start >= units.len() {
                    return Ok(None);
                }
                let mut end = (start + len).min(units.len());
                if end < units.len() && end - start > 1 && is_high_surrogate(units[end - 1]) {
                    end -= 1;
                }
                let piece = String::from_utf16(&units[start..end]).map_err(|_| {
                    MigrateError::Conversion(format!(
                        "{} units {}..{} split a surrogate pair",
                        handle.column, start, end
                    ))
                })?;
                Some(SqlValue::Text(piece))
            }
            _ => None,
        })
    }
}

/// Money arrives as a float over TDS; read it as the matching decimal.
fn exact_money(data_type: &str) -> Option<&'static str> {
    match data_type {
        "money" => Some("DECIMAL(19,4)"),
        "smallmoney" => Some("DECIMAL(10,4)"),
        _ => None,
    }
}

fn is_high_surrogate(unit: u16) -> bool {
    (0xD800..=0xDBFF).contains(&unit)
}

/// Serves [`MemoryRowSource`]s from seeded tables keyed by `db.schema.table`.
#[derive(Debug, Default)]
pub struct MemorySourceProvider {
    tables: HashMap<String, MemoryTable>,
}

impl MemorySourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_table(&mut self, database: &str, schema: &str, name: &str, table: MemoryTable) {
        self.tables
            .insert(format!("{}.{}.{}", database, schema, name).to_ascii_lowercase(), table);
    }
}

#[async_trait]
impl SourceProvider for MemorySourceProvider {
    async fn open(&self, table: &SourceTable) -> Result<Box<dyn RowSource>> {
        let key = format!("{}.{}.{}", table.database, table.schema, table.spec.name)
            .to_ascii_lowercase();
        let data = self.tables.get(&key).cloned().ok_or_else(|| {
            MigrateError::from_code(208, format!("Invalid object name '{}'.", key))
        })?;
        Ok(Box::new(MemoryRowSource::new(data, &table.spec)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> MemoryTable {
        MemoryTable::new(["DocumentID", "Body"]).with_rows(vec![
            vec![SqlValue::I64(1), SqlValue::Bytes(vec![1, 2, 3, 4, 5])],
            vec![SqlValue::I64(2), SqlValue::Null],
            vec![SqlValue::I64(3), SqlValue::Text("héllo".into())],
        ])
    }

    fn spec() -> TableSpec {
        TableSpec::new("Document")
            .with_key(&["DocumentID"])
            .with_lob_columns(&["Body"])
    }

    #[test]
    fn test_qualified_name() {
        let t = SourceTable::new("Justice", "dbo", TableSpec::new("Case"));
        assert_eq!(t.qualified().unwrap(), "[Justice].[dbo].[Case]");
    }

    #[tokio::test]
    async fn test_memory_source_batches_and_handles() {
        let mut source = MemoryRowSource::new(docs(), &spec()).unwrap();
        let first = source.fetch(2).await.unwrap();
        assert_eq!(first.len(), 2);
        match &first[0][1] {
            SqlValue::Lob(h) => {
                assert_eq!(h.length, 5);
                assert_eq!(h.kind, LobKind::Binary);
                assert_eq!(h.key, vec![SqlValue::I64(1)]);
            }
            other => panic!("expected handle, got {other:?}"),
        }
        assert_eq!(first[1][1], SqlValue::Null);

        let second = source.fetch(2).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(source.fetch(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_lob_chunks() {
        let mut source = MemoryRowSource::new(docs(), &spec()).unwrap();
        let rows = source.fetch(3).await.unwrap();
        let SqlValue::Lob(bin) = &rows[0][1] else { panic!("expected handle") };
        assert_eq!(
            source.read_lob_chunk(bin, 0, 2).await.unwrap(),
            Some(SqlValue::Bytes(vec![1, 2]))
        );
        assert_eq!(
            source.read_lob_chunk(bin, 4, 2).await.unwrap(),
            Some(SqlValue::Bytes(vec![5]))
        );
        assert_eq!(source.read_lob_chunk(bin, 5, 2).await.unwrap(), None);

        let SqlValue::Lob(text) = &rows[2][1] else { panic!("expected handle") };
        assert_eq!(text.length, 5);
        assert_eq!(
            source.read_lob_chunk(text, 1, 3).await.unwrap(),
            Some(SqlValue::Text("éll".into()))
        );
    }

    #[test]
    fn test_money_is_read_as_decimal() {
        assert_eq!(exact_money("money"), Some("DECIMAL(19,4)"));
        assert_eq!(exact_money("smallmoney"), Some("DECIMAL(10,4)"));
        assert_eq!(exact_money("decimal"), None);
    }

    #[tokio::test]
    async fn test_provider_missing_table() {
        let provider = MemorySourceProvider::new();
        let err = provider
            .open(&SourceTable::new("Justice", "dbo", TableSpec::new("Case")))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), Some(208));
    }

    #[tokio::test]
    async fn test_unknown_key_column() {
        let err = MemoryRowSource::new(docs(), &TableSpec::new("Document").with_key(&["Nope"]))
            .unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[tokio::test]
    async fn test_text_pieces_keep_surrogate_pairs_whole() {
        let table = MemoryTable::new(["DocumentID", "Body"])
            .with_rows(vec![vec![SqlValue::I64(1), SqlValue::Text("a😀b😀".into())]]);
        let mut source = MemoryRowSource::new(table, &spec()).unwrap();
        let rows = source.fetch(1).await.unwrap();
        let SqlValue::Lob(text) = &rows[0][1] else { panic!("expected handle") };
        assert_eq!(text.length, 6);

        let mut pieces = Vec::new();
        let mut offset = 0;
        while let Some(piece) = source.read_lob_chunk(text, offset, 2).await.unwrap() {
            offset += piece.lob_length().unwrap();
            pieces.push(piece);
        }
        assert_eq!(
            pieces,
            vec![
                SqlValue::Text("a".into()),
                SqlValue::Text("😀".into()),
                SqlValue::Text("b".into()),
                SqlValue::Text("😀".into()),
            ]
        );
        assert_eq!(offset, 6);
    }
}
