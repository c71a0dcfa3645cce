//! SQL Server connections over tiberius, pooled through bb8.

use std::borrow::Cow;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tiberius::numeric::Numeric;
use tiberius::xml::XmlData;
use tiberius::{
    AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query, TokenRow,
};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use super::Connection;
use crate::config::TargetConfig;
use crate::core::identifier::quote_column_list;
use crate::core::value::{Row, SqlValue};
use crate::error::{MigrateError, Result};

/// SQL Server accepts at most 2100 parameters per request.
const MAX_PARAMS_PER_STATEMENT: usize = 2000;

/// Row value constructors allowed in one `INSERT ... VALUES`.
const MAX_ROWS_PER_STATEMENT: usize = 1000;

/// Largest scale `rust_decimal` represents.
const MAX_DECIMAL_SCALE: u8 = 28;

/// Days from 0001-01-01 to 1900-01-01, the epoch of `datetime`.
const DAYS_TO_1900: i32 = 693_595;

impl From<tiberius::error::Error> for MigrateError {
    fn from(err: tiberius::error::Error) -> Self {
        match &err {
            tiberius::error::Error::Server(token) => {
                MigrateError::from_code(token.code() as i32, token.message().to_string())
            }
            tiberius::error::Error::Io { .. } | tiberius::error::Error::Routing { .. } => {
                MigrateError::ConnectionLost(err.to_string())
            }
            _ => MigrateError::PermanentDatabase {
                code: None,
                message: err.to_string(),
            },
        }
    }
}

/// A pooled client plus whether it can still be trusted.
///
/// A session is marked broken when a request was abandoned mid-stream; the
/// pool discards it instead of handing it out again.
pub struct TargetSession {
    client: Client<Compat<TcpStream>>,
    broken: bool,
}

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: TargetConfig,
}

impl TiberiusConnectionManager {
    fn new(config: TargetConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));

        if self.config.encrypt {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = TargetSession;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        let client = Client::connect(config, tcp.compat_write()).await?;
        Ok(TargetSession {
            client,
            broken: false,
        })
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.broken
    }
}

/// Hands out pooled SQL Server sessions.
///
/// The run's target session and every source cursor come from the same
/// pool; source databases are addressed by three-part names.
#[derive(Clone)]
pub struct ConnectionProvider {
    pool: Pool<TiberiusConnectionManager>,
    config: TargetConfig,
}

impl ConnectionProvider {
    /// Build the pool and prove it with one round trip.
    pub async fn new(config: &TargetConfig) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .min_idle(Some(1))
            .build(manager)
            .await
            .map_err(|e| {
                MigrateError::pool(e.to_string(), format!("creating pool for {}", config.host))
            })?;

        let provider = Self {
            pool,
            config: config.clone(),
        };

        let mut conn = provider.connect().await?;
        conn.ping().await?;

        info!(
            "Connected to SQL Server: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(provider)
    }

    /// Check out a session. It returns to the pool when dropped.
    pub async fn connect(&self) -> Result<MssqlConnection> {
        let session = self.pool.get_owned().await.map_err(|e| {
            MigrateError::pool(
                e.to_string(),
                format!("getting connection to {}", self.config.database),
            )
        })?;
        Ok(MssqlConnection {
            session,
            autocommit: true,
        })
    }

    /// Round-trip latency of `SELECT 1` on a fresh checkout.
    pub async fn health_check(&self) -> Result<Duration> {
        let started = Instant::now();
        let mut conn = self.connect().await?;
        conn.ping().await?;
        Ok(started.elapsed())
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }
}

/// A pooled tiberius session.
pub struct MssqlConnection {
    session: PooledConnection<'static, TiberiusConnectionManager>,
    autocommit: bool,
}

impl MssqlConnection {
    fn client(&mut self) -> Result<&mut Client<Compat<TcpStream>>> {
        if self.session.broken {
            return Err(MigrateError::ConnectionLost(
                "session was discarded after an abandoned request".to_string(),
            ));
        }
        Ok(&mut self.session.client)
    }

    async fn run_batch(&mut self, sql: &str) -> Result<Vec<Vec<tiberius::Row>>> {
        let stream = self.client()?.simple_query(sql).await?;
        Ok(stream.into_results().await?)
    }

    /// Updateable columns of `table` in table order, as the bulk load
    /// stream expects them.
    async fn describe_target(&mut self, table: &str) -> Result<Vec<BulkColumn>> {
        let rows = self
            .query(
                "SELECT name, system_type_name, is_updateable \
                 FROM sys.dm_exec_describe_first_result_set(@P1, NULL, 0) \
                 ORDER BY column_ordinal",
                &[SqlValue::Text(format!("SELECT * FROM {}", table))],
            )
            .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let (Some(SqlValue::Text(name)), Some(SqlValue::Text(type_name))) =
                (row.first(), row.get(1))
            else {
                continue;
            };
            if matches!(row.get(2), Some(SqlValue::Bool(false))) {
                continue;
            }
            columns.push(BulkColumn {
                name: name.clone(),
                ty: BulkType::parse(type_name),
            });
        }
        Ok(columns)
    }

    async fn send_bulk(
        &mut self,
        table: &str,
        plan: &[(BulkType, Option<usize>)],
        rows: &[Row],
    ) -> Result<u64> {
        let mut request = self.client()?.bulk_insert(table).await?;
        for row in rows {
            let mut token_row = TokenRow::new();
            for (ty, source) in plan {
                let value = source.and_then(|i| row.get(i)).unwrap_or(&SqlValue::Null);
                token_row.push(ty.encode(value)?);
            }
            request.send(token_row).await?;
        }
        let result = request.finalize().await?;
        Ok(result.total())
    }

    /// Parameterized multi-row INSERTs, for targets the bulk stream cannot
    /// encode.
    async fn insert_statements(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(rows_per_statement(columns.len())) {
            let sql = insert_sql(table, columns, chunk.len())?;
            let params: Vec<SqlValue> = chunk.iter().flatten().cloned().collect();
            inserted += self.execute(&sql, &params).await?;
        }
        Ok(inserted)
    }
}

/// Rows per INSERT statement given the column count.
fn rows_per_statement(columns: usize) -> usize {
    (MAX_PARAMS_PER_STATEMENT / columns.max(1)).clamp(1, MAX_ROWS_PER_STATEMENT)
}

/// `INSERT INTO t ([a], [b]) VALUES (@P1, @P2), (@P3, @P4)`
fn insert_sql(table: &str, columns: &[String], rows: usize) -> Result<String> {
    let width = columns.len();
    let values: Vec<String> = (0..rows)
        .map(|r| {
            let params: Vec<String> = (1..=width).map(|c| format!("@P{}", r * width + c)).collect();
            format!("({})", params.join(", "))
        })
        .collect();
    Ok(format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        quote_column_list(columns)?,
        values.join(", ")
    ))
}

/// A target column the bulk stream will carry.
#[derive(Debug, Clone, PartialEq)]
struct BulkColumn {
    name: String,
    /// `None` when the bulk encoder has no representation for the type.
    ty: Option<BulkType>,
}

/// Declared type of a target column, as far as bulk encoding cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkType {
    Bit,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Real,
    Float,
    Decimal { scale: u8 },
    Text,
    Binary,
    Guid,
    Xml,
    Date,
    Time { scale: u8 },
    DateTime,
    SmallDateTime,
    DateTime2 { scale: u8 },
    DateTimeOffset { scale: u8 },
}

impl BulkType {
    /// Parse a `system_type_name` such as `decimal(18,4)` or `nvarchar(max)`.
    /// Money, legacy text and CLR types have no bulk encoding and give `None`.
    fn parse(type_name: &str) -> Option<Self> {
        let lower = type_name.trim().to_ascii_lowercase();
        let (base, args) = match lower.split_once('(') {
            Some((base, rest)) => (
                base.trim(),
                rest.trim_end_matches(')')
                    .split(',')
                    .map(|a| a.trim().parse::<u8>().ok())
                    .collect::<Vec<_>>(),
            ),
            None => (lower.as_str(), Vec::new()),
        };
        let arg = |i: usize, default: u8| args.get(i).copied().flatten().unwrap_or(default);
        let fraction = |default: u8| Some(arg(0, default)).filter(|s| *s <= 7);

        Some(match base {
            "bit" => BulkType::Bit,
            "tinyint" => BulkType::TinyInt,
            "smallint" => BulkType::SmallInt,
            "int" => BulkType::Int,
            "bigint" => BulkType::BigInt,
            "real" => BulkType::Real,
            "float" => BulkType::Float,
            "decimal" | "numeric" => {
                let scale = arg(1, 0);
                if scale > MAX_DECIMAL_SCALE {
                    return None;
                }
                BulkType::Decimal { scale }
            }
            "char" | "varchar" | "nchar" | "nvarchar" => BulkType::Text,
            "binary" | "varbinary" => BulkType::Binary,
            "uniqueidentifier" => BulkType::Guid,
            "xml" => BulkType::Xml,
            "date" => BulkType::Date,
            "time" => BulkType::Time {
                scale: fraction(7)?,
            },
            "datetime" => BulkType::DateTime,
            "smalldatetime" => BulkType::SmallDateTime,
            "datetime2" => BulkType::DateTime2 {
                scale: fraction(7)?,
            },
            "datetimeoffset" => BulkType::DateTimeOffset {
                scale: fraction(7)?,
            },
            _ => return None,
        })
    }

    fn null(self) -> ColumnData<'static> {
        match self {
            BulkType::Bit => ColumnData::Bit(None),
            BulkType::TinyInt => ColumnData::U8(None),
            BulkType::SmallInt => ColumnData::I16(None),
            BulkType::Int => ColumnData::I32(None),
            BulkType::BigInt => ColumnData::I64(None),
            BulkType::Real => ColumnData::F32(None),
            BulkType::Float => ColumnData::F64(None),
            BulkType::Decimal { .. } => ColumnData::Numeric(None),
            BulkType::Text => ColumnData::String(None),
            BulkType::Binary => ColumnData::Binary(None),
            BulkType::Guid => ColumnData::Guid(None),
            BulkType::Xml => ColumnData::Xml(None),
            BulkType::Date => ColumnData::Date(None),
            BulkType::Time { .. } => ColumnData::Time(None),
            BulkType::DateTime => ColumnData::DateTime(None),
            BulkType::SmallDateTime => ColumnData::SmallDateTime(None),
            BulkType::DateTime2 { .. } => ColumnData::DateTime2(None),
            BulkType::DateTimeOffset { .. } => ColumnData::DateTimeOffset(None),
        }
    }

    /// Encode `value` for a column of this type. LOB handles become the
    /// empty value their chunks are appended to.
    fn encode(self, value: &SqlValue) -> Result<ColumnData<'static>> {
        if let SqlValue::Lob(handle) = value {
            return self.encode(&handle.kind.empty_value());
        }
        if value.is_null() {
            return Ok(self.null());
        }
        let mismatch = || {
            MigrateError::Conversion(format!(
                "cannot bulk load a {} value into a {:?} column",
                value_kind(value),
                self
            ))
        };

        Ok(match self {
            BulkType::Bit => ColumnData::Bit(Some(match value {
                SqlValue::Bool(b) => *b,
                SqlValue::I64(v) => *v != 0,
                _ => return Err(mismatch()),
            })),
            BulkType::TinyInt => {
                ColumnData::U8(Some(whole(value).and_then(|v| u8::try_from(v).ok()).ok_or_else(mismatch)?))
            }
            BulkType::SmallInt => {
                ColumnData::I16(Some(whole(value).and_then(|v| i16::try_from(v).ok()).ok_or_else(mismatch)?))
            }
            BulkType::Int => {
                ColumnData::I32(Some(whole(value).and_then(|v| i32::try_from(v).ok()).ok_or_else(mismatch)?))
            }
            BulkType::BigInt => ColumnData::I64(Some(whole(value).ok_or_else(mismatch)?)),
            BulkType::Real => ColumnData::F32(Some(float(value).ok_or_else(mismatch)? as f32)),
            BulkType::Float => ColumnData::F64(Some(float(value).ok_or_else(mismatch)?)),
            BulkType::Decimal { scale } => {
                let mut d = exact(value).ok_or_else(mismatch)?;
                d.rescale(u32::from(scale));
                if d.scale() != u32::from(scale) {
                    return Err(mismatch());
                }
                ColumnData::Numeric(Some(Numeric::new_with_scale(d.mantissa(), scale)))
            }
            BulkType::Text => ColumnData::String(Some(Cow::Owned(match value {
                SqlValue::Text(s) => s.clone(),
                SqlValue::I64(v) => v.to_string(),
                SqlValue::F64(v) => v.to_string(),
                SqlValue::Decimal(d) => d.to_string(),
                SqlValue::Uuid(u) => u.to_string(),
                _ => return Err(mismatch()),
            }))),
            BulkType::Binary => match value {
                SqlValue::Bytes(b) => ColumnData::Binary(Some(Cow::Owned(b.clone()))),
                _ => return Err(mismatch()),
            },
            BulkType::Guid => ColumnData::Guid(Some(match value {
                SqlValue::Uuid(u) => *u,
                SqlValue::Text(s) => uuid::Uuid::parse_str(s).map_err(|_| mismatch())?,
                _ => return Err(mismatch()),
            })),
            BulkType::Xml => match value {
                SqlValue::Text(s) => ColumnData::Xml(Some(Cow::Owned(XmlData::new(s)))),
                _ => return Err(mismatch()),
            },
            BulkType::Date => {
                let date = naive(value).ok_or_else(mismatch)?.date();
                ColumnData::Date(Some(tds_date(date).ok_or_else(mismatch)?))
            }
            BulkType::Time { scale } => {
                let time = match value {
                    SqlValue::Time(t) => *t,
                    _ => naive(value).ok_or_else(mismatch)?.time(),
                };
                ColumnData::Time(Some(tds_time(time, scale)))
            }
            BulkType::DateTime => {
                let dt = naive(value).ok_or_else(mismatch)?;
                let days = dt.date().num_days_from_ce() - 1 - DAYS_TO_1900;
                let nanos = nanos_of_day(dt.time());
                ColumnData::DateTime(Some(tiberius::time::DateTime::new(
                    days,
                    (nanos * 3 / 10_000_000) as u32,
                )))
            }
            BulkType::SmallDateTime => {
                let dt = naive(value).ok_or_else(mismatch)?;
                let days = u16::try_from(dt.date().num_days_from_ce() - 1 - DAYS_TO_1900)
                    .map_err(|_| mismatch())?;
                let minutes = (dt.time().num_seconds_from_midnight() / 60) as u16;
                ColumnData::SmallDateTime(Some(tiberius::time::SmallDateTime::new(days, minutes)))
            }
            BulkType::DateTime2 { scale } => {
                let dt = naive(value).ok_or_else(mismatch)?;
                ColumnData::DateTime2(Some(tds_datetime2(dt, scale).ok_or_else(mismatch)?))
            }
            BulkType::DateTimeOffset { scale } => {
                let (utc, offset) = match value {
                    SqlValue::DateTimeOffset(dto) => {
                        (dto.naive_utc(), (dto.offset().local_minus_utc() / 60) as i16)
                    }
                    SqlValue::DateTime(dt) => (*dt, 0),
                    _ => return Err(mismatch()),
                };
                let dt2 = tds_datetime2(utc, scale).ok_or_else(mismatch)?;
                ColumnData::DateTimeOffset(Some(tiberius::time::DateTimeOffset::new(dt2, offset)))
            }
        })
    }
}

/// Map each target column to its position in the source row. `None` when
/// a type has no bulk encoding or a source column has no updateable target.
fn bulk_plan(target: &[BulkColumn], columns: &[String]) -> Option<Vec<(BulkType, Option<usize>)>> {
    let mut plan = Vec::with_capacity(target.len());
    let mut mapped = 0;
    for column in target {
        let source = columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(&column.name));
        if source.is_some() {
            mapped += 1;
        }
        plan.push((column.ty?, source));
    }
    (mapped == columns.len()).then_some(plan)
}

fn value_kind(value: &SqlValue) -> &'static str {
    match value {
        SqlValue::Null => "null",
        SqlValue::Bool(_) => "bit",
        SqlValue::I64(_) => "integer",
        SqlValue::F64(_) => "float",
        SqlValue::Decimal(_) => "decimal",
        SqlValue::Text(_) => "text",
        SqlValue::Bytes(_) => "binary",
        SqlValue::DateTime(_) => "datetime",
        SqlValue::Time(_) => "time",
        SqlValue::DateTimeOffset(_) => "datetimeoffset",
        SqlValue::Uuid(_) => "uniqueidentifier",
        SqlValue::Lob(_) => "lob",
    }
}

fn whole(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::I64(v) => Some(*v),
        SqlValue::Bool(b) => Some(*b as i64),
        SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
        _ => None,
    }
}

fn float(value: &SqlValue) -> Option<f64> {
    match value {
        SqlValue::F64(v) => Some(*v),
        SqlValue::I64(v) => Some(*v as f64),
        SqlValue::Decimal(d) => d.to_f64(),
        _ => None,
    }
}

fn exact(value: &SqlValue) -> Option<Decimal> {
    match value {
        SqlValue::Decimal(d) => Some(*d),
        SqlValue::I64(v) => Some(Decimal::from(*v)),
        SqlValue::F64(v) => Decimal::from_f64(*v),
        _ => None,
    }
}

fn naive(value: &SqlValue) -> Option<NaiveDateTime> {
    match value {
        SqlValue::DateTime(dt) => Some(*dt),
        SqlValue::DateTimeOffset(dto) => Some(dto.naive_local()),
        _ => None,
    }
}

fn nanos_of_day(time: NaiveTime) -> u64 {
    time.num_seconds_from_midnight() as u64 * 1_000_000_000
        + u64::from(time.nanosecond().min(999_999_999))
}

fn tds_time(time: NaiveTime, scale: u8) -> tiberius::time::Time {
    let increments = nanos_of_day(time) / 10u64.pow(9 - u32::from(scale));
    tiberius::time::Time::new(increments, scale)
}

fn tds_date(date: NaiveDate) -> Option<tiberius::time::Date> {
    u32::try_from(date.num_days_from_ce() - 1)
        .ok()
        .map(tiberius::time::Date::new)
}

fn tds_datetime2(dt: NaiveDateTime, scale: u8) -> Option<tiberius::time::DateTime2> {
    Some(tiberius::time::DateTime2::new(
        tds_date(dt.date())?,
        tds_time(dt.time(), scale),
    ))
}

fn numeric(d: &Decimal) -> Numeric {
    Numeric::new_with_scale(d.mantissa(), d.scale() as u8)
}

fn bind_value<'a>(query: &mut Query<'a>, value: &SqlValue) {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::I64(v) => query.bind(*v),
        SqlValue::F64(v) => query.bind(*v),
        SqlValue::Decimal(v) => query.bind(numeric(v)),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Bytes(v) => query.bind(v.clone()),
        SqlValue::DateTime(v) => query.bind(*v),
        SqlValue::Time(v) => query.bind(*v),
        SqlValue::DateTimeOffset(v) => query.bind(*v),
        SqlValue::Uuid(v) => query.bind(*v),
        SqlValue::Lob(handle) => bind_value(query, &handle.kind.empty_value()),
    }
}

fn chrono_cell<T>(data: &ColumnData<'static>) -> Result<Option<T>>
where
    T: for<'a> FromSql<'a>,
{
    T::from_sql(data).map_err(|e| MigrateError::Conversion(e.to_string()))
}

/// Convert one cell. Every value keeps its exact meaning; anything that
/// cannot be represented is an error rather than NULL.
fn convert_cell(data: ColumnData<'static>) -> Result<SqlValue> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| SqlValue::I64(v as i64)),
        ColumnData::I16(v) => v.map(|v| SqlValue::I64(v as i64)),
        ColumnData::I32(v) => v.map(|v| SqlValue::I64(v as i64)),
        ColumnData::I64(v) => v.map(SqlValue::I64),
        ColumnData::F32(v) => v.map(|v| SqlValue::F64(v as f64)),
        ColumnData::F64(v) => v.map(SqlValue::F64),
        ColumnData::Bit(v) => v.map(SqlValue::Bool),
        ColumnData::String(v) => v.map(|s| SqlValue::Text(s.into_owned())),
        ColumnData::Binary(v) => v.map(|b| SqlValue::Bytes(b.into_owned())),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid),
        ColumnData::Xml(v) => v.map(|x| SqlValue::Text(x.into_owned().into_string())),
        ColumnData::Numeric(v) => match v {
            Some(n) => Some(SqlValue::Decimal(
                Decimal::try_from_i128_with_scale(n.value(), u32::from(n.scale())).map_err(
                    |e| {
                        MigrateError::Conversion(format!(
                            "numeric {} with scale {} does not fit: {}",
                            n.value(),
                            n.scale(),
                            e
                        ))
                    },
                )?,
            )),
            None => None,
        },
        other @ ColumnData::Time(_) => chrono_cell::<NaiveTime>(&other)?.map(SqlValue::Time),
        other @ ColumnData::DateTimeOffset(_) => {
            chrono_cell::<DateTime<FixedOffset>>(&other)?.map(SqlValue::DateTimeOffset)
        }
        other @ (ColumnData::DateTime(_)
        | ColumnData::SmallDateTime(_)
        | ColumnData::DateTime2(_)) => {
            chrono_cell::<NaiveDateTime>(&other)?.map(SqlValue::DateTime)
        }
        other @ ColumnData::Date(_) => chrono_cell::<NaiveDate>(&other)?
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(SqlValue::DateTime),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

fn convert_row(row: tiberius::Row) -> Result<Row> {
    row.into_iter().map(convert_cell).collect()
}

#[async_trait]
impl Connection for MssqlConnection {
    fn autocommit(&self) -> bool {
        self.autocommit
    }

    async fn set_autocommit(&mut self, enabled: bool) -> Result<()> {
        let sql = if enabled {
            "SET IMPLICIT_TRANSACTIONS OFF"
        } else {
            "SET IMPLICIT_TRANSACTIONS ON"
        };
        self.run_batch(sql).await?;
        self.autocommit = enabled;
        Ok(())
    }

    async fn set_statement_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let ms = timeout.map(|t| t.as_millis() as i64).unwrap_or(-1);
        self.run_batch(&format!("SET LOCK_TIMEOUT {}", ms)).await?;
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let mut query = Query::new(sql);
        for param in params {
            bind_value(&mut query, param);
        }
        let result = query.execute(self.client()?).await?;
        Ok(result.rows_affected().iter().sum())
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut query = Query::new(sql);
        for param in params {
            bind_value(&mut query, param);
        }
        let rows = query.query(self.client()?).await?.into_first_result().await?;
        rows.into_iter().map(convert_row).collect()
    }

    async fn simple_query(&mut self, sql: &str) -> Result<Vec<Row>> {
        let results = self.run_batch(sql).await?;
        let last = results.into_iter().rev().find(|set| !set.is_empty());
        last.map(|set| set.into_iter().map(convert_row).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn bulk_insert(&mut self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let target = self.describe_target(table).await?;
        match bulk_plan(&target, columns) {
            Some(plan) => self.send_bulk(table, &plan, rows).await,
            None => {
                debug!(table, "target layout has no bulk encoding, using INSERT statements");
                self.insert_statements(table, columns, rows).await
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        debug!("commit");
        self.run_batch("IF @@TRANCOUNT > 0 COMMIT TRANSACTION").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        debug!("rollback");
        self.run_batch("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await?;
        Ok(())
    }

    fn mark_broken(&mut self) {
        if !self.session.broken {
            warn!("discarding SQL Server session");
        }
        self.session.broken = true;
    }

    fn is_broken(&self) -> bool {
        self.session.broken
    }

    fn db_type(&self) -> &'static str {
        "mssql"
    }
}
