//! SQL value types moved between source and target.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a large object column carries bytes or characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LobKind {
    Binary,
    Text,
}

impl LobKind {
    /// The value written before any chunk is appended. `.WRITE` cannot
    /// append to NULL, so the row is inserted with an empty value first.
    pub fn empty_value(&self) -> SqlValue {
        match self {
            LobKind::Binary => SqlValue::Bytes(Vec::new()),
            LobKind::Text => SqlValue::Text(String::new()),
        }
    }

    /// Size in bytes of one unit of `length` (text is measured in UTF-16
    /// code units, the unit `DATALENGTH`/2 and `SUBSTRING` use).
    pub fn unit_width(&self) -> usize {
        match self {
            LobKind::Binary => 1,
            LobKind::Text => 2,
        }
    }
}

/// Reference to a large object still living in the source.
///
/// Row batches carry handles instead of the value so that a batch never
/// holds more than one chunk of any LOB in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct LobHandle {
    pub column: String,
    pub kind: LobKind,
    /// Key column values locating the row in both source and target.
    pub key: Vec<SqlValue>,
    /// Length in bytes (binary) or UTF-16 code units (text).
    pub length: u64,
}

/// SQL value for row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    /// Exact decimal, money and numeric values.
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Uuid(Uuid),
    /// Streamed large object; see [`LobHandle`].
    Lob(LobHandle),
}

/// A row is a vector of values in column order.
pub type Row = Vec<SqlValue>;

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I64(v) => Some(*v),
            SqlValue::F64(v) => Some(*v as i64),
            SqlValue::Decimal(d) => d.to_i64(),
            SqlValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Length in the unit `SUBSTRING` uses: bytes for binary, UTF-16 code
    /// units for text. A supplementary character counts as two.
    pub fn lob_length(&self) -> Option<u64> {
        match self {
            SqlValue::Bytes(b) => Some(b.len() as u64),
            SqlValue::Text(s) => Some(s.encode_utf16().count() as u64),
            _ => None,
        }
    }

    /// Stable byte encoding used for checksums.
    ///
    /// Each value is tagged so that e.g. `Null` and an empty string differ.
    pub fn checksum_bytes(&self, out: &mut Vec<u8>) {
        match self {
            SqlValue::Null => out.push(0),
            SqlValue::Bool(b) => {
                out.push(1);
                out.push(*b as u8);
            }
            SqlValue::I64(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_le_bytes());
            }
            SqlValue::F64(v) => {
                out.push(3);
                out.extend_from_slice(&v.to_le_bytes());
            }
            SqlValue::Decimal(d) => {
                out.push(9);
                out.extend_from_slice(d.normalize().to_string().as_bytes());
            }
            SqlValue::Time(t) => {
                out.push(10);
                out.extend_from_slice(t.to_string().as_bytes());
            }
            SqlValue::DateTimeOffset(dt) => {
                out.push(11);
                out.extend_from_slice(dt.to_rfc3339().as_bytes());
            }
            SqlValue::Text(s) => {
                out.push(4);
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            SqlValue::Bytes(b) => {
                out.push(5);
                out.extend_from_slice(&(b.len() as u64).to_le_bytes());
                out.extend_from_slice(b);
            }
            SqlValue::DateTime(dt) => {
                out.push(6);
                out.extend_from_slice(dt.to_string().as_bytes());
            }
            SqlValue::Uuid(u) => {
                out.push(7);
                out.extend_from_slice(u.as_bytes());
            }
            SqlValue::Lob(handle) => {
                out.push(8);
                out.extend_from_slice(&handle.length.to_le_bytes());
            }
        }
    }

    /// Ordering used for key sorting; values of different kinds compare equal.
    pub fn sort_cmp(&self, other: &SqlValue) -> Ordering {
        match (self, other) {
            (SqlValue::Null, SqlValue::Null) => Ordering::Equal,
            (SqlValue::Null, _) => Ordering::Less,
            (_, SqlValue::Null) => Ordering::Greater,
            (SqlValue::I64(a), SqlValue::I64(b)) => a.cmp(b),
            (SqlValue::F64(a), SqlValue::F64(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (SqlValue::Decimal(a), SqlValue::Decimal(b)) => a.cmp(b),
            (SqlValue::Time(a), SqlValue::Time(b)) => a.cmp(b),
            (SqlValue::DateTimeOffset(a), SqlValue::DateTimeOffset(b)) => a.cmp(b),
            (SqlValue::Text(a), SqlValue::Text(b)) => a.cmp(b),
            (SqlValue::Bytes(a), SqlValue::Bytes(b)) => a.cmp(b),
            (SqlValue::DateTime(a), SqlValue::DateTime(b)) => a.cmp(b),
            (SqlValue::Uuid(a), SqlValue::Uuid(b)) => a.cmp(b),
            (SqlValue::Bool(a), SqlValue::Bool(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}
