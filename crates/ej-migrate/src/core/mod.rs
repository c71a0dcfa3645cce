//! Building blocks shared by every layer: identifier handling, the SQL
//! sanitizer and the value model.

pub mod identifier;
pub mod sanitize;
pub mod value;

pub use identifier::{qualify_mssql, qualify_three_part, quote_column_list, quote_mssql, validate_identifier};
pub use value::{LobHandle, LobKind, Row, SqlValue};
