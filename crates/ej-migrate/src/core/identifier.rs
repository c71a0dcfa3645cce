//! Identifier validation and quoting for SQL Server.
//!
//! Identifiers (database, schema, table and column names) cannot be sent as
//! bound parameters, so every identifier that reaches SQL text goes through
//! this module first. Validation is strict: a leading letter or underscore
//! followed by letters, digits or underscores. Anything else, including
//! names that would be legal inside brackets, is rejected so that a value
//! can be embedded raw as well as quoted.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{MigrateError, Result};

/// SQL Server's sysname limit.
const MAX_IDENTIFIER_LENGTH: usize = 128;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
    })
}

/// Validate an identifier.
///
/// Rejects empty names, null bytes, names longer than 128 characters and
/// anything outside `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::InvalidIdentifier(
            "identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::InvalidIdentifier(format!(
            "SECURITY: identifier contains null byte: {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::InvalidIdentifier(format!(
            "identifier exceeds {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    if !identifier_pattern().is_match(name) {
        return Err(MigrateError::InvalidIdentifier(format!(
            "{:?} must start with a letter or underscore and contain only letters, digits and underscores",
            name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
///
/// ```ignore
/// assert_eq!(quote_mssql("Case")?, "[Case]");
/// ```
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// `[schema].[table]`
pub fn qualify_mssql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mssql(schema)?, quote_mssql(table)?))
}

/// `[database].[schema].[table]`
pub fn qualify_three_part(database: &str, schema: &str, table: &str) -> Result<String> {
    Ok(format!(
        "{}.{}",
        quote_mssql(database)?,
        qualify_mssql(schema, table)?
    ))
}

/// Quote a list of column names and join them with `, `.
pub fn quote_column_list(columns: &[String]) -> Result<String> {
    let quoted = columns
        .iter()
        .map(|c| quote_mssql(c))
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}
