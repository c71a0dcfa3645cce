//! Per-domain table manifest (`<domain>/tables.yaml`).

use serde::{Deserialize, Serialize};

use crate::core::identifier::validate_identifier;
use crate::error::{MigrateError, Result};

/// One table a domain migrates, in manifest order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,

    /// Overrides `migration.schema`.
    #[serde(default)]
    pub schema: Option<String>,

    /// Key columns. Required for paging and for streamed LOB columns.
    #[serde(default)]
    pub key: Vec<String>,

    /// Columns streamed in chunks instead of fetched with the row.
    #[serde(default)]
    pub lob_columns: Vec<String>,

    /// Migrate even when the scope count is zero.
    #[serde(default)]
    pub always_process: bool,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            key: Vec::new(),
            lob_columns: Vec::new(),
            always_process: false,
        }
    }

    pub fn with_key(mut self, key: &[&str]) -> Self {
        self.key = key.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_lob_columns(mut self, columns: &[&str]) -> Self {
        self.lob_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn always_process(mut self) -> Self {
        self.always_process = true;
        self
    }

    pub fn schema_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.schema.as_deref().unwrap_or(default)
    }

    pub fn has_lob_columns(&self) -> bool {
        !self.lob_columns.is_empty()
    }

    pub fn is_lob_column(&self, column: &str) -> bool {
        self.lob_columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }

    /// Every name must be an identifier, and LOB tables need a key.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)?;
        if let Some(schema) = &self.schema {
            validate_identifier(schema)?;
        }
        for column in self.key.iter().chain(self.lob_columns.iter()) {
            validate_identifier(column)?;
        }
        if self.has_lob_columns() && self.key.is_empty() {
            return Err(MigrateError::Config(format!(
                "table {} has lob_columns but no key",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    tables: Vec<TableSpec>,
}

/// Parse and validate a manifest document.
pub fn parse_manifest(yaml: &str) -> Result<Vec<TableSpec>> {
    let manifest: Manifest = serde_yaml::from_str(yaml)?;
    for table in &manifest.tables {
        table.validate()?;
    }
    Ok(manifest.tables)
}
