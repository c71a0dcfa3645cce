//! Placeholder parsing and rendering.
//!
//! `${NAME}` substitutes the raw value, `${NAME:q}` substitutes it in
//! brackets. Any other `${...}` token is an error at render time. Values are
//! sanitized and then validated as identifiers before they are embedded, so
//! a rendered script never carries a caller string that failed those checks.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::core::identifier::{quote_mssql, validate_identifier};
use crate::core::sanitize;
use crate::error::{MigrateError, Result};

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^{}]*?)(:q)?\}").expect("placeholder pattern is valid")
    })
}

/// Values available to templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderParams {
    /// `TARGET_DB` (legacy alias `DB_NAME`).
    pub target_db: Option<String>,
    /// `SCHEMA`
    pub schema: Option<String>,
    /// `SOURCE_DB`
    pub source_qualifier: Option<String>,
    /// `TABLE`, supplied by the orchestrator.
    pub table: Option<String>,
}

impl RenderParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_db(mut self, value: impl Into<String>) -> Self {
        self.target_db = Some(value.into());
        self
    }

    pub fn schema(mut self, value: impl Into<String>) -> Self {
        self.schema = Some(value.into());
        self
    }

    pub fn source_qualifier(mut self, value: impl Into<String>) -> Self {
        self.source_qualifier = Some(value.into());
        self
    }

    pub fn table(mut self, value: impl Into<String>) -> Self {
        self.table = Some(value.into());
        self
    }

    /// Value for a placeholder name, if one was supplied.
    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            "TARGET_DB" | "DB_NAME" => self.target_db.as_deref(),
            "SCHEMA" => self.schema.as_deref(),
            "SOURCE_DB" => self.source_qualifier.as_deref(),
            "TABLE" => self.table.as_deref(),
            _ => None,
        }
    }
}

/// Raw SQL text plus the placeholders it requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTemplate {
    name: String,
    text: String,
    placeholders: BTreeSet<String>,
}

impl ScriptTemplate {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let placeholders = placeholder_pattern()
            .captures_iter(&text)
            .map(|c| c[1].to_string())
            .collect();
        Self {
            name: name.into(),
            text,
            placeholders,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn placeholders(&self) -> &BTreeSet<String> {
        &self.placeholders
    }

    /// Substitute every placeholder.
    ///
    /// Fails with `MissingPlaceholder` when a name is unknown or has no
    /// value, with `InjectionSuspected` when a value carries a terminator,
    /// comment or control character, and with `InvalidIdentifier` otherwise.
    pub fn render(&self, params: &RenderParams) -> Result<String> {
        let mut values: HashMap<&str, &str> = HashMap::new();
        for name in &self.placeholders {
            let value = params
                .get(name)
                .ok_or_else(|| MigrateError::MissingPlaceholder {
                    template: self.name.clone(),
                    placeholder: name.clone(),
                })?;
            sanitize::check_value(value)?;
            validate_identifier(value)?;
            values.insert(name.as_str(), value);
        }

        let mut quoted: HashMap<&str, String> = HashMap::new();
        for (name, value) in &values {
            quoted.insert(*name, quote_mssql(value)?);
        }

        let rendered = placeholder_pattern().replace_all(&self.text, |caps: &Captures<'_>| {
            let name = &caps[1];
            if caps.get(2).is_some() {
                quoted.get(name).cloned().unwrap_or_default()
            } else {
                values.get(name).map(|v| v.to_string()).unwrap_or_default()
            }
        });

        Ok(rendered.into_owned())
    }
}
