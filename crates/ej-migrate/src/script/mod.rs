//! Script template store.
//!
//! Templates are keyed by (domain, phase, table-or-global). On disk, under
//! the script root:
//!
//! ```text
//! <domain>/tables.yaml                  table manifest
//! <domain>/<phase>.sql                  global template for a phase
//! <domain>/<phase>/<table>.sql          table-specific template
//! <domain>/prepare/<step>.sql           preprocessing step
//! ```
//!
//! The directory is indexed once at load. Lookups only consult the index,
//! so a table name never becomes part of a file path.

mod manifest;
mod split;
mod template;

pub use manifest::{parse_manifest, TableSpec};
pub use split::split_batches;
pub use template::{RenderParams, ScriptTemplate};

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::identifier::validate_identifier;
use crate::error::{MigrateError, Result};
use crate::orchestrator::Domain;

/// Which part of a migration a template belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    GatherIdentifiers,
    DropConstraints,
    CopyData,
    RecreateConstraints,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Prepare,
        Phase::GatherIdentifiers,
        Phase::DropConstraints,
        Phase::CopyData,
        Phase::RecreateConstraints,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::GatherIdentifiers => "gather_identifiers",
            Phase::DropConstraints => "drop_constraints",
            Phase::CopyData => "copy_data",
            Phase::RecreateConstraints => "recreate_constraints",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Phase::ALL
            .into_iter()
            .find(|p| p.dir_name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TemplateKey {
    domain: Domain,
    phase: Phase,
    table: Option<String>,
}

impl TemplateKey {
    fn new(domain: Domain, phase: Phase, table: Option<&str>) -> Self {
        Self {
            domain,
            phase,
            table: table.map(|t| t.to_ascii_lowercase()),
        }
    }
}

/// Read-only (after load) index of templates and table manifests.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<TemplateKey, ScriptTemplate>,
    tables: HashMap<Domain, Vec<TableSpec>>,
}

impl TemplateStore {
    /// Empty store, for bundled templates and tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a script directory.
    pub fn load_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(MigrateError::Config(format!(
                "script directory {} does not exist",
                root.display()
            )));
        }

        let mut store = Self::new();
        for domain in Domain::ALL {
            let dir = root.join(domain.key());
            if !dir.is_dir() {
                debug!("No script directory for {}", domain);
                continue;
            }

            let manifest = dir.join("tables.yaml");
            if manifest.is_file() {
                let tables = parse_manifest(&std::fs::read_to_string(&manifest)?)?;
                store.tables.insert(domain, tables);
            }

            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    let Some(phase) = file_stem(&path).and_then(Phase::from_dir_name) else {
                        warn!("Ignoring unknown phase directory {}", path.display());
                        continue;
                    };
                    for inner in std::fs::read_dir(&path)? {
                        let file = inner?.path();
                        if !is_sql(&file) {
                            continue;
                        }
                        if let Some(table) = file_stem(&file) {
                            let text = std::fs::read_to_string(&file)?;
                            store.insert(domain, phase, Some(table), &text)?;
                        }
                    }
                } else if is_sql(&path) {
                    match file_stem(&path).and_then(Phase::from_dir_name) {
                        Some(phase) => {
                            let text = std::fs::read_to_string(&path)?;
                            store.insert(domain, phase, None, &text)?;
                        }
                        None => warn!("Ignoring unknown template {}", path.display()),
                    }
                }
            }
        }

        info!(
            "Loaded {} templates for {} domains from {}",
            store.templates.len(),
            store.tables.len(),
            root.display()
        );
        Ok(store)
    }

    /// Register a template. `table` of `None` registers the global one.
    pub fn insert(
        &mut self,
        domain: Domain,
        phase: Phase,
        table: Option<&str>,
        text: &str,
    ) -> Result<()> {
        if let Some(table) = table {
            validate_identifier(table)?;
        }
        let name = template_name(domain, phase, table);
        self.templates.insert(
            TemplateKey::new(domain, phase, table),
            ScriptTemplate::new(name, text),
        );
        Ok(())
    }

    /// Set a domain's table list, in migration order.
    pub fn set_tables(&mut self, domain: Domain, tables: Vec<TableSpec>) -> Result<()> {
        for table in &tables {
            table.validate()?;
        }
        self.tables.insert(domain, tables);
        Ok(())
    }

    pub fn tables(&self, domain: Domain) -> &[TableSpec] {
        self.tables.get(&domain).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Table-specific template, falling back to the global one.
    pub fn resolve(
        &self,
        domain: Domain,
        phase: Phase,
        table: Option<&str>,
    ) -> Result<&ScriptTemplate> {
        if let Some(table) = table {
            validate_identifier(table)?;
            if let Some(t) = self.templates.get(&TemplateKey::new(domain, phase, Some(table))) {
                return Ok(t);
            }
        }
        self.templates
            .get(&TemplateKey::new(domain, phase, None))
            .ok_or_else(|| MigrateError::TemplateNotFound {
                domain: domain.key().to_string(),
                phase: phase.to_string(),
                table: table.unwrap_or("*").to_string(),
            })
    }

    pub fn contains(&self, domain: Domain, phase: Phase, table: Option<&str>) -> bool {
        self.resolve(domain, phase, table).is_ok()
    }

    /// Resolve and render in one step.
    pub fn render(
        &self,
        domain: Domain,
        phase: Phase,
        table: Option<&str>,
        params: &RenderParams,
    ) -> Result<String> {
        self.resolve(domain, phase, table)?.render(params)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn template_name(domain: Domain, phase: Phase, table: Option<&str>) -> String {
    match table {
        Some(table) => format!("{}/{}/{}", domain.key(), phase, table),
        None => format!("{}/{}", domain.key(), phase),
    }
}

fn file_stem(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

fn is_sql(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("sql"))
            .unwrap_or(false)
}
