//! Migration domains and the behavior each one contributes to a run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A family of related tables migrated together.
///
/// The set is closed; everything that differs between domains is answered
/// by an exhaustive match here rather than by subclassing the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Justice,
    Operations,
    Financial,
    Lob,
}

impl Domain {
    /// All domains in the order `run-all` processes them.
    pub const ALL: [Domain; 4] = [
        Domain::Justice,
        Domain::Operations,
        Domain::Financial,
        Domain::Lob,
    ];

    /// Display name used in logs and error log file names.
    pub fn name(&self) -> &'static str {
        match self {
            Domain::Justice => "Justice",
            Domain::Operations => "Operations",
            Domain::Financial => "Financial",
            Domain::Lob => "LOB",
        }
    }

    /// Directory name under the script root.
    pub fn key(&self) -> &'static str {
        match self {
            Domain::Justice => "justice",
            Domain::Operations => "operations",
            Domain::Financial => "financial",
            Domain::Lob => "lob",
        }
    }

    /// Source database used when the configuration names none.
    pub fn default_source_database(&self) -> &'static str {
        self.name()
    }

    /// Scripts run once, in order, before the table loop.
    ///
    /// They build the `_tmp` id tables that scope what each table copies.
    pub fn prepare_steps(&self) -> &'static [&'static str] {
        match self {
            Domain::Justice => &[
                "gather_caseids",
                "gather_chargeids",
                "gather_partyids",
                "gather_warrantids",
                "gather_hearingids",
                "gather_eventids",
            ],
            Domain::Financial => &["gather_feeinstanceids"],
            Domain::Operations | Domain::Lob => &[],
        }
    }

    /// Whether Verify compares sampled LOB checksums in addition to counts.
    pub fn verifies_lob_checksums(&self) -> bool {
        matches!(self, Domain::Lob)
    }

    /// File that failures for this domain are appended to.
    pub fn error_log_file_name(&self) -> String {
        format!("PreDMSErrorLog_{}.txt", self.name())
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "justice" => Ok(Domain::Justice),
            "operations" => Ok(Domain::Operations),
            "financial" => Ok(Domain::Financial),
            "lob" => Ok(Domain::Lob),
            other => Err(format!(
                "unknown domain '{}' (expected justice, operations, financial or lob)",
                other
            )),
        }
    }
}
