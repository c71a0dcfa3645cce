//! Error types for the migration engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// SQL Server error numbers that indicate contention or a blip rather than a
/// structural problem with the statement.
///
/// - 1204: lock manager out of resources
/// - 1205: chosen as deadlock victim
/// - 1222: lock request time out period exceeded
/// - -2: client-side query timeout
/// - 40197, 40501, 40613, 49918-49920, 10928, 10929: Azure SQL throttling/failover
pub const TRANSIENT_ERROR_CODES: &[i32] = &[
    1204, 1205, 1222, -2, 40197, 40501, 40613, 49918, 49919, 49920, 10928, 10929,
];

/// Error numbers raised when a lock cannot be acquired.
pub const LOCK_CONTENTION_CODES: &[i32] = &[1204, 1205, 1222];

/// How the retry policy and the orchestrator treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Lock/deadlock/timeout class; safe to re-run from scratch.
    Transient,
    /// Syntax, constraint violation, missing object; never retried.
    Permanent,
    /// The connection itself is unusable.
    Fatal,
}

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// No template registered for the requested key.
    #[error("Template not found: {domain}/{phase}/{table}")]
    TemplateNotFound {
        domain: String,
        phase: String,
        table: String,
    },

    /// A placeholder in the template text has no supplied value.
    #[error("Template {template} references ${{{placeholder}}} but no value was supplied")]
    MissingPlaceholder {
        template: String,
        placeholder: String,
    },

    /// A substituted fragment looks like a statement-terminating injection.
    #[error("SECURITY: possible SQL injection rejected: {0:?}")]
    InjectionSuspected(String),

    /// An identifier failed validation.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Deadlock, lock timeout, throttling.
    #[error("Transient database error{}: {message}", code_label(.code))]
    TransientDatabase { code: Option<i32>, message: String },

    /// Constraint violation, syntax error, missing object.
    #[error("Database error{}: {message}", code_label(.code))]
    PermanentDatabase { code: Option<i32>, message: String },

    /// The connection dropped or could not be restored to a known state.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Work exceeded its client-side deadline. The request was abandoned
    /// mid-stream, so the session is discarded along with it.
    #[error("Statement timed out after {0:?}; session discarded")]
    Timeout(Duration),

    /// A value has no faithful representation on the other side.
    #[error("Value conversion failed: {0}")]
    Conversion(String),

    /// Row count or checksum differs between source and target.
    #[error("Verification mismatch for {table}: {detail}")]
    VerificationMismatch { table: String, detail: String },

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,

    /// A run stopped on a configured fatal error class.
    #[error("Migration run aborted: {0}")]
    Aborted(String),

    /// Failure annotated with the number of attempts the retry policy made.
    #[error("{source} (after {attempts} attempts)")]
    Attempts {
        attempts: u32,
        source: Box<MigrateError>,
    },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" {}", code),
        None => String::new(),
    }
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Build a database error from a server error number, classifying it.
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        if TRANSIENT_ERROR_CODES.contains(&code) {
            MigrateError::TransientDatabase {
                code: Some(code),
                message,
            }
        } else {
            MigrateError::PermanentDatabase {
                code: Some(code),
                message,
            }
        }
    }

    /// Classify the failure for retry and abort decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            MigrateError::TransientDatabase { .. } => ErrorClass::Transient,
            MigrateError::ConnectionLost(_)
            | MigrateError::Timeout(_)
            | MigrateError::Pool { .. } => ErrorClass::Fatal,
            MigrateError::Attempts { source, .. } => source.class(),
            _ => ErrorClass::Permanent,
        }
    }

    /// Number of attempts made before this error surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            MigrateError::Attempts { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// The underlying error with any attempt annotation removed.
    pub fn root(&self) -> &MigrateError {
        match self {
            MigrateError::Attempts { source, .. } => source.root(),
            other => other,
        }
    }

    /// Server error number, if the failure came from the database.
    pub fn code(&self) -> Option<i32> {
        match self.root() {
            MigrateError::TransientDatabase { code, .. }
            | MigrateError::PermanentDatabase { code, .. } => *code,
            _ => None,
        }
    }

    /// True when the failure means a lock could not be obtained in time.
    pub fn is_lock_contention(&self) -> bool {
        self.code()
            .map(|c| LOCK_CONTENTION_CODES.contains(&c))
            .unwrap_or(false)
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self.root() {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::Json(_) => 1,
            MigrateError::TemplateNotFound { .. }
            | MigrateError::MissingPlaceholder { .. }
            | MigrateError::InjectionSuspected(_)
            | MigrateError::InvalidIdentifier(_) => 2,
            MigrateError::TransientDatabase { .. }
            | MigrateError::PermanentDatabase { .. }
            | MigrateError::ConnectionLost(_)
            | MigrateError::Timeout(_)
            | MigrateError::Conversion(_)
            | MigrateError::Pool { .. } => 3,
            MigrateError::VerificationMismatch { .. } => 4,
            MigrateError::Cancelled => 5,
            MigrateError::Aborted(_) => 6,
            MigrateError::Io(_) => 7,
            MigrateError::Attempts { .. } => 3,
        }
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
