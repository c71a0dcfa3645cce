//! Defense-in-depth check for dynamically substituted SQL fragments.
//!
//! User data never reaches SQL text; it travels as bound parameters. What
//! does reach SQL text is identifiers substituted into script templates, and
//! those pass through [`check_value`] on top of identifier validation.
//!
//! A quoted literal that happens to contain `; drop` is rejected as well.
//! That false positive is accepted.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{MigrateError, Result};

fn terminator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i);\s*(drop|delete|insert|update)").expect("terminator pattern is valid")
    })
}

/// Reject a statement terminator followed by a destructive keyword.
pub fn check(fragment: &str) -> Result<()> {
    if terminator_pattern().is_match(fragment) {
        return Err(MigrateError::InjectionSuspected(fragment.to_string()));
    }
    Ok(())
}

/// Stricter check for values substituted into templates.
///
/// Adds comment markers and control characters to [`check`].
pub fn check_value(value: &str) -> Result<()> {
    check(value)?;

    if value.contains("--") || value.contains("/*") || value.contains("*/") {
        return Err(MigrateError::InjectionSuspected(value.to_string()));
    }

    if value.chars().any(|c| c.is_control()) {
        return Err(MigrateError::InjectionSuspected(value.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminator_followed_by_keyword() {
        for fragment in [
            "x; DROP TABLE Case",
            "x;drop table Case",
            "x;\n\tDelete FROM Case",
            "1; insert into t values (1)",
            "a ;  UPDATE t SET x = 1",
        ] {
            let err = check(fragment).unwrap_err();
            assert!(matches!(err, MigrateError::InjectionSuspected(_)), "{fragment}");
        }
    }

    #[test]
    fn test_clean_fragments_pass() {
        for fragment in [
            "Case",
            "SELECT * FROM [dbo].[Case]",
            "DROP TABLE #tmp",
            "x; SELECT 1",
            "update_log",
            "a;b",
        ] {
            assert!(check(fragment).is_ok(), "{fragment}");
        }
    }

    #[test]
    fn test_quoted_literal_is_false_positive() {
        assert!(check("WHERE note = 'done; delete later'").is_err());
    }

    #[test]
    fn test_check_value_rejects_comments_and_control_chars() {
        assert!(check_value("Case--").is_err());
        assert!(check_value("Case/*x*/").is_err());
        assert!(check_value("Case\r\n").is_err());
        assert!(check_value("Case").is_ok());
    }
}
