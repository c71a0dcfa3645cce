//! Transactional execution unit.
//!
//! Every SQL operation the engine performs runs through [`execute`]: manual
//! commit for the duration of the work, commit on success, rollback on
//! failure, and the caller's autocommit mode restored on every path. A
//! unit abandoned at its client deadline leaves the session broken, so it
//! is neither rolled back nor restored.

use std::time::Duration;

use tracing::{debug, error, warn};

use super::work::Work;
use crate::db::Connection;
use crate::error::{MigrateError, Result};

/// Run `work` in one transaction scope.
///
/// `timeout` is applied as the session lock timeout and as a client-side
/// deadline on the whole unit. A missed deadline marks the session broken
/// and returns `Timeout`. If autocommit cannot be restored afterwards the
/// session state is unknown and `ConnectionLost` is returned.
pub async fn execute<W>(
    conn: &mut dyn Connection,
    work: &W,
    timeout: Option<Duration>,
) -> Result<W::Output>
where
    W: Work + ?Sized,
{
    let original = conn.autocommit();

    let outcome = match conn.set_autocommit(false).await {
        Ok(()) => run_scoped(conn, work, timeout).await,
        Err(e) => Err(e),
    };

    if conn.is_broken() {
        error!(work = work.name(), "session broken, skipping rollback");
        return match outcome {
            Ok(_) => Err(MigrateError::ConnectionLost(format!(
                "session broken during {}",
                work.name()
            ))),
            Err(e) => Err(e),
        };
    }

    let outcome = match outcome {
        Ok(value) => match conn.commit().await {
            Ok(()) => Ok(value),
            Err(e) => {
                warn!(work = work.name(), "commit failed: {}", e);
                rollback_quietly(conn, work.name()).await;
                Err(e)
            }
        },
        Err(e) => {
            rollback_quietly(conn, work.name()).await;
            Err(e)
        }
    };

    if let Err(restore) = restore_autocommit(conn, original).await {
        error!(
            work = work.name(),
            "could not restore autocommit={}: {}", original, restore
        );
        let detail = match &outcome {
            Ok(_) => format!("restoring autocommit after {}: {}", work.name(), restore),
            Err(e) => format!(
                "restoring autocommit after {} failed ({}): {}",
                work.name(),
                e,
                restore
            ),
        };
        return Err(MigrateError::ConnectionLost(detail));
    }

    outcome
}

async fn run_scoped<W>(
    conn: &mut dyn Connection,
    work: &W,
    timeout: Option<Duration>,
) -> Result<W::Output>
where
    W: Work + ?Sized,
{
    debug!(work = work.name(), "begin");
    match timeout {
        Some(limit) => {
            conn.set_statement_timeout(Some(limit)).await?;
            let result = match tokio::time::timeout(limit, work.run(conn)).await {
                Ok(result) => result,
                Err(_) => {
                    // The abandoned request may still be on the wire.
                    conn.mark_broken();
                    return Err(MigrateError::Timeout(limit));
                }
            };
            if let Err(e) = conn.set_statement_timeout(None).await {
                warn!(work = work.name(), "could not clear lock timeout: {}", e);
            }
            result
        }
        None => work.run(conn).await,
    }
}

async fn rollback_quietly(conn: &mut dyn Connection, name: &str) {
    if let Err(e) = conn.rollback().await {
        warn!(work = name, "rollback failed: {}", e);
    } else {
        debug!(work = name, "rolled back");
    }
}

async fn restore_autocommit(conn: &mut dyn Connection, original: bool) -> Result<()> {
    if conn.autocommit() != original {
        conn.set_autocommit(original).await?;
    }
    Ok(())
}
