//! Retry policy with exponential backoff.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::transaction;
use super::work::Work;
use crate::config::MigrationConfig;
use crate::db::Connection;
use crate::error::{ErrorClass, MigrateError, Result};

/// One failed attempt. Emitted as a log event, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub elapsed_ms: u64,
    pub kind: ErrorClass,
    pub code: Option<i32>,
}

/// A successful result and how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// How often and how patiently to retry transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Passed to each transaction scope.
    pub statement_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            statement_timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            statement_timeout: Some(config.sql_timeout()),
        }
    }

    /// Backoff after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `work` with no stage deadline.
    pub async fn run<W>(&self, conn: &mut dyn Connection, work: &W) -> Result<Attempted<W::Output>>
    where
        W: Work + ?Sized,
    {
        self.run_until(conn, work, None).await
    }

    /// Run `work`, each attempt in a fresh transaction scope.
    ///
    /// Only transient failures are retried. No attempt starts once
    /// `deadline` has passed or would pass during the backoff.
    pub async fn run_until<W>(
        &self,
        conn: &mut dyn Connection,
        work: &W,
        deadline: Option<Instant>,
    ) -> Result<Attempted<W::Output>>
    where
        W: Work + ?Sized,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match transaction::execute(conn, work, self.statement_timeout).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(work = work.name(), attempts = attempt, "succeeded after retry");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(err) => err,
            };

            let event = RetryAttempt {
                attempt,
                elapsed_ms: started.elapsed().as_millis() as u64,
                kind: err.class(),
                code: err.code(),
            };
            warn!(
                work = work.name(),
                attempt = event.attempt,
                elapsed_ms = event.elapsed_ms,
                kind = ?event.kind,
                code = ?event.code,
                "attempt failed: {}",
                err
            );

            if event.kind != ErrorClass::Transient {
                return Err(annotate(err, attempt));
            }
            if attempt >= self.max_attempts {
                return Err(annotate(err, attempt));
            }

            let delay = self.delay_for(attempt);
            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    warn!(work = work.name(), attempts = attempt, "stage deadline reached, not retrying");
                    return Err(annotate(err, attempt));
                }
            }
            tokio::time::sleep(delay).await;
        }
    }
}

/// Retry `work` with default cap and no statement timeout.
pub async fn run_with_retry<W>(
    conn: &mut dyn Connection,
    work: &W,
    max_attempts: u32,
    base_delay: Duration,
) -> Result<Attempted<W::Output>>
where
    W: Work + ?Sized,
{
    let policy = RetryPolicy {
        max_attempts: max_attempts.max(1),
        base_delay,
        ..RetryPolicy::default()
    };
    policy.run(conn, work).await
}

fn annotate(err: MigrateError, attempts: u32) -> MigrateError {
    if attempts <= 1 {
        err
    } else {
        MigrateError::Attempts {
            attempts,
            source: Box::new(err),
        }
    }
}
