//! Execution of SQL work: transaction scopes, retries and units of work.

pub mod retry;
pub mod transaction;
pub mod work;

pub use retry::{run_with_retry, Attempted, RetryAttempt, RetryPolicy};
pub use transaction::execute;
pub use work::{Script, ScriptOutput, Statement, Work};
