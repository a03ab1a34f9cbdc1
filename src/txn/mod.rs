// Transaction coordinator - atomic units with bounded retry on contention

use crate::error::{JotDbError, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::thread;
use std::time::Duration;

/// Attempts before a busy atomic unit gives up.
const MAX_ATTEMPTS: usize = 5;

/// First retry delay; doubled per attempt (10ms, 20ms, 40ms, 80ms).
const BACKOFF_BASE: Duration = Duration::from_millis(10);

/// Run `op` inside an immediate transaction. The whole unit commits or
/// rolls back together: an error from `op` (or from commit) leaves no
/// partial effect. Transient busy/locked failures re-run the unit with
/// exponential backoff; exhaustion surfaces as `TransactionFailed`.
/// Constraint violations and other non-transient errors are never retried.
pub(crate) fn run_atomic<T, F>(conn: &mut Connection, mut op: F) -> Result<T>
where
    F: FnMut(&Transaction<'_>) -> Result<T>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match execute_once(conn, &mut op) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_busy() => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(JotDbError::TransactionFailed {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                let delay = BACKOFF_BASE * 2u32.pow(attempt as u32 - 1);
                log::warn!(
                    "engine busy, retrying atomic unit in {delay:?} (attempt {attempt}/{MAX_ATTEMPTS})"
                );
                thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

fn execute_once<T, F>(conn: &mut Connection, op: &mut F) -> Result<T>
where
    F: FnMut(&Transaction<'_>) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    // dropping the transaction on the error path rolls it back
    let value = op(&tx)?;
    tx.commit()?;
    Ok(value)
}
