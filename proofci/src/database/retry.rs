//! Retrying statements that lose the SQLite write lock.
//!
//! Every claimer writes through `BEGIN IMMEDIATE`, so under contention a
//! statement can come back `SQLITE_BUSY` (or `SQLITE_LOCKED` for shared
//! cache) even with a busy timeout set. Those are retried with a doubling,
//! jittered delay; every other error is returned as is.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Primary result codes; extended codes carry them in the low byte.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Delay schedule for lock retries.
#[derive(Debug, Clone, Copy)]
struct LockBackoff {
    first: Duration,
    ceiling: Duration,
    retries: u32,
}

const LOCK_BACKOFF: LockBackoff = LockBackoff {
    first: Duration::from_millis(10),
    ceiling: Duration::from_secs(2),
    retries: 12,
};

impl LockBackoff {
    /// Delay before retry number `retry` (0-based), or `None` once the
    /// budget is spent. Up to a quarter of the delay is added as jitter.
    fn delay(&self, retry: u32) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        let base = self
            .first
            .saturating_mul(1u32 << retry.min(16))
            .min(self.ceiling);
        let jitter = rand::random::<u64>() % (base.as_millis() as u64 / 4 + 1);
        Some((base + Duration::from_millis(jitter)).min(self.ceiling))
    }
}

fn is_lock_code(code: &str) -> bool {
    code.parse::<i32>()
        .is_ok_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
}

fn is_lock_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("database is locked") || message.contains("database is busy")
}

/// Whether `err` means another connection holds the lock.
pub(crate) fn is_sqlite_busy_error(err: &Error) -> bool {
    match err {
        Error::DatabaseSqlx(sqlx::Error::Database(db_err)) => {
            db_err.code().is_some_and(|code| is_lock_code(&code))
                || is_lock_message(db_err.message())
        }
        Error::DatabaseSqlx(other) => is_lock_message(&other.to_string()),
        _ => false,
    }
}

/// Run `op` until it returns something other than a lock error or the
/// retry budget runs out.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;
    loop {
        let err = match op().await {
            Err(err) if is_sqlite_busy_error(&err) => err,
            done => return done,
        };
        let Some(delay) = LOCK_BACKOFF.delay(retry) else {
            return Err(err);
        };
        retry += 1;
        debug!(
            op = op_name,
            retry,
            "Database locked, retrying in {:?}",
            delay
        );
        tokio::time::sleep(delay).await;
    }
}
