//! Advisory run locks stored in the database.
//!
//! A lock is a row in `engine_locks`, taken with a compare-and-set inside an
//! IMMEDIATE transaction so that exactly one connection wins. The guard deletes
//! its row when dropped. Every row carries an `expires_at`; a row whose expiry
//! lies in the past belongs to a run that overran or died and may be taken
//! over. A run that loses its row this way fails at [`RunLock::verify`].

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::Database;
use crate::error::{Error, Result};

/// Lease for callers that pass no timeout, so a crashed holder cannot block
/// later runs forever.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60 * 60);

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn new_token() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{:x}-{}", std::process::id(), nanos, seq)
}

/// Held advisory lock. Released on drop.
pub struct RunLock<'a> {
    db: &'a Database,
    name: String,
    token: String,
}

impl<'a> RunLock<'a> {
    /// Take the named lock or fail immediately with [`Error::Conflict`].
    ///
    /// The row expires after `ttl`, or after [`DEFAULT_LEASE`] when `ttl` is `None`.
    pub fn try_acquire(db: &'a Database, name: &str, ttl: Option<Duration>) -> Result<Self> {
        let now = Utc::now().timestamp_millis();
        let lease = ttl.unwrap_or(DEFAULT_LEASE);
        let expires_at = now.saturating_add(lease.as_millis() as i64);
        let token = new_token();

        let tx = db.write_transaction()?;
        let holder: Option<Option<i64>> = tx
            .query_row(
                "SELECT expires_at FROM engine_locks WHERE name = ?",
                [name],
                |row| row.get(0),
            )
            .optional()?;

        match holder {
            None => {
                tx.execute(
                    "INSERT INTO engine_locks (name, token, expires_at) VALUES (?, ?, ?)",
                    params![name, token, expires_at],
                )?;
            }
            // Rows written before every lock carried a lease count as expired.
            Some(None) => {
                tracing::warn!(lock = name, "Taking over lock without expiry");
                take_over(&tx, name, &token, expires_at)?;
            }
            Some(Some(expired)) if expired <= now => {
                tracing::warn!(lock = name, expired_at = expired, "Taking over expired lock");
                take_over(&tx, name, &token, expires_at)?;
            }
            Some(_) => {
                return Err(Error::Conflict(format!("{} is already running", name)));
            }
        }
        tx.commit()?;

        tracing::debug!(lock = name, token = %token, "Lock acquired");
        Ok(Self {
            db,
            name: name.to_string(),
            token,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fail with a conflict unless this guard still owns its row.
    /// Called inside the transaction that publishes the run's results.
    pub(crate) fn verify(&self, conn: &Connection) -> Result<()> {
        let current: Option<String> = conn
            .query_row(
                "SELECT token FROM engine_locks WHERE name = ?",
                [&self.name],
                |row| row.get(0),
            )
            .optional()?;
        if current.as_deref() == Some(self.token.as_str()) {
            Ok(())
        } else {
            Err(Error::Conflict(format!("{} lock was taken over", self.name)))
        }
    }
}

fn take_over(conn: &Connection, name: &str, token: &str, expires_at: i64) -> Result<()> {
    conn.execute(
        r#"
        UPDATE engine_locks SET token = ?, acquired_at = CURRENT_TIMESTAMP, expires_at = ?
        WHERE name = ?
        "#,
        params![token, expires_at, name],
    )?;
    Ok(())
}

impl Drop for RunLock<'_> {
    fn drop(&mut self) {
        let released = self.db.conn().execute(
            "DELETE FROM engine_locks WHERE name = ? AND token = ?",
            params![self.name, self.token],
        );
        if let Err(e) = released {
            tracing::warn!(lock = %self.name, error = %e, "Failed to release lock");
        }
    }
}
