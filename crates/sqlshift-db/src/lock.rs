use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::Serialize;
use sqlshift_common::{Error, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ledger::{Ledger, parse_datetime};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15 * 60);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cross-process mutual exclusion for migration runs.
///
/// The lock is a single row (`id = 1`) in `<ledger>_lock`. Whoever inserts
/// it owns the lock until the row is deleted. The owner refreshes
/// `heartbeat_at` while it works; a row whose heartbeat is older than
/// `stale_after` is treated as left behind by a crashed process and reclaimed.
#[derive(Debug, Clone)]
pub struct MigrationLock {
    table: String,
    timeout: Duration,
    stale_after: Duration,
    poll_interval: Duration,
}

/// The current owner of the lock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// Releases the lock row when dropped.
pub struct LockGuard<'c> {
    conn: &'c Connection,
    table: String,
    holder: String,
    released: bool,
}

impl MigrationLock {
    pub fn new(ledger: &Ledger) -> Self {
        Self {
            table: ledger.lock_table(),
            timeout: DEFAULT_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn ensure_table(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                heartbeat_at TEXT NOT NULL
            );",
            self.table
        ))
        .map_err(|e| Error::Database(format!("failed to create lock table: {e}")))
    }

    pub fn acquire<'c>(&self, conn: &'c Connection) -> Result<LockGuard<'c>> {
        self.ensure_table(conn)?;

        let holder = Uuid::new_v4().to_string();
        let started = Instant::now();

        loop {
            let now = Utc::now();
            let inserted = conn.execute(
                &format!(
                    "INSERT INTO \"{}\" (id, holder, acquired_at, heartbeat_at) VALUES (1, ?1, ?2, ?2)",
                    self.table
                ),
                params![holder, timestamp(now)],
            );

            match inserted {
                Ok(_) => {
                    debug!("acquired migration lock {holder}");
                    return Ok(LockGuard {
                        conn,
                        table: self.table.clone(),
                        holder,
                        released: false,
                    });
                }
                Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {}
                // Another connection is mid-transaction; keep waiting up to our own timeout.
                Err(e) if is_busy(&e) => {
                    if started.elapsed() >= self.timeout {
                        let current = self.holder(conn).ok().flatten();
                        return Err(Error::Locked(
                            current.map_or_else(|| "a busy connection".to_string(), |h| h.holder),
                        ));
                    }
                    debug!("database busy while acquiring migration lock, waiting");
                    std::thread::sleep(self.poll_interval);
                    continue;
                }
                Err(e) => {
                    return Err(Error::Database(format!(
                        "failed to acquire migration lock: {e}"
                    )));
                }
            }

            // Released between our insert and this read: retry right away.
            let Some(current) = self.holder(conn)? else {
                continue;
            };

            let age = (now - current.heartbeat_at).to_std().unwrap_or_default();
            if age > self.stale_after {
                warn!(
                    "reclaiming stale migration lock held by {} (last heartbeat {})",
                    current.holder, current.heartbeat_at
                );
                match delete_holder(conn, &self.table, &current.holder) {
                    Ok(()) => continue,
                    Err(e) if started.elapsed() < self.timeout => {
                        debug!("could not reclaim stale migration lock yet: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }

            if started.elapsed() >= self.timeout {
                return Err(Error::Locked(current.holder));
            }

            debug!("migration lock held by {}, waiting", current.holder);
            std::thread::sleep(self.poll_interval);
        }
    }

    pub fn holder(&self, conn: &Connection) -> Result<Option<LockHolder>> {
        if !crate::ledger::table_exists(conn, &self.table)? {
            return Ok(None);
        }

        conn.query_row(
            &format!(
                "SELECT holder, acquired_at, heartbeat_at FROM \"{}\" WHERE id = 1",
                self.table
            ),
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to read migration lock: {e}")))?
        .map(|(holder, acquired_at, heartbeat_at)| {
            Ok(LockHolder {
                acquired_at: parse_datetime(&acquired_at)
                    .map_err(|e| Error::Database(format!("migration lock {holder}: {e}")))?,
                heartbeat_at: parse_datetime(&heartbeat_at)
                    .map_err(|e| Error::Database(format!("migration lock {holder}: {e}")))?,
                holder,
            })
        })
        .transpose()
    }

    /// Remove the lock row regardless of owner. Returns whether a row existed.
    pub fn force_release(&self, conn: &Connection) -> Result<bool> {
        if !crate::ledger::table_exists(conn, &self.table)? {
            return Ok(false);
        }

        let removed = conn
            .execute(&format!("DELETE FROM \"{}\" WHERE id = 1", self.table), [])
            .map_err(|e| Error::Database(format!("failed to release migration lock: {e}")))?;
        Ok(removed > 0)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn delete_holder(conn: &Connection, table: &str, holder: &str) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM \"{table}\" WHERE id = 1 AND holder = ?1"),
        params![holder],
    )
    .map_err(|e| Error::Database(format!("failed to release migration lock: {e}")))?;
    Ok(())
}

impl LockGuard<'_> {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Mark the lock as still in use so other instances do not reclaim it.
    /// Fails if the row was removed or taken over in the meantime.
    pub fn heartbeat(&self) -> Result<()> {
        let updated = self
            .conn
            .execute(
                &format!(
                    "UPDATE \"{}\" SET heartbeat_at = ?1 WHERE id = 1 AND holder = ?2",
                    self.table
                ),
                params![timestamp(Utc::now()), self.holder],
            )
            .map_err(|e| Error::Database(format!("failed to refresh migration lock: {e}")))?;

        if updated == 0 {
            return Err(Error::Database(format!(
                "migration lock {} is no longer held by this run",
                self.holder
            )));
        }
        Ok(())
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        delete_holder(self.conn, &self.table, &self.holder)?;
        debug!("released migration lock {}", self.holder);
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = delete_holder(self.conn, &self.table, &self.holder) {
            warn!("failed to release migration lock {}: {e}", self.holder);
        }
    }
}
