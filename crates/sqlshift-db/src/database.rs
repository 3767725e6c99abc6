use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, InterruptHandle};
use sqlshift_common::{Error, Result};
use sqlshift_config::DatabaseConfig;
use tracing::info;

/// A dedicated SQLite connection owned by the migration engine.
///
/// Constructed once by the entry point and shared (via `Arc`) with the
/// runner, the startup hook and the reset utility.
pub struct Database {
    conn: Mutex<Connection>,
    cancel: CancelHandle,
}

/// Cancels an in-flight migration run.
///
/// Setting the flag stops the runner before its next script; the interrupt
/// aborts the statement currently executing so its transaction rolls back.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    interrupt: Arc<InterruptHandle>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.interrupt.interrupt();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Database {
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        if db_path == Path::new(":memory:") {
            return Self::in_memory();
        }

        info!("opening database at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.busy_timeout(busy_timeout)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self::from_connection(conn))
    }

    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::open(&config.path, config.busy_timeout())
    }

    fn from_connection(conn: Connection) -> Self {
        let cancel = CancelHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
            interrupt: Arc::new(conn.get_interrupt_handle()),
        };
        Self {
            conn: Mutex::new(conn),
            cancel,
        }
    }

    /// Exclusive access to the connection for the duration of the guard.
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("database lock poisoned".into()))
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_enables_foreign_keys() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn memory_path_opens_in_memory() {
        let db = Database::open(Path::new(":memory:"), Duration::from_secs(1)).unwrap();
        assert!(!db.is_cancelled());
    }

    #[test]
    fn file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("app.db"), Duration::from_secs(1)).unwrap();
        let conn = db.connection().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn cancel_is_shared_between_handles() {
        let db = Database::in_memory().unwrap();
        let handle = db.cancel_handle();
        handle.cancel();
        assert!(db.is_cancelled());
        assert!(db.cancel_handle().is_cancelled());
    }
}
