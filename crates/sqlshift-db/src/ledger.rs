use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::Serialize;
use sqlshift_common::{Error, Result};
use tracing::debug;

pub const DEFAULT_TABLE: &str = "schema_migrations";

const MAX_IDENTIFIER_LEN: usize = 63;

/// A committed record that a migration script has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub filename: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
}

/// The table recording which scripts have run.
///
/// Methods take a `&Connection` so callers can pass a `Transaction`; the
/// runner relies on this to commit a script and its ledger row together.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

impl Ledger {
    pub fn new(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name of the companion table holding the migration lock row.
    pub fn lock_table(&self) -> String {
        format!("{}_lock", self.table)
    }

    pub fn ensure_table(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL UNIQUE,
                applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                checksum TEXT NOT NULL
            );",
            table = self.table
        ))
        .map_err(|e| Error::Database(format!("failed to create ledger table: {e}")))?;
        Ok(())
    }

    pub fn exists(&self, conn: &Connection) -> Result<bool> {
        table_exists(conn, &self.table)
    }

    /// All entries, oldest first.
    pub fn applied(&self, conn: &Connection) -> Result<Vec<LedgerEntry>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, filename, applied_at, checksum FROM \"{}\" ORDER BY applied_at ASC, id ASC",
                self.table
            ))
            .map_err(|e| Error::Database(format!("failed to prepare ledger query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| Error::Database(format!("failed to query ledger: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, filename, applied_at, checksum) =
                row.map_err(|e| Error::Database(format!("failed to read ledger row: {e}")))?;
            entries.push(LedgerEntry {
                id,
                applied_at: parse_datetime(&applied_at)
                    .map_err(|e| Error::Database(format!("ledger row {filename}: {e}")))?,
                filename,
                checksum,
            });
        }
        Ok(entries)
    }

    pub fn applied_filenames(&self, conn: &Connection) -> Result<Vec<String>> {
        Ok(self
            .applied(conn)?
            .into_iter()
            .map(|entry| entry.filename)
            .collect())
    }

    pub fn record_applied(&self, conn: &Connection, filename: &str, checksum: &str) -> Result<()> {
        let applied_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        conn.execute(
            &format!(
                "INSERT INTO \"{}\" (filename, applied_at, checksum) VALUES (?1, ?2, ?3)",
                self.table
            ),
            params![filename, applied_at, checksum],
        )
        .map_err(|e| {
            if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
                Error::ConstraintViolation(filename.to_string())
            } else {
                Error::Database(format!("failed to record {filename}: {e}"))
            }
        })?;

        debug!("recorded {filename} in {}", self.table);
        Ok(())
    }
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| Error::Database(format!("failed to check for table {name}: {e}")))
}

/// Table names are interpolated into DDL, so only plain identifiers are allowed.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("table name cannot be empty".into()));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::Config(format!("table name too long: {name}")));
    }
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!("invalid table name: {name}")));
    }
    Ok(())
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Rows inserted by hand may use SQLite's datetime('now') format
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| Error::Database(format!("unrecognized timestamp {s:?}")))
}
