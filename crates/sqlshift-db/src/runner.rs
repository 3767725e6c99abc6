//! Applies pending migration scripts in filename order.
//!
//! A run goes `Initializing` (ledger table) → lock → `Diffing` (disk vs
//! ledger) → `Applying[i]` for each pending script. Every script executes in
//! its own transaction together with its ledger row; the first failure rolls
//! that transaction back and ends the run. Scripts must not contain their own
//! transaction control (`BEGIN`, `COMMIT`, `END`, `ROLLBACK`, savepoints).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use serde::Serialize;
use sqlshift_common::{Error, Result};
use sqlshift_config::MigrationsConfig;
use tracing::{error, info, warn};

use crate::database::Database;
use crate::ledger::{Ledger, LedgerEntry};
use crate::lock::MigrationLock;
use crate::script_store::{MigrationScript, ScriptStore};
use crate::statements::find_transaction_control;

pub struct Runner {
    db: Arc<Database>,
    store: ScriptStore,
    ledger: Ledger,
    lock: MigrationLock,
    verify_checksums: bool,
}

/// A script applied during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub filename: String,
    pub checksum: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub applied: Vec<AppliedMigration>,
}

impl RunReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    pub fn filenames(&self) -> Vec<&str> {
        self.applied.iter().map(|m| m.filename.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    Applied,
    Pending,
    /// Applied, but the file on disk no longer matches the recorded checksum.
    Drifted { recorded: String, current: String },
    /// Recorded in the ledger, no longer on disk.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub filename: String,
    #[serde(flatten)]
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
}

impl Runner {
    pub fn new(db: Arc<Database>, store: ScriptStore, ledger: Ledger) -> Self {
        let lock = MigrationLock::new(&ledger);
        Self {
            db,
            store,
            ledger,
            lock,
            verify_checksums: true,
        }
    }

    pub fn from_config(db: Arc<Database>, config: &MigrationsConfig) -> Result<Self> {
        let store = ScriptStore::new(&config.dir).with_extension(&config.extension);
        let ledger = Ledger::new(&config.table)?;
        Ok(Self::new(db, store, ledger)
            .with_verify_checksums(config.verify_checksums)
            .with_lock_timeout(config.lock_timeout())
            .with_stale_lock_after(config.stale_lock_after()))
    }

    /// Refuse to run when an applied script was edited on disk.
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock = self.lock.with_timeout(timeout);
        self
    }

    pub fn with_stale_lock_after(mut self, stale_after: Duration) -> Self {
        self.lock = self.lock.with_stale_after(stale_after);
        self
    }

    pub fn store(&self) -> &ScriptStore {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Filenames of scripts not yet in the ledger, in apply order.
    /// Writes nothing except the idempotent ledger table creation.
    pub fn check_pending(&self) -> Result<Vec<String>> {
        let conn = self.db.connection()?;
        self.ledger.ensure_table(&conn)?;

        let scripts = self.store.list_all()?;
        let applied: HashSet<String> = self.ledger.applied_filenames(&conn)?.into_iter().collect();

        Ok(pending_scripts(scripts, &applied)
            .into_iter()
            .map(|s| s.filename)
            .collect())
    }

    pub fn run_migrations(&self) -> Result<RunReport> {
        if self.db.is_cancelled() {
            return Err(Error::Cancelled { filename: None });
        }

        let conn = self.db.connection()?;
        self.ledger.ensure_table(&conn)?;
        let guard = self.lock.acquire(&conn)?;

        // Diff only once the lock is held so concurrent runners see each
        // other's commits.
        let scripts = self.store.list_all()?;
        let entries = self.ledger.applied(&conn)?;
        if self.verify_checksums {
            verify_no_drift(&scripts, &entries)?;
        }

        let applied: HashSet<String> = entries.into_iter().map(|e| e.filename).collect();
        let pending = pending_scripts(scripts, &applied);

        let mut report = RunReport::default();
        if pending.is_empty() {
            info!("schema is up to date, no pending migrations");
            guard.release()?;
            return Ok(report);
        }

        info!(
            "applying {} pending migration(s) from {}",
            pending.len(),
            self.store.dir().display()
        );

        for script in &pending {
            if self.db.is_cancelled() {
                warn!(
                    "migration run cancelled after {} of {} script(s)",
                    report.applied.len(),
                    pending.len()
                );
                return Err(Error::Cancelled { filename: None });
            }

            guard.heartbeat()?;
            match self.apply_one(&conn, script) {
                Ok(applied) => report.applied.push(applied),
                Err(e) => {
                    error!(filename = %script.filename, "migration failed, aborting run: {e}");
                    return Err(e);
                }
            }
        }

        guard.release()?;
        info!("applied {} migration(s)", report.applied.len());
        Ok(report)
    }

    fn apply_one(&self, conn: &Connection, script: &MigrationScript) -> Result<AppliedMigration> {
        let started = Instant::now();
        let filename = script.filename.as_str();

        if let Some(keyword) = find_transaction_control(&script.sql) {
            return Err(Error::Apply {
                filename: filename.to_string(),
                message: format!(
                    "{keyword} is not allowed, each script already runs in its own transaction"
                ),
            });
        }

        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate).map_err(|e| {
            self.classify(filename, e, |message| Error::Apply {
                filename: filename.to_string(),
                message: format!("failed to begin transaction: {message}"),
            })
        })?;

        if let Err(e) = tx.execute_batch(&script.sql) {
            let err = self.classify(filename, e, |message| Error::Apply {
                filename: filename.to_string(),
                message,
            });
            return Err(rollback(tx, err));
        }

        if tx.is_autocommit() {
            return Err(Error::Apply {
                filename: filename.to_string(),
                message: "script ended the migration transaction".to_string(),
            });
        }

        if let Err(e) = self
            .ledger
            .record_applied(&tx, filename, &script.checksum)
        {
            let err = if self.db.is_cancelled() {
                Error::Cancelled {
                    filename: Some(filename.to_string()),
                }
            } else {
                Error::LedgerWrite {
                    filename: filename.to_string(),
                    message: e.to_string(),
                }
            };
            return Err(rollback(tx, err));
        }

        tx.commit().map_err(|e| {
            self.classify(filename, e, |message| Error::Apply {
                filename: filename.to_string(),
                message: format!("commit failed: {message}"),
            })
        })?;

        let duration = started.elapsed();
        info!(
            filename = %filename,
            elapsed_ms = duration.as_millis() as u64,
            "applied migration"
        );

        Ok(AppliedMigration {
            filename: filename.to_string(),
            checksum: script.checksum.clone(),
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Interrupted statements become `Cancelled`; anything else goes through `other`.
    fn classify<F>(&self, filename: &str, e: rusqlite::Error, other: F) -> Error
    where
        F: FnOnce(String) -> Error,
    {
        if self.db.is_cancelled() || e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted)
        {
            Error::Cancelled {
                filename: Some(filename.to_string()),
            }
        } else {
            other(e.to_string())
        }
    }

    /// Every script on disk and every ledger entry, ordered by filename.
    pub fn status(&self) -> Result<Vec<MigrationStatus>> {
        let conn = self.db.connection()?;
        self.ledger.ensure_table(&conn)?;

        let scripts = self.store.list_all()?;
        let entries = self.ledger.applied(&conn)?;
        Ok(build_status(&scripts, &entries))
    }

    /// Remove a lock left behind by a crashed run. Returns whether one existed.
    pub fn force_unlock(&self) -> Result<bool> {
        let conn = self.db.connection()?;
        let removed = self.lock.force_release(&conn)?;
        if removed {
            warn!("migration lock forcibly released");
        }
        Ok(removed)
    }
}

fn rollback(tx: Transaction<'_>, err: Error) -> Error {
    // SQLite already rolled back (e.g. after an interrupt).
    if tx.is_autocommit() {
        return err;
    }
    if let Err(e) = tx.rollback() {
        error!("rollback failed: {e}");
    }
    err
}

fn pending_scripts(scripts: Vec<MigrationScript>, applied: &HashSet<String>) -> Vec<MigrationScript> {
    scripts
        .into_iter()
        .filter(|s| !applied.contains(&s.filename))
        .collect()
}

fn verify_no_drift(scripts: &[MigrationScript], entries: &[LedgerEntry]) -> Result<()> {
    let on_disk: HashMap<&str, &MigrationScript> =
        scripts.iter().map(|s| (s.filename.as_str(), s)).collect();

    for entry in entries {
        match on_disk.get(entry.filename.as_str()) {
            Some(script) if script.checksum != entry.checksum => {
                return Err(Error::Drift {
                    filename: entry.filename.clone(),
                    recorded: entry.checksum.clone(),
                    current: script.checksum.clone(),
                });
            }
            Some(_) => {}
            None => warn!(
                "{} is recorded as applied but no longer exists on disk",
                entry.filename
            ),
        }
    }
    Ok(())
}

fn build_status(scripts: &[MigrationScript], entries: &[LedgerEntry]) -> Vec<MigrationStatus> {
    let recorded: HashMap<&str, &LedgerEntry> =
        entries.iter().map(|e| (e.filename.as_str(), e)).collect();

    let mut statuses: Vec<MigrationStatus> = scripts
        .iter()
        .map(|script| match recorded.get(script.filename.as_str()) {
            Some(entry) if entry.checksum != script.checksum => MigrationStatus {
                filename: script.filename.clone(),
                state: MigrationState::Drifted {
                    recorded: entry.checksum.clone(),
                    current: script.checksum.clone(),
                },
                applied_at: Some(entry.applied_at),
            },
            Some(entry) => MigrationStatus {
                filename: script.filename.clone(),
                state: MigrationState::Applied,
                applied_at: Some(entry.applied_at),
            },
            None => MigrationStatus {
                filename: script.filename.clone(),
                state: MigrationState::Pending,
                applied_at: None,
            },
        })
        .collect();

    let on_disk: HashSet<&str> = scripts.iter().map(|s| s.filename.as_str()).collect();
    statuses.extend(
        entries
            .iter()
            .filter(|e| !on_disk.contains(e.filename.as_str()))
            .map(|e| MigrationStatus {
                filename: e.filename.clone(),
                state: MigrationState::Missing,
                applied_at: Some(e.applied_at),
            }),
    );

    statuses.sort_by(|a, b| a.filename.cmp(&b.filename));
    statuses
}
