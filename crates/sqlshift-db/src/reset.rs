//! Destructive teardown for development databases.
//!
//! Only compiled with the `reset` feature. Object names are listed
//! explicitly rather than introspected, children before parents, because
//! SQLite has no `DROP ... CASCADE`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use sqlshift_common::{Error, Result};
use tracing::{info, warn};

use crate::database::Database;
use crate::ledger::Ledger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    View,
    Index,
    Trigger,
}

impl ObjectKind {
    fn keyword(self) -> &'static str {
        match self {
            ObjectKind::Table => "TABLE",
            ObjectKind::View => "VIEW",
            ObjectKind::Index => "INDEX",
            ObjectKind::Trigger => "TRIGGER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedObject {
    pub kind: ObjectKind,
    pub name: &'static str,
}

const fn object(kind: ObjectKind, name: &'static str) -> ManagedObject {
    ManagedObject { kind, name }
}

/// Application schema objects, in drop order.
pub const MANAGED_OBJECTS: &[ManagedObject] = &[
    object(ObjectKind::View, "open_tasks"),
    object(ObjectKind::Index, "idx_messages_group_created"),
    object(ObjectKind::Index, "idx_tasks_group_status"),
    object(ObjectKind::Trigger, "trg_tasks_updated_at"),
    object(ObjectKind::Table, "messages"),
    object(ObjectKind::Table, "tasks"),
    object(ObjectKind::Table, "group_members"),
    object(ObjectKind::Table, "task_groups"),
    object(ObjectKind::Table, "users"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Clear the ledger, keep the schema.
    ResetOnly,
    /// Drop every managed object, including the ledger.
    DropAll,
    FullReset,
}

impl fmt::Display for ResetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResetMode::ResetOnly => "reset-only",
            ResetMode::DropAll => "drop-all",
            ResetMode::FullReset => "full-reset",
        })
    }
}

impl FromStr for ResetMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reset-only" => Ok(ResetMode::ResetOnly),
            "drop-all" => Ok(ResetMode::DropAll),
            "full-reset" => Ok(ResetMode::FullReset),
            other => Err(Error::Config(format!(
                "unknown reset mode {other} (expected reset-only, drop-all or full-reset)"
            ))),
        }
    }
}

pub struct Reset {
    db: Arc<Database>,
    ledger: Ledger,
}

impl Reset {
    pub fn new(db: Arc<Database>, ledger: Ledger) -> Self {
        Self { db, ledger }
    }

    pub fn execute(&self, mode: ResetMode) -> Result<()> {
        warn!("running destructive reset: {mode}");
        match mode {
            ResetMode::ResetOnly => self.reset_ledger(),
            ResetMode::DropAll => self.drop_all_managed_objects(),
            ResetMode::FullReset => self.full_reset(),
        }
    }

    /// Delete every ledger row. No-op when the ledger table does not exist.
    pub fn reset_ledger(&self) -> Result<()> {
        let conn = self.db.connection()?;
        if !self.ledger.exists(&conn)? {
            info!("ledger table {} does not exist, nothing to clear", self.ledger.table());
            return Ok(());
        }

        let removed = conn
            .execute(&format!("DELETE FROM \"{}\"", self.ledger.table()), [])
            .map_err(|e| Error::Reset {
                object: self.ledger.table().to_string(),
                message: e.to_string(),
            })?;
        info!("cleared {removed} ledger row(s) from {}", self.ledger.table());
        Ok(())
    }

    /// Drop the managed objects, then the ledger and its lock table.
    /// Stops at the first failure; statements already run stay committed.
    pub fn drop_all_managed_objects(&self) -> Result<()> {
        let conn = self.db.connection()?;

        let ledger_tables = [self.ledger.table().to_string(), self.ledger.lock_table()];
        let targets = MANAGED_OBJECTS
            .iter()
            .map(|o| (o.kind, o.name.to_string()))
            .chain(ledger_tables.into_iter().map(|t| (ObjectKind::Table, t)));

        for (kind, name) in targets {
            conn.execute_batch(&drop_statement(kind, &name))
                .map_err(|e| Error::Reset {
                    object: name.clone(),
                    message: e.to_string(),
                })?;
            info!("dropped {} {name}", kind.keyword().to_lowercase());
        }
        Ok(())
    }

    pub fn full_reset(&self) -> Result<()> {
        self.drop_all_managed_objects()?;
        self.reset_ledger()
    }
}

fn drop_statement(kind: ObjectKind, name: &str) -> String {
    format!("DROP {} IF EXISTS \"{name}\";", kind.keyword())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::ledger::table_exists;
    use crate::runner::Runner;
    use crate::script_store::ScriptStore;

    fn sample_migrations() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../migrations")
    }

    fn migrated() -> (Arc<Database>, Runner, Reset) {
        let db = Arc::new(Database::in_memory().unwrap());
        let runner = Runner::new(
            Arc::clone(&db),
            ScriptStore::new(sample_migrations()),
            Ledger::default(),
        );
        runner.run_migrations().unwrap();
        let reset = Reset::new(Arc::clone(&db), Ledger::default());
        (db, runner, reset)
    }

    fn schema_objects(db: &Database) -> Vec<String> {
        let conn = db.connection().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn managed_list_covers_sample_schema() {
        let (db, _runner, _reset) = migrated();
        let ledger = Ledger::default();
        for name in schema_objects(&db) {
            let managed = MANAGED_OBJECTS.iter().any(|o| o.name == name)
                || name == ledger.table()
                || name == ledger.lock_table();
            assert!(managed, "{name} is not in MANAGED_OBJECTS");
        }
    }

    #[test]
    fn reset_only_clears_ledger_and_keeps_schema() {
        let (db, runner, reset) = migrated();
        reset.execute(ResetMode::ResetOnly).unwrap();

        assert_eq!(runner.check_pending().unwrap().len(), 6);
        let conn = db.connection().unwrap();
        assert!(table_exists(&conn, "users").unwrap());
    }

    #[test]
    fn full_reset_drops_everything_and_is_repeatable() {
        let (db, runner, reset) = migrated();
        reset.execute(ResetMode::FullReset).unwrap();
        assert!(schema_objects(&db).is_empty());

        reset.execute(ResetMode::FullReset).unwrap();
        reset.execute(ResetMode::DropAll).unwrap();

        let pending = runner.check_pending().unwrap();
        assert_eq!(pending.first().map(String::as_str), Some("001_create_users.sql"));
        assert_eq!(pending.len(), 6);

        // And the schema can be rebuilt from scratch.
        assert_eq!(runner.run_migrations().unwrap().applied.len(), 6);
    }

    #[test]
    fn reset_ledger_without_table_is_noop() {
        let db = Arc::new(Database::in_memory().unwrap());
        let reset = Reset::new(db, Ledger::default());
        reset.reset_ledger().unwrap();
    }

    #[test]
    fn drop_failure_names_the_object() {
        let db = Arc::new(Database::in_memory().unwrap());
        {
            let conn = db.connection().unwrap();
            // A view named like a managed table makes DROP TABLE fail.
            conn.execute_batch("CREATE VIEW users AS SELECT 1 AS id;").unwrap();
        }
        let reset = Reset::new(db, Ledger::default());
        match reset.drop_all_managed_objects() {
            Err(Error::Reset { object, .. }) => assert_eq!(object, "users"),
            other => panic!("expected reset error, got {other:?}"),
        }
    }

    #[test]
    fn parses_modes() {
        assert_eq!("reset-only".parse::<ResetMode>().unwrap(), ResetMode::ResetOnly);
        assert_eq!("drop-all".parse::<ResetMode>().unwrap(), ResetMode::DropAll);
        assert_eq!("full-reset".parse::<ResetMode>().unwrap(), ResetMode::FullReset);
        assert!("everything".parse::<ResetMode>().is_err());
        assert_eq!(ResetMode::FullReset.to_string(), "full-reset");
    }
}
