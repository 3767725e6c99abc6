pub mod database;
pub mod hook;
pub mod ledger;
pub mod lock;
#[cfg(any(test, feature = "reset"))]
pub mod reset;
pub mod runner;
pub mod script_store;
mod statements;

pub use database::{CancelHandle, Database};
pub use hook::{FailurePolicy, HookOutcome, StartupHook};
pub use ledger::{Ledger, LedgerEntry};
pub use lock::{LockGuard, LockHolder, MigrationLock};
#[cfg(any(test, feature = "reset"))]
pub use reset::{ManagedObject, ObjectKind, Reset, ResetMode};
pub use runner::{AppliedMigration, MigrationState, MigrationStatus, RunReport, Runner};
pub use script_store::{MigrationScript, ScriptStore, checksum};
